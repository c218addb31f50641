//! groupware-gateway: REST/JSON:API facade over a JMAP groupware server
//!
//! The gateway resolves the JMAP Session of every authenticated user, translates
//! REST requests into JMAP method calls, sanitizes email bodies and pushes the
//! results of background enrichment jobs over Server-Sent Events.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, wiring and HTTP serving
//! - [`config`]: Environment-driven configuration
//! - [`errors`]: Process errors and the REST error catalogue
//! - [`auth`]: Username of the authenticated user
//! - [`jmap`]: JMAP client, transport and data model
//! - [`session_cache`]: Per-user Session cache with single-flight loading
//! - [`api`]: REST handlers and the response envelope
//! - [`sanitize`]: HTML sanitization of email bodies
//! - [`events`]: Per-user event bus behind the SSE streams
//! - [`jobs`]: Bounded background job queue
//! - [`jscontact`]: JSContact card model
//! - [`patch`]: JSON-pointer patch objects
//! - [`metrics`]: Prometheus metric families

mod api;
mod auth;
mod config;
mod errors;
mod events;
mod jmap;
mod jobs;
mod jscontact;
mod metrics;
mod patch;
mod sanitize;
mod session_cache;

use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::{ApiSettings, Groupware};
use auth::HeaderUsernameProvider;
use config::GatewayConfig;
use errors::{AppError, AppResult};
use events::EventBus;
use jmap::http::{HttpJmapTransport, HttpTransportSettings, RequestListener};
use jmap::{JmapClient, SessionEventListener};
use jobs::{JobSettings, Jobs};
use metrics::Metrics;
use session_cache::{SessionCache, SessionCacheSettings};

/// Stateless REST gateway in front of a JMAP groupware server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
    /// Listener address, overrides GROUPWARE_HTTP_ADDR
    #[arg(long)]
    addr: Option<String>,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, wires the services
/// and serves HTTP until SIGINT or SIGTERM.
///
/// # Environment Variables
///
/// See [`GatewayConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = GatewayConfig::load_from_env()?;
    if let Some(addr) = cli.addr.as_deref() {
        config.http_addr = config::parse_socket_addr("--addr", addr)?;
    }
    if cli.check_config {
        info!(
            base_url = %config.mail.base_url,
            addr = %config.http_addr,
            master_username = %config.mail.master_username,
            "configuration is valid"
        );
        return Ok(());
    }
    if config.mail.accept_invalid_certs() {
        warn!(base_url = %config.mail.base_url, "TLS certificates of the JMAP server are not verified");
    }

    serve(config).await?;
    Ok(())
}

async fn serve(config: GatewayConfig) -> AppResult<()> {
    let metrics = Arc::new(Metrics::new()?);
    let listener: Arc<dyn RequestListener> = metrics.clone();
    let transport = HttpJmapTransport::new(
        HttpTransportSettings {
            base_url: config.mail.base_url.clone(),
            master_username: config.mail.master_username.clone(),
            master_password: config.mail.master_password.clone(),
            response_header_timeout: config.mail.response_header_timeout,
            accept_invalid_certs: config.mail.accept_invalid_certs(),
        },
        listener,
    )
    .map_err(|e| AppError::config(format!("failed to create JMAP transport: {e}")))?;
    let client = Arc::new(JmapClient::new(Arc::new(transport)));

    let sessions = Arc::new(SessionCache::new(
        client.clone(),
        SessionCacheSettings {
            max_capacity: config.mail.session_cache_max_capacity,
            ttl: config.mail.session_cache_ttl,
            failure_ttl: config.mail.session_cache_failure_ttl,
        },
        metrics.clone(),
    ));
    let outdated: Weak<dyn SessionEventListener> =
        Arc::downgrade(&(sessions.clone() as Arc<dyn SessionEventListener>));
    client.add_session_event_listener(outdated);

    let shutdown = CancellationToken::new();
    let cleanup_interval = config.mail.session_cache_failure_ttl.max(Duration::from_secs(1));
    let cleanup = sessions.spawn_cleanup(cleanup_interval, shutdown.clone());
    let (jobs, workers) = Jobs::start(
        JobSettings {
            queue_size: config.jobs_queue_size,
            workers: config.jobs_workers,
            timeout: config.jobs_timeout,
        },
        metrics.clone(),
        shutdown.clone(),
    );

    let state = Groupware::new(
        client,
        sessions,
        Arc::new(EventBus::new(config.events_buffer_size, metrics.clone())),
        Arc::new(jobs),
        metrics,
        Arc::new(HeaderUsernameProvider::new(&config.user_header)?),
        ApiSettings {
            default_email_limit: config.mail.default_email_limit,
            max_body_value_bytes: config.mail.max_body_value_bytes,
            keepalive: config.events_keepalive,
            cors_allowed_origins: config.cors_allowed_origins.clone(),
            shutdown: shutdown.clone(),
        },
    )?;

    let listener = TcpListener::bind(config.http_addr)
        .await
        .map_err(|e| AppError::config(format!("failed to bind {}: {e}", config.http_addr)))?;
    info!(addr = %config.http_addr, base_url = %config.mail.base_url, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(|e| AppError::Internal(format!("HTTP server failed: {e}")))?;

    shutdown.cancel();
    for handle in workers.into_iter().chain(std::iter::once(cleanup)) {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM and cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => {},
    }
    info!("shutting down");
    shutdown.cancel();
}
