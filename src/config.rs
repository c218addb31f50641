//! Gateway configuration
//!
//! All configuration is loaded from environment variables prefixed with
//! `GROUPWARE_`. Only the master credentials toward the JMAP server are
//! required; everything else has a default.

use std::env;
use std::env::VarError;
use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

const DEFAULT_BASE_URL: &str = "https://localhost:8443";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9276";
const DEFAULT_USER_HEADER: &str = "x-remote-user";

/// Connection to the JMAP server
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Base URL; the Session lives at `<base>/.well-known/jmap`
    pub base_url: Url,
    /// Master user impersonating end users toward the JMAP server
    pub master_username: String,
    /// Master password, never logged
    pub master_password: SecretString,
    /// Page size of email listings without `limit`, `0` lets the server decide
    pub default_email_limit: u64,
    /// Truncation of fetched body values, `0` for none
    pub max_body_value_bytes: u64,
    /// Deadline for the JMAP server to start answering
    pub response_header_timeout: Duration,
    pub session_cache_max_capacity: usize,
    pub session_cache_ttl: Duration,
    pub session_cache_failure_ttl: Duration,
    /// Deployment-wide switch ignoring untrusted certificates
    pub cs3_allow_insecure: bool,
    /// Skip TLS verification toward the JMAP server
    pub tls_insecure_skip_verify: bool,
}

impl MailConfig {
    /// Whether certificates of the JMAP server go unchecked
    pub fn accept_invalid_certs(&self) -> bool {
        self.tls_insecure_skip_verify || self.cs3_allow_insecure
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mail: MailConfig,
    /// Listener address of the HTTP server
    pub http_addr: SocketAddr,
    /// Origins allowed to call the API from a browser, `*` for any
    pub cors_allowed_origins: Vec<String>,
    /// Header carrying the authenticated username
    pub user_header: String,
    pub jobs_queue_size: usize,
    pub jobs_workers: usize,
    pub jobs_timeout: Duration,
    /// Capacity of the buffer of every SSE stream
    pub events_buffer_size: usize,
    pub events_keepalive: Duration,
}

impl GatewayConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Config` if the master credentials are missing or a variable
    /// is set to a malformed value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GROUPWARE_MAIL_BASE_URL=https://stalwart.example.com
    /// GROUPWARE_MAIL_MASTER_USERNAME=master
    /// GROUPWARE_MAIL_MASTER_PASSWORD=secret
    /// GROUPWARE_HTTP_ADDR=0.0.0.0:9276
    /// GROUPWARE_HTTP_CORS_ALLOWED_ORIGINS=https://web.example.com
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let base_url = optional_env("GROUPWARE_MAIL_BASE_URL")?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let base_url = parse_base_url(&base_url)?;
        let http_addr = optional_env("GROUPWARE_HTTP_ADDR")?
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_owned());

        Ok(Self {
            mail: MailConfig {
                base_url,
                master_username: required_env("GROUPWARE_MAIL_MASTER_USERNAME")?,
                master_password: SecretString::new(
                    required_env("GROUPWARE_MAIL_MASTER_PASSWORD")?.into(),
                ),
                default_email_limit: parse_u64_env("GROUPWARE_MAIL_DEFAULT_EMAIL_LIMIT", 0)?,
                max_body_value_bytes: parse_u64_env("GROUPWARE_MAIL_MAX_BODY_VALUE_BYTES", 0)?,
                response_header_timeout: parse_duration_ms_env(
                    "GROUPWARE_MAIL_RESPONSE_HEADER_TIMEOUT_MS",
                    10_000,
                )?,
                session_cache_max_capacity: parse_usize_env(
                    "GROUPWARE_MAIL_SESSION_CACHE_MAX_CAPACITY",
                    10_000,
                )?,
                session_cache_ttl: parse_duration_ms_env("GROUPWARE_MAIL_SESSION_CACHE_TTL_MS", 300_000)?,
                session_cache_failure_ttl: parse_duration_ms_env(
                    "GROUPWARE_MAIL_SESSION_CACHE_FAILURE_TTL_MS",
                    15_000,
                )?,
                cs3_allow_insecure: parse_bool_env("GROUPWARE_MAIL_CS3_ALLOW_INSECURE", false)?,
                tls_insecure_skip_verify: parse_bool_env("GROUPWARE_MAIL_TLS_INSECURE_SKIP_VERIFY", true)?,
            },
            http_addr: parse_socket_addr("GROUPWARE_HTTP_ADDR", &http_addr)?,
            cors_allowed_origins: parse_list(
                &optional_env("GROUPWARE_HTTP_CORS_ALLOWED_ORIGINS")?.unwrap_or_default(),
            ),
            user_header: optional_env("GROUPWARE_AUTH_USER_HEADER")?
                .unwrap_or_else(|| DEFAULT_USER_HEADER.to_owned()),
            jobs_queue_size: parse_usize_env("GROUPWARE_JOBS_QUEUE_SIZE", 100)?,
            jobs_workers: parse_usize_env("GROUPWARE_JOBS_WORKERS", 10)?,
            jobs_timeout: parse_duration_ms_env("GROUPWARE_JOBS_TIMEOUT_MS", 30_000)?,
            events_buffer_size: parse_usize_env("GROUPWARE_EVENTS_BUFFER_SIZE", 100)?,
            events_keepalive: Duration::from_secs(parse_u64_env("GROUPWARE_EVENTS_KEEPALIVE_SECONDS", 30)?.max(1)),
        })
    }
}

/// Parse the JMAP base URL, which must be absolute `http(s)`
///
/// A trailing slash is added so that relative joins keep the base path.
fn parse_base_url(value: &str) -> AppResult<Url> {
    let mut value = value.trim().to_owned();
    if !value.ends_with('/') {
        value.push('/');
    }
    let url = Url::parse(&value)
        .map_err(|e| AppError::config(format!("invalid GROUPWARE_MAIL_BASE_URL '{value}': {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(AppError::config(format!(
            "GROUPWARE_MAIL_BASE_URL must be an absolute http(s) URL, got '{value}'"
        ))),
    }
}

/// Parse a listener address
///
/// # Errors
///
/// Returns `Config` if `value` is not `ip:port`.
pub fn parse_socket_addr(key: &str, value: &str) -> AppResult<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::config(format!("invalid socket address in {key}: '{value}'")))
}

/// Split a comma-separated list, dropping empty entries
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::config(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; empty counts as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `Config` if the variable is set to an unrecognized value.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::config(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<usize>().map_err(|_| {
            AppError::config(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a millisecond duration with default fallback
fn parse_duration_ms_env(key: &str, default_ms: u64) -> AppResult<Duration> {
    parse_u64_env(key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::{parse_base_url, parse_bool_value, parse_list, parse_socket_addr};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn base_url_keeps_its_path_for_joins() {
        let url = parse_base_url("https://mail.example.com/jmap").expect("valid");
        assert_eq!(
            url.join(".well-known/jmap").expect("join").as_str(),
            "https://mail.example.com/jmap/.well-known/jmap"
        );
    }

    #[test]
    fn base_url_must_be_absolute_http() {
        for invalid in ["mail.example.com", "ftp://mail.example.com", "not a url"] {
            assert!(parse_base_url(invalid).is_err(), "{invalid}");
        }
    }

    #[test]
    fn lists_and_addresses_parse() {
        assert_eq!(
            parse_list(" https://a.example.com, ,https://b.example.com "),
            vec!["https://a.example.com", "https://b.example.com"]
        );
        assert!(parse_list("").is_empty());
        assert_eq!(
            parse_socket_addr("K", "0.0.0.0:9276").expect("addr").port(),
            9276
        );
        assert!(parse_socket_addr("K", "localhost").is_err());
    }
}
