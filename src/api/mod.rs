//! REST surface under `/groupware`
//!
//! Every handler extracts a [`request::Req`], which authenticates the user
//! and resolves their Session, then calls the JMAP client and answers with
//! the response envelope of [`response`].

mod accounts;
mod blobs;
mod collections;
mod emails;
mod events;
mod index;
mod mailboxes;
mod related;
pub(crate) mod request;
pub(crate) mod response;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, ORIGIN, VARY,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::auth::UsernameProvider;
use crate::errors::{AppError, AppResult};
use crate::events::EventBus;
use crate::jmap::JmapClient;
use crate::jobs::Jobs;
use crate::metrics::Metrics;
use crate::sanitize::Sanitizer;
use crate::session_cache::SessionCache;
use response::ErrorCode;

/// JMAP keyword: printable ASCII without the characters RFC 8621 excludes
const KEYWORD_PATTERN: &str = r#"^[\x21-\x7E&&[^(){\]%*"\\]]{1,255}$"#;
const CORS_ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, REPORT, OPTIONS";
const CORS_ALLOWED_HEADERS: &str = "Authorization, Content-Type, Accept, Accept-Language, If-Match, If-None-Match, X-Request-Id";
const CORS_EXPOSED_HEADERS: &str = "ETag, Session-State, Content-Language";

/// Tunables of the REST layer
#[derive(Debug, Clone, Default)]
pub struct ApiSettings {
    /// Page size when the client gives none, `0` lets the server decide
    pub default_email_limit: u64,
    /// Truncation of fetched body values, `0` for none
    pub max_body_value_bytes: u64,
    /// Interval of SSE keepalive comments
    pub keepalive: Duration,
    /// Origins allowed to call the API from a browser, `*` for any
    pub cors_allowed_origins: Vec<String>,
    /// Cancelled on shutdown; ends the open SSE streams
    pub shutdown: CancellationToken,
}

/// Shared state of every handler
#[derive(Clone)]
pub struct Groupware {
    pub(crate) client: Arc<JmapClient>,
    pub(crate) sessions: Arc<SessionCache>,
    pub(crate) sanitizer: Arc<Sanitizer>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) jobs: Arc<Jobs>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) users: Arc<dyn UsernameProvider>,
    pub(crate) settings: Arc<ApiSettings>,
    pub(crate) keyword: Regex,
}

impl Groupware {
    /// # Errors
    ///
    /// Returns `Internal` if the keyword pattern does not compile.
    pub fn new(
        client: Arc<JmapClient>,
        sessions: Arc<SessionCache>,
        events: Arc<EventBus>,
        jobs: Arc<Jobs>,
        metrics: Arc<Metrics>,
        users: Arc<dyn UsernameProvider>,
        settings: ApiSettings,
    ) -> AppResult<Self> {
        let keyword = Regex::new(KEYWORD_PATTERN)
            .map_err(|e| AppError::Internal(format!("invalid keyword pattern: {e}")))?;
        Ok(Self {
            client,
            sessions,
            sanitizer: Arc::new(Sanitizer::new()),
            events,
            jobs,
            metrics,
            users,
            settings: Arc::new(settings),
            keyword,
        })
    }
}

/// Router of the whole service
pub fn router(state: Groupware) -> Router {
    let api = Router::new()
        .merge(accounts::router())
        .merge(mailboxes::router())
        .merge(emails::router())
        .merge(related::router())
        .merge(blobs::router())
        .merge(collections::router())
        .merge(events::router());
    Router::new()
        .route("/groupware", get(index::index))
        .route("/groupware/", get(index::index))
        .nest("/groupware", api)
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn_with_state(state.clone(), count_errors))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn render_metrics(State(state): State<Groupware>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Count every error response by its code
async fn count_errors(State(state): State<Groupware>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if let Some(ErrorCode(code)) = response.extensions().get::<ErrorCode>() {
        state.metrics.errors.with_label_values(&[code.as_str()]).inc();
    }
    response
}

fn allowed_origin(state: &Groupware, request: &Request) -> Option<HeaderValue> {
    let origin = request.headers().get(ORIGIN)?;
    let value = origin.to_str().ok()?;
    state
        .settings
        .cors_allowed_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(value))
        .then(|| origin.clone())
}

async fn cors(State(state): State<Groupware>, request: Request, next: Next) -> Response {
    let Some(origin) = allowed_origin(&state, &request) else {
        return next.run(request).await;
    };
    let preflight = request.method() == Method::OPTIONS
        && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);
    let mut response = if preflight {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(CORS_ALLOWED_METHODS));
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(CORS_ALLOWED_HEADERS));
        response
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(CORS_EXPOSED_HEADERS));
    headers.append(VARY, HeaderValue::from_static("Origin"));
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request as HttpRequest};
    use serde_json::Value;
    use tokio_util::sync::DropGuard;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::HeaderUsernameProvider;
    use crate::jmap::tests::FakeTransport;
    use crate::jobs::JobSettings;
    use crate::session_cache::SessionCacheSettings;

    pub(crate) const USER_HEADER: &str = "x-remote-user";

    pub(crate) struct TestApp {
        pub router: Router,
        pub fake: Arc<FakeTransport>,
        pub state: Groupware,
        _shutdown: DropGuard,
    }

    /// Service for user `alice` (session state `s0`) over a fake JMAP server
    pub(crate) fn app() -> TestApp {
        app_with(ApiSettings {
            keepalive: Duration::from_secs(30),
            ..Default::default()
        })
    }

    pub(crate) fn app_with(settings: ApiSettings) -> TestApp {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let client = Arc::new(JmapClient::new(fake.clone()));
        let sessions = Arc::new(SessionCache::new(
            client.clone(),
            SessionCacheSettings {
                max_capacity: 10,
                ttl: Duration::from_secs(60),
                failure_ttl: Duration::from_secs(1),
            },
            metrics.clone(),
        ));
        let shutdown = CancellationToken::new();
        let (jobs, _) = Jobs::start(
            JobSettings {
                queue_size: 10,
                workers: 2,
                timeout: Duration::from_secs(5),
            },
            metrics.clone(),
            shutdown.clone(),
        );
        let state = Groupware::new(
            client,
            sessions,
            Arc::new(EventBus::new(10, metrics.clone())),
            Arc::new(jobs),
            metrics,
            Arc::new(HeaderUsernameProvider::new(USER_HEADER).expect("header")),
            settings,
        )
        .expect("state");
        TestApp {
            router: router(state.clone()),
            fake,
            state,
            _shutdown: shutdown.drop_guard(),
        }
    }

    /// Request as user `alice`
    pub(crate) fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, "alice")
    }

    pub(crate) fn get(uri: &str) -> HttpRequest<Body> {
        request("GET", uri).body(Body::empty()).expect("request")
    }

    pub(crate) fn json(method: &str, uri: &str, body: &Value) -> HttpRequest<Body> {
        request(method, uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub(crate) async fn send_raw(app: &TestApp, request: HttpRequest<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, headers, body)
    }

    /// Status, headers and JSON body (`Null` when empty)
    pub(crate) async fn send(app: &TestApp, request: HttpRequest<Body>) -> (StatusCode, HeaderMap, Value) {
        let (status, headers, body) = send_raw(app, request).await;
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("JSON body")
        };
        (status, headers, value)
    }

    #[tokio::test]
    async fn anonymous_requests_are_rejected() {
        let app = app();
        let request = HttpRequest::builder()
            .uri("/groupware/accounts")
            .body(Body::empty())
            .expect("request");
        let (status, headers, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers[CONTENT_TYPE], response::JSON_API);
        assert_eq!(body["errors"][0]["code"], "AUTMIS");
        assert_eq!(body["errors"][0]["status"], "401");
        assert!(!body["errors"][0]["id"].as_str().unwrap_or_default().is_empty());
        assert_eq!(app.state.metrics.errors.with_label_values(&["AUTMIS"]).get(), 1);
    }

    #[tokio::test]
    async fn unknown_users_are_forbidden() {
        let app = app();
        let request = HttpRequest::builder()
            .uri("/groupware/accounts")
            .header(USER_HEADER, "mallory")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errors"][0]["code"], "AUTFOR");
    }

    #[tokio::test]
    async fn health_and_metrics_need_no_user() {
        let app = app();
        let request = HttpRequest::builder().uri("/healthz").body(Body::empty()).expect("request");
        assert_eq!(send_raw(&app, request).await.0, StatusCode::NO_CONTENT);

        let request = HttpRequest::builder().uri("/metrics").body(Body::empty()).expect("request");
        let (status, _, body) = send_raw(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("groupware_sse_dropped_events_total"));
    }

    #[tokio::test]
    async fn allowed_origins_get_cors_headers() {
        let app = app_with(ApiSettings {
            keepalive: Duration::from_secs(30),
            cors_allowed_origins: vec!["https://web.example.com".to_owned()],
            ..Default::default()
        });
        let request = HttpRequest::builder()
            .method("OPTIONS")
            .uri("/groupware/accounts")
            .header(ORIGIN, "https://web.example.com")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .expect("request");
        let (status, headers, _) = send_raw(&app, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://web.example.com");

        let request = HttpRequest::builder()
            .uri("/healthz")
            .header(ORIGIN, "https://evil.example.com")
            .body(Body::empty())
            .expect("request");
        let (_, headers, _) = send_raw(&app, request).await;
        assert!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[test]
    fn keyword_pattern_follows_jmap_keyword_syntax() {
        let keyword = Regex::new(KEYWORD_PATTERN).expect("pattern");
        for valid in ["$seen", "$Junk", "custom-label", "a/b"] {
            assert!(keyword.is_match(valid), "{valid}");
        }
        for invalid in ["", "has space", "(x)", "50%", "a\"b", "ü"] {
            assert!(!keyword.is_match(invalid), "{invalid}");
        }
    }
}
