//! Response envelope
//!
//! Successful responses carry a JSON body (or none), the JMAP state as a
//! quoted `ETag`, the `Session-State` and the `Content-Language` the JMAP
//! server answered with. Failures are JSON:API error documents.

use axum::http::header::{CONTENT_LANGUAGE, CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use crate::errors::{ApiError, ErrorDocument};

pub(crate) const JSON: &str = "application/json";
pub(crate) const JSON_API: &str = "application/vnd.api+json";
pub(crate) const SESSION_STATE: HeaderName = HeaderName::from_static("session-state");

pub(crate) type ApiResult = Result<Response, Failure>;

/// Code of the error a response carries, for the error counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorCode(pub String);

pub(crate) fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = %name, "dropping header with invalid value"),
    }
}

/// Successful response before it is written
#[derive(Debug)]
pub(crate) struct Envelope {
    pub status: StatusCode,
    pub body: Option<Vec<u8>>,
    /// JMAP state of the body; the session state stands in when empty
    pub etag: String,
    pub session_state: String,
    pub language: Option<String>,
}

impl Envelope {
    /// Write the envelope, as `304 Not Modified` if `if_none_match` is its ETag
    pub fn write(self, if_none_match: Option<&str>) -> Response {
        let etag = if self.etag.is_empty() {
            self.session_state.as_str()
        } else {
            self.etag.as_str()
        };
        let mut headers = HeaderMap::new();
        if !etag.is_empty() {
            set(&mut headers, ETAG, &format!("\"{etag}\""));
        }
        if !self.session_state.is_empty() {
            set(&mut headers, SESSION_STATE, &self.session_state);
        }
        if let Some(language) = self.language.as_deref().filter(|l| !l.is_empty()) {
            set(&mut headers, CONTENT_LANGUAGE, language);
        }
        if !etag.is_empty() && if_none_match == Some(etag) {
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }
        match self.body {
            Some(body) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
                (self.status, headers, body).into_response()
            }
            None => (self.status, headers).into_response(),
        }
    }
}

/// Failed response
#[derive(Debug)]
pub(crate) struct Failure {
    pub error: ApiError,
    pub session_state: Option<String>,
    pub etag: Option<String>,
}

impl Failure {
    pub fn new(error: ApiError) -> Self {
        Self {
            error,
            session_state: None,
            etag: None,
        }
    }

    pub fn with_session_state(mut self, session_state: &str) -> Self {
        self.session_state = Some(session_state.to_owned());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

fn log_failure(error: &ApiError) {
    let status = error.status;
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(status = status.as_u16(), code = %error.code, id = %error.id, detail = %error.detail, "request failed");
    } else if status.is_server_error() {
        error!(status = status.as_u16(), code = %error.code, id = %error.id, detail = %error.detail, "request failed");
    } else {
        debug!(status = status.as_u16(), code = %error.code, id = %error.id, detail = %error.detail, "request failed");
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        log_failure(&self.error);
        let status = self.error.status;
        let code = ErrorCode(self.error.code.clone());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_API));
        if let Some(state) = self.session_state.as_deref().filter(|s| !s.is_empty()) {
            set(&mut headers, SESSION_STATE, state);
        }
        if let Some(etag) = self.etag.as_deref().filter(|e| !e.is_empty()) {
            set(&mut headers, ETAG, &format!("\"{etag}\""));
        }
        let body = match serde_json::to_vec(&ErrorDocument {
            errors: vec![self.error],
        }) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to serialize error document");
                Vec::new()
            }
        };
        let mut response = (status, headers, body).into_response();
        response.extensions_mut().insert(code);
        response
    }
}
