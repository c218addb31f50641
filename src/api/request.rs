//! Per-request context of the REST handlers
//!
//! [`Req`] resolves the user and their Session before a handler runs, and
//! offers the account resolution, parameter parsing and response building
//! every handler shares.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{FromRequestParts, Query, RawPathParams};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error};

use super::Groupware;
use super::response::{ApiResult, Envelope, Failure};
use crate::errors::{ApiError, ErrorSource, GroupwareError, error_id};
use crate::jmap::model::SetError;
use crate::jmap::session::AccountRole;
use crate::jmap::{JmapError, Reply, Session};
use crate::metrics::{Exemplar, Metrics};
use crate::sanitize::SanitizeError;

/// Path value standing for "the primary account of the role"
pub(crate) const DEFAULT_ACCOUNT_ID: &str = "_";
pub(crate) const ACCOUNT_ID_PARAM: &str = "accountid";
const REQUEST_ID_HEADER: &str = "x-request-id";
const TRACEPARENT_HEADER: &str = "traceparent";
const SET_ERROR_NOT_FOUND: &str = "notFound";
/// Longest raw parameter value echoed back in an error detail
const MAX_ECHOED_VALUE: usize = 64;

/// Printable, bounded rendition of untrusted input
fn echo(value: &str) -> String {
    value
        .chars()
        .take(MAX_ECHOED_VALUE)
        .flat_map(char::escape_default)
        .collect()
}

/// Trace id of a W3C `traceparent` header
fn trace_id(traceparent: &str) -> Option<&str> {
    let mut fields = traceparent.trim().split('-');
    let version = fields.next()?;
    let trace_id = fields.next()?;
    let valid = version.len() == 2
        && version != "ff"
        && trace_id.len() == 32
        && trace_id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && trace_id.bytes().any(|b| b != b'0');
    valid.then_some(trace_id)
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Entity tag without quotes and weak marker
fn entity_tag(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn missing_capability(role: AccountRole) -> &'static GroupwareError {
    match role {
        AccountRole::Mail => &GroupwareError::MISSING_CAP_MAIL,
        AccountRole::Submission => &GroupwareError::MISSING_CAP_SUBMISSION,
        AccountRole::Blob => &GroupwareError::MISSING_CAP_BLOB,
        AccountRole::VacationResponse => &GroupwareError::MISSING_CAP_VACATION,
        AccountRole::Quota => &GroupwareError::MISSING_CAP_QUOTA,
        AccountRole::Task => &GroupwareError::MISSING_CAP_TASK,
        AccountRole::Calendar => &GroupwareError::MISSING_CAP_CALENDAR,
        AccountRole::Contact => &GroupwareError::MISSING_CAP_CONTACT,
    }
}

/// Authenticated request with its Session
pub(crate) struct Req {
    pub username: String,
    pub session: Arc<Session>,
    pub request_id: Option<String>,
    /// Trace of the request, from `traceparent`
    pub trace_id: Option<String>,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    path: HashMap<String, String>,
    metrics: Arc<Metrics>,
}

impl FromRequestParts<Groupware> for Req {
    type Rejection = Failure;

    async fn from_request_parts(parts: &mut Parts, state: &Groupware) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let trace_id = parts
            .headers
            .get(TRACEPARENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(trace_id)
            .map(str::to_owned);

        let Some(username) = state.users.username(&parts.headers) else {
            return Err(Failure::new(ApiError::new(
                error_id(request_id.as_deref()),
                &GroupwareError::MISSING_AUTHENTICATION,
            )));
        };

        let session = match state.sessions.get(&username).await {
            Ok(session) => session,
            Err(e) => {
                debug!(username = %username, kind = %e.kind, error = %e.message, "failed to obtain session");
                return Err(Failure::new(ApiError::new(
                    error_id(request_id.as_deref()),
                    &GroupwareError::from_jmap(e.kind),
                )));
            }
        };

        let path = match RawPathParams::from_request_parts(parts, state).await {
            Ok(params) => params
                .iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            Err(_) => HashMap::new(),
        };

        let query = match Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
            Ok(Query(pairs)) => pairs,
            Err(e) => {
                debug!(username = %username, error = %e.body_text(), "malformed query string");
                state
                    .metrics
                    .parameter_errors
                    .with_label_values(&[GroupwareError::INVALID_REQUEST_PARAMETER.code])
                    .inc();
                return Err(Failure::new(
                    ApiError::new(
                        error_id(request_id.as_deref()),
                        &GroupwareError::INVALID_REQUEST_PARAMETER,
                    )
                    .with_detail("The query string is malformed"),
                )
                .with_session_state(&session.state));
            }
        };

        Ok(Self {
            username,
            session,
            request_id,
            trace_id,
            headers: parts.headers.clone(),
            query,
            path,
            metrics: Arc::clone(&state.metrics),
        })
    }
}

impl Req {
    fn error_id(&self) -> String {
        error_id(self.request_id.as_deref())
    }

    /// Identifiers bound to the latency observations of this request
    pub fn exemplar(&self) -> Exemplar<'_> {
        Exemplar {
            request_id: self.request_id.as_deref(),
            trace_id: self.trace_id.as_deref(),
        }
    }

    /// Failure of `kind` carrying the current session state
    pub fn error(&self, kind: &GroupwareError) -> Failure {
        Failure::new(ApiError::new(self.error_id(), kind)).with_session_state(&self.session.state)
    }

    pub fn parameter_error(&self, param: &str, detail: impl Into<String>) -> Failure {
        self.metrics
            .parameter_errors
            .with_label_values(&[GroupwareError::INVALID_REQUEST_PARAMETER.code])
            .inc();
        let mut failure = self.error(&GroupwareError::INVALID_REQUEST_PARAMETER);
        failure.error = failure
            .error
            .with_source(ErrorSource::Parameter(param.to_owned()))
            .with_detail(detail);
        failure
    }

    pub fn body_error(&self, pointer: &str, detail: impl Into<String>) -> Failure {
        let mut failure = self.error(&GroupwareError::INVALID_REQUEST_BODY);
        failure.error = failure
            .error
            .with_source(ErrorSource::Pointer(pointer.to_owned()))
            .with_detail(detail);
        failure
    }

    /// Map an upstream error and count it
    pub fn jmap_error(&self, err: JmapError) -> Failure {
        self.metrics
            .jmap_errors
            .with_label_values(&[self.session.endpoint.as_str(), err.kind.as_str()])
            .inc();
        debug!(
            username = %self.username,
            endpoint = %self.session.endpoint,
            kind = %err.kind,
            error = %err.message,
            "JMAP request failed"
        );
        self.error(&GroupwareError::from_jmap(err.kind))
    }

    pub fn sanitize_error(&self, err: SanitizeError) -> Failure {
        error!(username = %self.username, error = %err, "failed to sanitize email");
        self.error(&GroupwareError::FAILED_TO_SANITIZE_EMAIL)
    }

    /// Path parameter `name`
    ///
    /// # Errors
    ///
    /// The route does not capture `name`.
    pub fn path(&self, name: &str) -> Result<&str, Failure> {
        self.path
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| self.parameter_error(name, format!("Missing path parameter '{name}'")))
    }

    /// Account the request addresses for `role`
    ///
    /// A missing or `_` account id path segment selects the primary account
    /// of the role. The account must expose the role's capability.
    ///
    /// # Errors
    ///
    /// `INVACC` if no account can be determined or it does not exist, a
    /// missing-capability error otherwise.
    pub fn account(&self, role: AccountRole) -> Result<String, Failure> {
        let requested = self
            .path
            .get(ACCOUNT_ID_PARAM)
            .map(String::as_str)
            .filter(|id| !id.is_empty() && *id != DEFAULT_ACCOUNT_ID);
        let account_id = match requested {
            Some(id) => id,
            None => self
                .session
                .primary_accounts
                .for_role(role)
                .ok_or_else(|| {
                    let mut failure = self.error(&GroupwareError::NON_EXISTING_ACCOUNT);
                    failure.error = failure
                        .error
                        .with_source(ErrorSource::Parameter(ACCOUNT_ID_PARAM.to_owned()))
                        .with_detail("Failed to determine the account to use");
                    failure
                })?,
        };
        let Some(account) = self.session.accounts.get(account_id) else {
            let mut failure = self.error(&GroupwareError::NON_EXISTING_ACCOUNT);
            failure.error = failure
                .error
                .with_source(ErrorSource::Parameter(ACCOUNT_ID_PARAM.to_owned()))
                .with_detail(format!("The account '{}' does not exist", echo(account_id)));
            return Err(failure);
        };
        if !account.has_capability(role.capability()) {
            return Err(self.error(missing_capability(role)));
        }
        Ok(account_id.to_owned())
    }

    /// Every account exposing the capability of `role`
    ///
    /// # Errors
    ///
    /// A missing-capability error when no account has it.
    pub fn accounts_with(&self, role: AccountRole) -> Result<Vec<String>, Failure> {
        let ids = self.session.account_ids_with(role.capability());
        if ids.is_empty() {
            return Err(self.error(missing_capability(role)));
        }
        Ok(ids)
    }

    /// Last non-empty value of query parameter `name`
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .rev()
            .find(|(key, value)| key == name && !value.is_empty())
            .map(|(_, value)| value.as_str())
    }

    /// Every non-empty value of a repeated query parameter, split on commas
    pub fn query_all(&self, name: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// `prefix.<key>` query parameters as a map of `key` to value
    pub fn parse_map(&self, prefix: &str) -> BTreeMap<String, String> {
        self.query
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .and_then(|k| k.strip_prefix('.'))
                    .filter(|k| !k.is_empty() && !value.is_empty())
                    .map(|k| (k.to_owned(), value.clone()))
            })
            .collect()
    }

    fn parse_with<T>(
        &self,
        name: &str,
        expected: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<Option<T>, Failure> {
        let Some(raw) = self.query(name) else {
            return Ok(None);
        };
        match parse(raw) {
            Some(value) => Ok(Some(value)),
            None => Err(self.parameter_error(
                name,
                format!("Invalid {expected} value for query parameter '{name}': '{}'", echo(raw)),
            )),
        }
    }

    /// `None` when the parameter is absent or empty
    pub fn parse_i64(&self, name: &str) -> Result<Option<i64>, Failure> {
        self.parse_with(name, "numeric", |raw| raw.parse().ok())
    }

    /// Offset or limit, negative values clamped to zero
    pub fn parse_count(&self, name: &str) -> Result<Option<u64>, Failure> {
        Ok(self
            .parse_i64(name)?
            .map(|n| u64::try_from(n).unwrap_or(0)))
    }

    pub fn parse_bool(&self, name: &str) -> Result<Option<bool>, Failure> {
        self.parse_with(name, "boolean", parse_bool_value)
    }

    /// RFC 3339 timestamp
    pub fn parse_date(&self, name: &str) -> Result<Option<DateTime<Utc>>, Failure> {
        self.parse_with(name, "RFC 3339", |raw| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        })
    }

    /// Decode a JSON request body
    ///
    /// # Errors
    ///
    /// `INVREQB` pointing at the document root.
    pub fn body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, Failure> {
        serde_json::from_slice(body).map_err(|e| {
            debug!(username = %self.username, error = %e, "failed to decode request body");
            self.body_error("/", "The request body is not valid JSON of the expected shape")
        })
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Language to forward to the JMAP server
    pub fn language(&self) -> Option<&str> {
        self.header(header::ACCEPT_LANGUAGE)
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header(header::IF_NONE_MATCH).map(entity_tag)
    }

    pub fn if_match(&self) -> Option<&str> {
        self.header(header::IF_MATCH).map(entity_tag)
    }

    /// Whether the client asked for `media_type` in its `Accept` header
    pub fn accepts(&self, media_type: &str) -> bool {
        self.header(header::ACCEPT).is_some_and(|accept| {
            accept
                .split(',')
                .filter_map(|r| r.split(';').next())
                .any(|r| r.trim().eq_ignore_ascii_case(media_type))
        })
    }

    /// Whether the request body is of `media_type`
    pub fn content_type_is(&self, media_type: &str) -> bool {
        self.header(header::CONTENT_TYPE)
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .is_some_and(|ct| ct.essence_str().eq_ignore_ascii_case(media_type))
    }

    /// Serialize `body` into a response
    pub fn respond<T: Serialize>(
        &self,
        status: StatusCode,
        body: &T,
        session_state: &str,
        etag: &str,
        language: Option<&str>,
    ) -> ApiResult {
        let body = serde_json::to_vec(body).map_err(|e| {
            error!(error = %e, "failed to serialize response body");
            self.error(&GroupwareError::GENERIC)
        })?;
        Ok(Envelope {
            status,
            body: Some(body),
            etag: etag.to_owned(),
            session_state: session_state.to_owned(),
            language: language.map(str::to_owned),
        }
        .write(if status == StatusCode::OK { self.if_none_match() } else { None }))
    }

    /// `200` with the value of `reply`, its state as ETag
    pub fn ok<T: Serialize>(&self, reply: &Reply<T>) -> ApiResult {
        self.respond(
            StatusCode::OK,
            &reply.value,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        )
    }

    pub fn created<T: Serialize>(&self, reply: &Reply<T>) -> ApiResult {
        self.respond(
            StatusCode::CREATED,
            &reply.value,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        )
    }

    pub fn no_content(&self, session_state: &str, etag: &str) -> ApiResult {
        Ok(Envelope {
            status: StatusCode::NO_CONTENT,
            body: None,
            etag: etag.to_owned(),
            session_state: session_state.to_owned(),
            language: None,
        }
        .write(None))
    }

    /// Outcome of a destroy: `204`, or `kind` listing the description of
    /// every id that was not destroyed
    ///
    /// With `idempotent`, ids the server no longer knows count as destroyed.
    pub fn deleted(
        &self,
        kind: &GroupwareError,
        reply: &Reply<BTreeMap<String, SetError>>,
        idempotent: bool,
    ) -> ApiResult {
        let meta: Map<String, Value> = reply
            .value
            .iter()
            .filter(|(_, err)| !(idempotent && err.kind == SET_ERROR_NOT_FOUND))
            .map(|(id, err)| {
                let description = err.description.clone().unwrap_or_else(|| err.kind.clone());
                (id.clone(), Value::String(description))
            })
            .collect();
        if meta.is_empty() {
            return self.no_content(&reply.session_state, &reply.state);
        }
        let mut failure = self
            .error(kind)
            .with_session_state(&reply.session_state)
            .with_etag(reply.state.clone());
        failure.error = failure.error.with_meta(meta);
        Err(failure)
    }

    pub fn not_found(&self, session_state: &str) -> Failure {
        self.error(&GroupwareError::OBJECT_NOT_FOUND)
            .with_session_state(session_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_come_from_valid_traceparents() {
        assert_eq!(
            trace_id("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
        for invalid in [
            "",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4bf92f35-00f067aa0ba902b7-01",
        ] {
            assert_eq!(trace_id(invalid), None, "{invalid}");
        }
    }

    #[test]
    fn entity_tags_lose_quotes_and_weak_marker() {
        assert_eq!(entity_tag("\"s0\""), "s0");
        assert_eq!(entity_tag("W/\"s0\""), "s0");
        assert_eq!(entity_tag(" s0 "), "s0");
    }

    #[test]
    fn booleans_follow_the_strconv_set() {
        assert_eq!(parse_bool_value("T"), Some(true));
        assert_eq!(parse_bool_value("False"), Some(false));
        assert_eq!(parse_bool_value("yes"), None);
    }

    #[test]
    fn echoed_values_are_bounded_and_escaped() {
        assert_eq!(echo("a\nb"), "a\\nb");
        assert_eq!(echo(&"x".repeat(100)).len(), MAX_ECHOED_VALUE);
    }
}
