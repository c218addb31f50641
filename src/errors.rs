//! Application error model with JSON:API error mapping
//!
//! `AppError` covers process-level failures (configuration, startup). Every
//! failure that crosses the HTTP boundary is described by a static
//! [`GroupwareError`] and rendered as a JSON:API [`ApiError`] object with a
//! fresh correlation id.

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::jmap::JmapErrorKind;

/// Application error type
///
/// Raised while configuring and starting the service. Request-scoped failures
/// use [`ApiError`] instead.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Config`
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

/// Static descriptor of a REST error kind
///
/// Status, code, title and detail never change between occurrences; the
/// per-occurrence data (id, source, meta) lives on [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupwareError {
    pub status: StatusCode,
    pub code: &'static str,
    pub title: &'static str,
    pub detail: &'static str,
}

macro_rules! groupware_errors {
    ($($name:ident => ($status:ident, $code:literal, $title:literal, $detail:literal);)*) => {
        impl GroupwareError {
            $(
                pub const $name: Self = Self {
                    status: StatusCode::$status,
                    code: $code,
                    title: $title,
                    detail: $detail,
                };
            )*
        }
    };
}

groupware_errors! {
    GENERIC => (INTERNAL_SERVER_ERROR, "ERRGEN", "Unspecific Error", "Error without a specific description.");
    MISSING_AUTHENTICATION => (UNAUTHORIZED, "AUTMIS", "Missing Authentication", "No authentication credentials were provided.");
    FORBIDDEN => (FORBIDDEN, "AUTFOR", "Invalid Authentication", "Authentication credentials were provided but are either invalid or not authorized to perform the request operation.");
    INVALID_BACKEND_REQUEST => (INTERNAL_SERVER_ERROR, "INVREQ", "Invalid Request", "The request that was meant to be sent to the mail server is invalid, which might be caused by configuration issues.");
    SERVER_RESPONSE => (SERVICE_UNAVAILABLE, "SRVRSP", "Server responds with an Error", "The mail server responded with an error.");
    STREAMING_RESPONSE => (INTERNAL_SERVER_ERROR, "SRVRST", "Server Response Body could not be streamed", "The mail server response body could not be streamed.");
    READING_RESPONSE => (INTERNAL_SERVER_ERROR, "SRVRRE", "Server Response Body could not be read", "The mail server response body could not be read.");
    DECODING_RESPONSE => (INTERNAL_SERVER_ERROR, "SRVDRB", "Server Response Body could not be decoded", "The mail server response body could not be decoded.");
    ENCODING_REQUEST_BODY => (INTERNAL_SERVER_ERROR, "ENCREQ", "Failed to encode the Request Body", "Failed to encode the body of the request to be sent to the mail server.");
    CREATING_REQUEST => (INTERNAL_SERVER_ERROR, "CREREQ", "Failed to create the Request", "Failed to create the request to be sent to the mail server.");
    SENDING_REQUEST => (INTERNAL_SERVER_ERROR, "SNDREQ", "Failed to send the Request", "Failed to send the request to the mail server.");
    INVALID_SESSION_RESPONSE => (INTERNAL_SERVER_ERROR, "INVSES", "Invalid JMAP Session Response", "The JMAP session response that was provided by the mail server is invalid.");
    INVALID_REQUEST_PAYLOAD => (INTERNAL_SERVER_ERROR, "INVRQP", "Invalid Request Payload", "The request to the mail server is invalid.");
    INVALID_RESPONSE_PAYLOAD => (INTERNAL_SERVER_ERROR, "INVRSP", "Invalid Response Payload", "The payload of the response received from the mail server is invalid.");
    INVALID_REQUEST_PARAMETER => (BAD_REQUEST, "INVREQP", "Invalid Request Parameter", "At least one of the parameters in the request is invalid.");
    INVALID_REQUEST_BODY => (BAD_REQUEST, "INVREQB", "Invalid Request Body", "The body of the request is invalid.");
    INVALID_USER_REQUEST => (BAD_REQUEST, "INVURQ", "Invalid Request", "The request is invalid.");
    NON_EXISTING_ACCOUNT => (BAD_REQUEST, "INVACC", "Invalid Account Parameter", "The account the request is for does not exist.");
    INDETERMINATE_ACCOUNT => (BAD_REQUEST, "INDACC", "Failed to determine Account", "The account the request is for could not be determined.");
    API_INCONSISTENCY => (INTERNAL_SERVER_ERROR, "APIINC", "API Inconsistency", "Internal APIs returned unexpected data.");
    INVALID_GROUPWARE_REQUEST => (INTERNAL_SERVER_ERROR, "GPRERR", "Internal Request Error", "The request constructed by the Groupware is regarded as invalid by the Mail server.");
    SERVER_UNAVAILABLE => (SERVICE_UNAVAILABLE, "SRVUNA", "Mail Server is unavailable", "The Mail Server is currently unable to process the request.");
    SERVER_FAILURE => (INTERNAL_SERVER_ERROR, "SRVFLR", "Mail Server is unable to process the Request", "The Mail Server is unable to process the request.");
    FORBIDDEN_OPERATION => (FORBIDDEN, "FRBOPR", "The Operation is forbidden by the Mail Server", "The Mail Server refuses to perform the request.");
    ACCOUNT_NOT_FOUND => (NOT_FOUND, "ACCNFD", "The referenced Account does not exist", "The Account that was referenced in the request does not exist.");
    ACCOUNT_NOT_SUPPORTED_BY_METHOD => (FORBIDDEN, "ACCNSM", "The referenced Account does not support the requested method", "The Account that was referenced in the request does not support the requested method or data type.");
    ACCOUNT_READ_ONLY => (FORBIDDEN, "ACCRDO", "The referenced Account is read-only", "The Account that was referenced in the request only supports read-only operations.");
    OBJECT_NOT_FOUND => (NOT_FOUND, "NOTFND", "Object not found", "The object that was referenced in the request does not exist.");
    MISSING_CAP_MAIL => (EXPECTATION_FAILED, "MISSING_CAP_MAIL", "Missing mail capability", "The JMAP Session or Account of the user does not have the mail capability.");
    MISSING_CAP_SUBMISSION => (EXPECTATION_FAILED, "MISSING_CAP_SUBMISSION", "Missing submission capability", "The JMAP Session or Account of the user does not have the submission capability.");
    MISSING_CAP_BLOB => (EXPECTATION_FAILED, "MISSING_CAP_BLOB", "Missing blob capability", "The JMAP Session or Account of the user does not have the blob capability.");
    MISSING_CAP_VACATION => (EXPECTATION_FAILED, "MISSING_CAP_VACATION", "Missing vacation response capability", "The JMAP Session or Account of the user does not have the vacation response capability.");
    MISSING_CAP_QUOTA => (EXPECTATION_FAILED, "MISSING_CAP_QUOTA", "Missing quota capability", "The JMAP Session or Account of the user does not have the quota capability.");
    MISSING_CAP_TASK => (EXPECTATION_FAILED, "MISSING_CAP_TASK", "Missing tasks capability", "The JMAP Session or Account of the user does not have the tasks capability.");
    MISSING_CAP_CALENDAR => (EXPECTATION_FAILED, "MISSING_CAP_CALENDAR", "Missing calendars capability", "The JMAP Session or Account of the user does not have the calendars capability.");
    MISSING_CAP_CONTACT => (EXPECTATION_FAILED, "MISSING_CAP_CONTACT", "Missing contacts capability", "The JMAP Session or Account of the user does not have the contacts capability.");
    FAILED_TO_SANITIZE_EMAIL => (INTERNAL_SERVER_ERROR, "FAILED_TO_SANITIZE_EMAIL", "Failed to sanitize Email", "The content of an email could not be sanitized.");
    FAILED_TO_DELETE_EMAIL => (BAD_REQUEST, "FAILED_TO_DELETE_EMAIL", "Failed to delete emails", "One or more emails could not be deleted.");
    FAILED_TO_DELETE_IDENTITY => (BAD_REQUEST, "FAILED_TO_DELETE_IDENTITY", "Failed to delete identities", "One or more identities could not be deleted.");
    FAILED_TO_DELETE_MAILBOX => (BAD_REQUEST, "FAILED_TO_DELETE_MAILBOX", "Failed to delete mailboxes", "One or more mailboxes could not be deleted.");
    FAILED_TO_DELETE_CONTACT => (BAD_REQUEST, "FAILED_TO_DELETE_CONTACT", "Failed to delete contacts", "One or more contacts could not be deleted.");
}

impl GroupwareError {
    /// Map an upstream JMAP error kind to its REST descriptor
    ///
    /// The mapping is total: kinds without a dedicated descriptor degrade to
    /// [`GroupwareError::GENERIC`].
    pub fn from_jmap(kind: JmapErrorKind) -> Self {
        match kind {
            JmapErrorKind::AuthenticationFailed => Self::FORBIDDEN,
            JmapErrorKind::InvalidHttpRequest => Self::INVALID_BACKEND_REQUEST,
            JmapErrorKind::ServerResponse => Self::SERVER_RESPONSE,
            JmapErrorKind::ReadingResponseBody => Self::READING_RESPONSE,
            JmapErrorKind::DecodingResponseBody => Self::DECODING_RESPONSE,
            JmapErrorKind::EncodingRequestBody => Self::ENCODING_REQUEST_BODY,
            JmapErrorKind::CreatingRequest => Self::CREATING_REQUEST,
            JmapErrorKind::SendingRequest => Self::SENDING_REQUEST,
            JmapErrorKind::InvalidSessionResponse => Self::INVALID_SESSION_RESPONSE,
            JmapErrorKind::InvalidJmapRequestPayload => Self::INVALID_REQUEST_PAYLOAD,
            JmapErrorKind::InvalidJmapResponsePayload => Self::INVALID_RESPONSE_PAYLOAD,
            JmapErrorKind::UnspecifiedType
            | JmapErrorKind::UnknownMethod
            | JmapErrorKind::InvalidArguments
            | JmapErrorKind::InvalidResultReference => Self::INVALID_GROUPWARE_REQUEST,
            JmapErrorKind::ServerUnavailable => Self::SERVER_UNAVAILABLE,
            JmapErrorKind::ServerFail => Self::SERVER_FAILURE,
            JmapErrorKind::Forbidden => Self::FORBIDDEN_OPERATION,
            JmapErrorKind::AccountNotFound => Self::ACCOUNT_NOT_FOUND,
            JmapErrorKind::AccountNotSupportedByMethod => Self::ACCOUNT_NOT_SUPPORTED_BY_METHOD,
            JmapErrorKind::AccountReadOnly => Self::ACCOUNT_READ_ONLY,
            JmapErrorKind::NotFound => Self::OBJECT_NOT_FOUND,
            JmapErrorKind::InvalidPatch => Self::INVALID_USER_REQUEST,
            JmapErrorKind::SetFailed => Self::GENERIC,
        }
    }
}

/// Reference to the part of the request that caused an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorSource {
    /// JSON Pointer into the request body
    Pointer(String),
    /// Name of the offending query or path parameter
    Parameter(String),
    /// Name of the offending request header
    Header(String),
}

/// JSON:API error object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    /// Unique identifier of this occurrence
    pub id: String,
    /// HTTP status, serialized as a string
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    /// Application-specific error code
    pub code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

fn serialize_status<S>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(status.as_str())
}

impl ApiError {
    /// Create an occurrence of `kind` with the given correlation id
    pub fn new(id: impl Into<String>, kind: &GroupwareError) -> Self {
        Self {
            id: id.into(),
            status: kind.status,
            code: kind.code.to_owned(),
            title: kind.title.to_owned(),
            detail: kind.detail.to_owned(),
            source: None,
            meta: None,
        }
    }

    pub fn with_source(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Top-level JSON:API error document
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDocument {
    pub errors: Vec<ApiError>,
}

/// Build a correlation id for an error occurrence
///
/// Prefixed with the inbound request id when the reverse proxy supplied one,
/// so that log lines of both hops can be joined.
pub fn error_id(request_id: Option<&str>) -> String {
    let local = Uuid::new_v4().to_string();
    match request_id {
        Some(rid) if !rid.is_empty() => format!("{rid}.{local}"),
        _ => local,
    }
}
