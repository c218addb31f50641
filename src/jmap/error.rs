//! Errors surfaced by the JMAP client
//!
//! Transport-level kinds describe failures talking HTTP to the JMAP server;
//! method-level kinds mirror the `error` invocations of RFC 8620 §3.6.2;
//! set-level kinds come from `notCreated`/`notUpdated`/`notDestroyed` maps.

use std::fmt;

use thiserror::Error;

use super::model::SetError;

/// Classification of a JMAP failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JmapErrorKind {
    AuthenticationFailed,
    InvalidHttpRequest,
    ServerResponse,
    ReadingResponseBody,
    DecodingResponseBody,
    EncodingRequestBody,
    CreatingRequest,
    SendingRequest,
    InvalidSessionResponse,
    InvalidJmapRequestPayload,
    InvalidJmapResponsePayload,
    ServerUnavailable,
    ServerFail,
    UnknownMethod,
    InvalidArguments,
    InvalidResultReference,
    Forbidden,
    AccountNotFound,
    AccountNotSupportedByMethod,
    AccountReadOnly,
    UnspecifiedType,
    NotFound,
    InvalidPatch,
    SetFailed,
}

impl JmapErrorKind {
    /// Stable label, used in logs and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authenticationFailed",
            Self::InvalidHttpRequest => "invalidHttpRequest",
            Self::ServerResponse => "serverResponse",
            Self::ReadingResponseBody => "readingResponseBody",
            Self::DecodingResponseBody => "decodingResponseBody",
            Self::EncodingRequestBody => "encodingRequestBody",
            Self::CreatingRequest => "creatingRequest",
            Self::SendingRequest => "sendingRequest",
            Self::InvalidSessionResponse => "invalidSessionResponse",
            Self::InvalidJmapRequestPayload => "invalidJmapRequestPayload",
            Self::InvalidJmapResponsePayload => "invalidJmapResponsePayload",
            Self::ServerUnavailable => "serverUnavailable",
            Self::ServerFail => "serverFail",
            Self::UnknownMethod => "unknownMethod",
            Self::InvalidArguments => "invalidArguments",
            Self::InvalidResultReference => "invalidResultReference",
            Self::Forbidden => "forbidden",
            Self::AccountNotFound => "accountNotFound",
            Self::AccountNotSupportedByMethod => "accountNotSupportedByMethod",
            Self::AccountReadOnly => "accountReadOnly",
            Self::UnspecifiedType => "unspecifiedType",
            Self::NotFound => "notFound",
            Self::InvalidPatch => "invalidPatch",
            Self::SetFailed => "setFailed",
        }
    }

    /// Classify a method-level `error` invocation
    ///
    /// A `forbidden` error about an account the user cannot access is reported
    /// as a missing account, so that the response does not confirm that the
    /// account exists.
    pub fn from_method_error(kind: &str, description: Option<&str>) -> Self {
        match kind {
            "serverUnavailable" => Self::ServerUnavailable,
            "serverFail" | "serverPartialFail" => Self::ServerFail,
            "unknownMethod" => Self::UnknownMethod,
            "invalidArguments" => Self::InvalidArguments,
            "invalidResultReference" => Self::InvalidResultReference,
            "forbidden" => {
                if description
                    .is_some_and(|d| d.starts_with("You do not have access to account"))
                {
                    Self::AccountNotFound
                } else {
                    Self::Forbidden
                }
            }
            "accountNotFound" => Self::AccountNotFound,
            "accountNotSupportedByMethod" => Self::AccountNotSupportedByMethod,
            "accountReadOnly" => Self::AccountReadOnly,
            _ => Self::ServerFail,
        }
    }

    /// Classify a per-object `SetError`
    pub fn from_set_error(kind: &str) -> Self {
        match kind {
            "notFound" => Self::NotFound,
            "forbidden" => Self::Forbidden,
            "invalidPatch" | "invalidProperties" | "willDestroy" => Self::InvalidPatch,
            _ => Self::SetFailed,
        }
    }
}

impl fmt::Display for JmapErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed JMAP operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct JmapError {
    pub kind: JmapErrorKind,
    pub message: String,
}

impl JmapError {
    pub fn new(kind: JmapErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error for the first entry of a `notCreated`/`notUpdated` map
    pub fn from_set_error(id: &str, err: &SetError) -> Self {
        Self::new(
            JmapErrorKind::from_set_error(&err.kind),
            format!(
                "'{id}' was rejected with '{}': {}",
                err.kind,
                err.description.as_deref().unwrap_or("no description")
            ),
        )
    }
}

/// Type alias for JMAP client results
pub type JmapResult<T> = Result<T, JmapError>;
