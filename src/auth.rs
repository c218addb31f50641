//! End-user identification
//!
//! Authentication happens upstream: the reverse proxy validates the user's
//! token and forwards the username in a trusted header. The gateway only
//! reads it and acts on behalf of that user with the master credential.

use axum::http::{HeaderMap, HeaderName};

use crate::errors::{AppError, AppResult};

/// Source of the username of the current request
pub trait UsernameProvider: Send + Sync {
    /// Username of the end user, `None` when the request is anonymous
    fn username(&self, headers: &HeaderMap) -> Option<String>;
}

/// Reads the username from a request header set by the reverse proxy
#[derive(Debug, Clone)]
pub struct HeaderUsernameProvider {
    header: HeaderName,
}

impl HeaderUsernameProvider {
    /// # Errors
    ///
    /// Returns `Config` if `header` is not a valid header name.
    pub fn new(header: &str) -> AppResult<Self> {
        let header = HeaderName::try_from(header.trim().to_ascii_lowercase())
            .map_err(|_| AppError::config(format!("invalid username header name '{header}'")))?;
        Ok(Self { header })
    }
}

impl UsernameProvider for HeaderUsernameProvider {
    fn username(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn reads_trimmed_username_from_configured_header() {
        let provider = HeaderUsernameProvider::new("X-Remote-User").expect("valid header");
        let mut headers = HeaderMap::new();
        assert_eq!(provider.username(&headers), None);

        headers.insert("x-remote-user", HeaderValue::from_static("  "));
        assert_eq!(provider.username(&headers), None);

        headers.insert("x-remote-user", HeaderValue::from_static(" alice "));
        assert_eq!(provider.username(&headers).as_deref(), Some("alice"));
    }

    #[test]
    fn rejects_invalid_header_names() {
        assert!(HeaderUsernameProvider::new("bad header").is_err());
    }
}
