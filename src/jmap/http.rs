//! HTTP transport to the JMAP server
//!
//! Every request authenticates with the master credential on behalf of the
//! end user (`<user>%<master>` basic auth). The transport knows nothing about
//! JMAP methods; it moves sessions, request envelopes and blobs.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{
    ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LANGUAGE, CONTENT_TYPE,
    USER_AGENT,
};
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, warn};

use super::error::{JmapError, JmapErrorKind, JmapResult};
use super::model::{JmapRequest, UploadedBlob};
use super::session::{Session, SessionResponse};

/// User agent sent with every upstream request
pub const GATEWAY_USER_AGENT: &str = concat!("groupware-gateway/", env!("CARGO_PKG_VERSION"));

/// Streamed blob download
pub struct BlobDownload {
    pub body: BoxStream<'static, Result<Bytes, std::io::Error>>,
    /// `Content-Length` of the upstream response, if announced and valid
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
}

impl std::fmt::Debug for BlobDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDownload")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Raw API response body together with its `Content-Language`
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub body: Bytes,
    pub language: Option<String>,
}

/// Capability set of the upstream connection
///
/// Implemented over HTTP by [`HttpJmapTransport`] and by in-memory fakes in
/// tests.
pub trait JmapTransport: Send + Sync {
    /// Fetch the undecoded Session document for `username`
    fn fetch_session<'a>(&'a self, username: &'a str) -> BoxFuture<'a, JmapResult<SessionResponse>>;

    /// POST a request envelope to the session's API URL
    fn command<'a>(
        &'a self,
        session: &'a Session,
        request: &'a JmapRequest,
        accept_language: Option<&'a str>,
    ) -> BoxFuture<'a, JmapResult<CommandResponse>>;

    /// Upload a blob into `account_id`
    fn upload_blob<'a>(
        &'a self,
        session: &'a Session,
        account_id: &'a str,
        content_type: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, JmapResult<UploadedBlob>>;

    /// Stream a blob; `None` when the server does not know it
    fn download_blob<'a>(
        &'a self,
        session: &'a Session,
        url: String,
        accept_language: Option<&'a str>,
    ) -> BoxFuture<'a, JmapResult<Option<BlobDownload>>>;
}

/// Observer of upstream HTTP outcomes, labelled by JMAP endpoint
pub trait RequestListener: Send + Sync {
    fn on_successful_request(&self, endpoint: &str, status: StatusCode);
    fn on_failed_request(&self, endpoint: &str);
    fn on_failed_request_with_status(&self, endpoint: &str, status: StatusCode);
    fn on_response_body_reading_error(&self, endpoint: &str);
    fn on_response_body_unmarshalling_error(&self, endpoint: &str);
}

/// Listener that records nothing
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRequestListener;

#[cfg(test)]
impl RequestListener for NoopRequestListener {
    fn on_successful_request(&self, _: &str, _: StatusCode) {}
    fn on_failed_request(&self, _: &str) {}
    fn on_failed_request_with_status(&self, _: &str, _: StatusCode) {}
    fn on_response_body_reading_error(&self, _: &str) {}
    fn on_response_body_unmarshalling_error(&self, _: &str) {}
}

/// Settings of the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransportSettings {
    pub base_url: Url,
    pub master_username: String,
    pub master_password: SecretString,
    pub response_header_timeout: Duration,
    pub accept_invalid_certs: bool,
}

/// [`JmapTransport`] over `reqwest`
pub struct HttpJmapTransport {
    client: Client,
    session_url: Url,
    master_username: String,
    master_password: SecretString,
    response_header_timeout: Duration,
    listener: Arc<dyn RequestListener>,
}

impl HttpJmapTransport {
    /// Build the shared connection pool
    ///
    /// # Errors
    ///
    /// Returns `CreatingRequest` if the TLS backend cannot be initialised or
    /// the well-known Session URL cannot be derived from the base URL.
    pub fn new(
        settings: HttpTransportSettings,
        listener: Arc<dyn RequestListener>,
    ) -> JmapResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .connect_timeout(settings.response_header_timeout)
            .build()
            .map_err(|e| {
                JmapError::new(
                    JmapErrorKind::CreatingRequest,
                    format!("failed to create HTTP client: {e}"),
                )
            })?;
        let session_url = settings.base_url.join(".well-known/jmap").map_err(|e| {
            JmapError::new(
                JmapErrorKind::InvalidHttpRequest,
                format!("invalid JMAP base URL: {e}"),
            )
        })?;
        Ok(Self {
            client,
            session_url,
            master_username: settings.master_username,
            master_password: settings.master_password,
            response_header_timeout: settings.response_header_timeout,
            listener,
        })
    }

    fn authenticate(&self, request: reqwest::RequestBuilder, username: &str) -> reqwest::RequestBuilder {
        request.basic_auth(
            format!("{username}%{}", self.master_username),
            Some(self.master_password.expose_secret()),
        )
    }

    /// Send and wait for the response head, bounded by the header timeout
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> JmapResult<reqwest::Response> {
        match tokio::time::timeout(self.response_header_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.listener.on_failed_request(endpoint);
                error!(endpoint, error = %e, "failed to perform JMAP request");
                Err(JmapError::new(
                    JmapErrorKind::SendingRequest,
                    format!("request failed: {e}"),
                ))
            }
            Err(_) => {
                self.listener.on_failed_request(endpoint);
                error!(endpoint, "timed out waiting for JMAP response headers");
                Err(JmapError::new(
                    JmapErrorKind::SendingRequest,
                    "timed out waiting for response headers",
                ))
            }
        }
    }

    fn check_status(&self, response: &reqwest::Response, endpoint: &str) -> JmapResult<()> {
        let status = response.status();
        if status.is_success() {
            self.listener.on_successful_request(endpoint, status);
            return Ok(());
        }
        self.listener.on_failed_request_with_status(endpoint, status);
        error!(endpoint, status = status.as_u16(), "JMAP response status is not 2xx");
        Err(JmapError::new(
            JmapErrorKind::ServerResponse,
            format!("JMAP API response status is {status}"),
        ))
    }

    async fn read_body(&self, response: reqwest::Response, endpoint: &str) -> JmapResult<Bytes> {
        response.bytes().await.map_err(|e| {
            self.listener.on_response_body_reading_error(endpoint);
            error!(endpoint, error = %e, "failed to read JMAP response body");
            JmapError::new(
                JmapErrorKind::ReadingResponseBody,
                format!("failed to read response body: {e}"),
            )
        })
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn endpoint_of(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
        (Some(host), None) => format!("{}://{host}", url.scheme()),
        _ => url.scheme().to_owned(),
    }
}

impl JmapTransport for HttpJmapTransport {
    fn fetch_session<'a>(&'a self, username: &'a str) -> BoxFuture<'a, JmapResult<SessionResponse>> {
        Box::pin(async move {
            let endpoint = endpoint_of(&self.session_url);
            let request = self
                .authenticate(self.client.get(self.session_url.clone()), username)
                .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(USER_AGENT, GATEWAY_USER_AGENT);
            let response = self.send(request, &endpoint).await?;
            self.check_status(&response, &endpoint)?;
            let body = self.read_body(response, &endpoint).await?;
            serde_json::from_slice(&body).map_err(|e| {
                self.listener.on_response_body_unmarshalling_error(&endpoint);
                error!(endpoint = %endpoint, url = %self.session_url, error = %e, "failed to decode JMAP session response");
                JmapError::new(
                    JmapErrorKind::DecodingResponseBody,
                    format!("failed to decode session response: {e}"),
                )
            })
        })
    }

    fn command<'a>(
        &'a self,
        session: &'a Session,
        request: &'a JmapRequest,
        accept_language: Option<&'a str>,
    ) -> BoxFuture<'a, JmapResult<CommandResponse>> {
        Box::pin(async move {
            let endpoint = session.endpoint.as_str();
            let payload = serde_json::to_vec(request).map_err(|e| {
                error!(endpoint, error = %e, "failed to encode JMAP request");
                JmapError::new(
                    JmapErrorKind::EncodingRequestBody,
                    format!("failed to encode request: {e}"),
                )
            })?;
            let mut builder = self
                .authenticate(self.client.post(session.api_url.clone()), &session.username)
                .header(CONTENT_TYPE, "application/json")
                .header(USER_AGENT, GATEWAY_USER_AGENT)
                .body(payload);
            if let Some(lang) = accept_language.filter(|l| !l.is_empty()) {
                builder = builder.header(ACCEPT_LANGUAGE, lang);
            }
            let response = self.send(builder, endpoint).await?;
            let language = header_string(&response, CONTENT_LANGUAGE);
            self.check_status(&response, endpoint)?;
            let body = self.read_body(response, endpoint).await?;
            Ok(CommandResponse { body, language })
        })
    }

    fn upload_blob<'a>(
        &'a self,
        session: &'a Session,
        account_id: &'a str,
        content_type: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, JmapResult<UploadedBlob>> {
        Box::pin(async move {
            let endpoint = session.endpoint.as_str();
            let url = session.blob_upload_url(account_id);
            let builder = self
                .authenticate(self.client.post(&url), &session.username)
                .header(CONTENT_TYPE, content_type)
                .header(USER_AGENT, GATEWAY_USER_AGENT)
                .body(body);
            let response = self.send(builder, endpoint).await?;
            self.check_status(&response, endpoint)?;
            let body = self.read_body(response, endpoint).await?;
            serde_json::from_slice(&body).map_err(|e| {
                self.listener.on_response_body_unmarshalling_error(endpoint);
                error!(endpoint, url = %url, error = %e, "failed to decode upload response");
                JmapError::new(
                    JmapErrorKind::DecodingResponseBody,
                    format!("failed to decode upload response: {e}"),
                )
            })
        })
    }

    fn download_blob<'a>(
        &'a self,
        session: &'a Session,
        url: String,
        accept_language: Option<&'a str>,
    ) -> BoxFuture<'a, JmapResult<Option<BlobDownload>>> {
        Box::pin(async move {
            let endpoint = session.endpoint.as_str();
            let mut builder = self
                .authenticate(self.client.get(&url), &session.username)
                .header(USER_AGENT, GATEWAY_USER_AGENT);
            if let Some(lang) = accept_language.filter(|l| !l.is_empty()) {
                builder = builder.header(ACCEPT_LANGUAGE, lang);
            }
            let response = self.send(builder, endpoint).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            self.check_status(&response, endpoint)?;

            let size = match response.headers().get(reqwest::header::CONTENT_LENGTH) {
                Some(value) => {
                    let parsed = value.to_str().ok().and_then(|v| v.parse::<u64>().ok());
                    if parsed.is_none() {
                        warn!(endpoint, "ignoring unparseable Content-Length of blob download");
                    }
                    parsed
                }
                None => None,
            };
            let content_type = header_string(&response, CONTENT_TYPE);
            let content_disposition = header_string(&response, CONTENT_DISPOSITION);
            let cache_control = header_string(&response, CACHE_CONTROL);
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();
            Ok(Some(BlobDownload {
                body,
                size,
                content_type,
                content_disposition,
                cache_control,
            }))
        })
    }
}
