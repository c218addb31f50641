//! JMAP client
//!
//! [`JmapClient`] turns high-level operations into JMAP request envelopes,
//! sends them through a [`JmapTransport`], maps method-level errors and picks
//! the typed results out of the response. Operations live in the submodules,
//! grouped by data type.

mod account;
mod email;
pub mod error;
pub mod filter;
mod groupware;
pub mod http;
mod mailbox;
pub mod model;
pub mod session;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

pub use account::QuotaReply;
pub use email::{
    EmailChanges, EmailListing, EmailPage, EmailQueryResult, EmailQueryWithSnippetsResult,
    EmailSnippetQueryResult, EmailWithSnippets, EmailsSummary, GetEmailsOptions, GetEmailsResult,
    KEYWORD_SEEN, SnippetWithMeta,
};
pub use error::{JmapError, JmapErrorKind, JmapResult};
pub use groupware::{CollectionKind, ItemKind, ItemPage};
pub use http::{BlobDownload, JmapTransport};
pub use mailbox::MailboxChanges;
pub use session::Session;

use model::{Invocation, JmapRequest, JmapResponse};

/// Typed result of an operation plus the metadata every response carries
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub value: T,
    /// `sessionState` of the JMAP response
    pub session_state: String,
    /// Object or query state relevant to the operation, used as `ETag`
    pub state: String,
    /// `Content-Language` of the JMAP response
    pub language: Option<String>,
}

impl<T> Reply<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        Reply {
            value: f(self.value),
            session_state: self.session_state,
            state: self.state,
            language: self.language,
        }
    }
}

/// Observer of Session state changes detected in API responses
pub trait SessionEventListener: Send + Sync {
    /// `session` was used for a request whose response carried `new_state`
    fn on_session_outdated(&self, session: &Session, new_state: &str);
}

/// Method call id scoped to an account, for multi-account requests
pub fn mcid(account_id: &str, tag: &str) -> String {
    format!("{account_id}:{tag}")
}

/// Canonical combined state of several accounts: `a:s1,b:s2` sorted by account id
pub fn squash_states<'a>(states: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut parts: Vec<(&str, &str)> = states.into_iter().collect();
    parts.sort_unstable();
    parts
        .into_iter()
        .map(|(account, state)| format!("{account}:{state}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Account ids in order of first appearance, without duplicates
pub(crate) fn unique(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

/// Back-reference to the result of an earlier call (RFC 8620 §3.7)
pub(crate) fn reference(result_of: &str, name: &str, path: &str) -> Value {
    json!({ "resultOf": result_of, "name": name, "path": path })
}

/// Capability URI a method depends on
fn capability_of(method: &str) -> Option<&'static str> {
    let data_type = method.split('/').next().unwrap_or_default();
    match data_type {
        "Email" | "Mailbox" | "Thread" | "SearchSnippet" => Some(session::CAPABILITY_MAIL),
        "Identity" | "EmailSubmission" => Some(session::CAPABILITY_SUBMISSION),
        "VacationResponse" => Some(session::CAPABILITY_VACATION_RESPONSE),
        "Quota" => Some(session::CAPABILITY_QUOTA),
        "Blob" => Some(session::CAPABILITY_BLOB),
        "AddressBook" | "ContactCard" => Some(session::CAPABILITY_CONTACTS),
        "Calendar" | "CalendarEvent" => Some(session::CAPABILITY_CALENDARS),
        "TaskList" | "Task" => Some(session::CAPABILITY_TASKS),
        _ => None,
    }
}

/// Decode the result of call `call_id` of method `method`
pub(crate) fn response_for<T: DeserializeOwned>(
    response: &JmapResponse,
    method: &str,
    call_id: &str,
) -> JmapResult<T> {
    let invocation = response
        .method_responses
        .iter()
        .find(|inv| inv.name() == method && inv.call_id() == call_id)
        .ok_or_else(|| {
            JmapError::new(
                JmapErrorKind::InvalidJmapResponsePayload,
                format!("response does not contain '{method}' for call '{call_id}'"),
            )
        })?;
    T::deserialize(invocation.arguments()).map_err(|e| {
        JmapError::new(
            JmapErrorKind::InvalidJmapResponsePayload,
            format!("failed to decode '{method}' result of call '{call_id}': {e}"),
        )
    })
}

/// First method-level `error` invocation of a response, if any
fn method_error(response: &JmapResponse) -> Option<JmapError> {
    let invocation = response
        .method_responses
        .iter()
        .find(|inv| inv.name() == "error")?;
    let args = invocation.arguments();
    let description = args.get("description").and_then(Value::as_str);
    let err = match args.get("type").and_then(Value::as_str) {
        Some(kind) => JmapError::new(
            JmapErrorKind::from_method_error(kind, description),
            format!(
                "method level error in response '{}', type: '{kind}', description: '{}'",
                invocation.call_id(),
                description.unwrap_or_default()
            ),
        ),
        None => JmapError::new(
            JmapErrorKind::UnspecifiedType,
            format!("method level error in response '{}'", invocation.call_id()),
        ),
    };
    Some(err)
}

/// Stateless JMAP client shared by all requests
pub struct JmapClient {
    transport: Arc<dyn JmapTransport>,
    listeners: RwLock<Vec<Weak<dyn SessionEventListener>>>,
}

impl JmapClient {
    pub fn new(transport: Arc<dyn JmapTransport>) -> Self {
        Self {
            transport,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to session-outdated events
    ///
    /// Listeners are held weakly and silently dropped once released.
    pub fn add_session_event_listener(&self, listener: Weak<dyn SessionEventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    fn on_session_outdated(&self, session: &Session, new_state: &str) {
        let Ok(listeners) = self.listeners.read() else {
            return;
        };
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.on_session_outdated(session, new_state);
        }
    }

    /// Fetch and validate the Session of `username`
    ///
    /// # Errors
    ///
    /// Transport errors, or `InvalidSessionResponse` if the document is
    /// incomplete.
    pub async fn fetch_session(&self, username: &str) -> JmapResult<Session> {
        let response = self.transport.fetch_session(username).await?;
        Session::from_response(response)
    }

    pub(crate) fn transport(&self) -> &dyn JmapTransport {
        self.transport.as_ref()
    }

    /// Assemble a request envelope, enforcing `maxCallsInRequest`
    fn request(&self, session: &Session, method_calls: Vec<Invocation>) -> JmapResult<JmapRequest> {
        let max = session.core.max_calls_in_request;
        if max > 0 && method_calls.len() as u64 > max {
            return Err(JmapError::new(
                JmapErrorKind::InvalidJmapRequestPayload,
                format!(
                    "request has {} method calls, the server accepts at most {max}",
                    method_calls.len()
                ),
            ));
        }
        let mut using = vec![session::CAPABILITY_CORE.to_owned()];
        for call in &method_calls {
            if let Some(cap) = capability_of(call.name())
                && !using.iter().any(|u| u == cap)
            {
                using.push(cap.to_owned());
            }
        }
        Ok(JmapRequest {
            using,
            method_calls,
        })
    }

    /// Send `method_calls` and map the decoded response
    ///
    /// `map` returns the typed value and the state to expose as `ETag`.
    pub(crate) async fn command<T>(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        operation: &'static str,
        method_calls: Vec<Invocation>,
        map: impl FnOnce(&JmapResponse) -> JmapResult<(T, String)>,
    ) -> JmapResult<Reply<T>> {
        let request = self.request(session, method_calls)?;
        let raw = self
            .transport
            .command(session, &request, accept_language)
            .await?;
        let response: JmapResponse = serde_json::from_slice(&raw.body).map_err(|e| {
            warn!(operation, endpoint = %session.endpoint, error = %e, "failed to decode JMAP response");
            JmapError::new(
                JmapErrorKind::DecodingResponseBody,
                format!("failed to decode JMAP response: {e}"),
            )
        })?;

        if response.session_state != session.state {
            debug!(
                operation,
                username = %session.username,
                old = %session.state,
                new = %response.session_state,
                "session state changed"
            );
            self.on_session_outdated(session, &response.session_state);
        }

        if let Some(err) = method_error(&response) {
            warn!(operation, kind = %err.kind, "{}", err.message);
            return Err(err);
        }

        let (value, state) = map(&response)?;
        Ok(Reply {
            value,
            session_state: response.session_state,
            state,
            language: raw.language,
        })
    }
}

/// Turn per-object failures into a single error, first id wins
pub(crate) fn first_set_error(
    errors: &BTreeMap<String, model::SetError>,
) -> JmapResult<()> {
    match errors.iter().next() {
        Some((id, err)) => Err(JmapError::from_set_error(id, err)),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Bytes;
    use futures::future::BoxFuture;
    use serde_json::json;

    use super::http::CommandResponse;
    use super::model::UploadedBlob;
    use super::session::SessionResponse;
    use super::*;

    /// In-memory transport replaying canned responses and recording requests
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub sessions: Mutex<BTreeMap<String, SessionResponse>>,
        pub session_fetches: AtomicUsize,
        pub responses: Mutex<VecDeque<Value>>,
        pub requests: Mutex<Vec<JmapRequest>>,
        pub blobs: Mutex<BTreeMap<String, Vec<u8>>>,
        pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeTransport {
        pub(crate) fn with_session(username: &str, state: &str) -> Self {
            let fake = Self::default();
            fake.add_session(username, state);
            fake
        }

        pub(crate) fn add_session(&self, username: &str, state: &str) {
            self.sessions.lock().expect("lock").insert(
                username.to_owned(),
                session::tests::session_response(username, state),
            );
        }

        /// Queue the `methodResponses` of the next API call
        pub(crate) fn respond(&self, session_state: &str, method_responses: Value) {
            self.responses.lock().expect("lock").push_back(json!({
                "methodResponses": method_responses,
                "sessionState": session_state,
            }));
        }

        pub(crate) fn requests(&self) -> Vec<JmapRequest> {
            self.requests.lock().expect("lock").clone()
        }

        pub(crate) fn last_request(&self) -> JmapRequest {
            self.requests().pop().expect("a request was sent")
        }
    }

    impl JmapTransport for FakeTransport {
        fn fetch_session<'a>(&'a self, username: &'a str) -> BoxFuture<'a, JmapResult<SessionResponse>> {
            Box::pin(async move {
                self.session_fetches.fetch_add(1, Ordering::SeqCst);
                self.sessions
                    .lock()
                    .expect("lock")
                    .get(username)
                    .cloned()
                    .ok_or_else(|| JmapError::new(JmapErrorKind::AuthenticationFailed, "unknown user"))
            })
        }

        fn command<'a>(
            &'a self,
            _session: &'a Session,
            request: &'a JmapRequest,
            _accept_language: Option<&'a str>,
        ) -> BoxFuture<'a, JmapResult<CommandResponse>> {
            Box::pin(async move {
                self.requests.lock().expect("lock").push(request.clone());
                let next = self.responses.lock().expect("lock").pop_front();
                match next {
                    Some(body) => Ok(CommandResponse {
                        body: Bytes::from(serde_json::to_vec(&body).expect("encode")),
                        language: Some("en".to_owned()),
                    }),
                    None => Err(JmapError::new(JmapErrorKind::ServerResponse, "no canned response")),
                }
            })
        }

        fn upload_blob<'a>(
            &'a self,
            _session: &'a Session,
            account_id: &'a str,
            content_type: &'a str,
            body: Bytes,
        ) -> BoxFuture<'a, JmapResult<UploadedBlob>> {
            Box::pin(async move {
                self.uploads
                    .lock()
                    .expect("lock")
                    .push((account_id.to_owned(), body.to_vec()));
                Ok(UploadedBlob {
                    id: "uploaded-1".to_owned(),
                    size: body.len() as u64,
                    media_type: content_type.to_owned(),
                })
            })
        }

        fn download_blob<'a>(
            &'a self,
            _session: &'a Session,
            url: String,
            _accept_language: Option<&'a str>,
        ) -> BoxFuture<'a, JmapResult<Option<BlobDownload>>> {
            Box::pin(async move {
                let blob = self.blobs.lock().expect("lock").get(&url).cloned();
                Ok(blob.map(|data| BlobDownload {
                    size: Some(data.len() as u64),
                    body: Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) })),
                    content_type: Some("message/rfc822".to_owned()),
                    content_disposition: None,
                    cache_control: Some("private".to_owned()),
                }))
            })
        }
    }

    struct RecordingListener(Mutex<Vec<(String, String)>>);

    impl SessionEventListener for RecordingListener {
        fn on_session_outdated(&self, session: &Session, new_state: &str) {
            self.0
                .lock()
                .expect("lock")
                .push((session.username.clone(), new_state.to_owned()));
        }
    }

    #[tokio::test]
    async fn notifies_listeners_when_session_state_changes() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let listener = Arc::new(RecordingListener(Mutex::new(Vec::new())));
        let weak: Weak<dyn SessionEventListener> = Arc::downgrade(&(listener.clone() as Arc<dyn SessionEventListener>));
        client.add_session_event_listener(weak);

        let session = client.fetch_session("alice").await.expect("session");
        fake.respond("s1", json!([["Mailbox/get", {"state": "m1", "list": []}, "0"]]));
        let reply = client
            .get_mailboxes(&session, None, "a1", None)
            .await
            .expect("mailboxes");
        assert_eq!(reply.session_state, "s1");
        assert_eq!(
            listener.0.lock().expect("lock").as_slice(),
            &[("alice".to_owned(), "s1".to_owned())]
        );
    }

    #[tokio::test]
    async fn maps_method_level_errors() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        fake.respond(
            "s0",
            json!([["error", {"type": "forbidden", "description": "You do not have access to account b"}, "0"]]),
        );
        let err = client
            .get_mailboxes(&session, None, "b", None)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, JmapErrorKind::AccountNotFound);
    }

    #[tokio::test]
    async fn rejects_requests_exceeding_max_calls() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        let calls = (0..17)
            .map(|i| Invocation::new("Mailbox/get", json!({}), i.to_string()))
            .collect();
        let err = client.request(&session, calls).expect_err("too many calls");
        assert_eq!(err.kind, JmapErrorKind::InvalidJmapRequestPayload);
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn squashed_state_is_sorted_by_account() {
        assert_eq!(squash_states([("b", "2"), ("a", "1")]), "a:1,b:2");
        assert_eq!(squash_states([("a", "1")]), "a:1");
        assert_eq!(squash_states(std::iter::empty()), "");
    }

    #[test]
    fn using_lists_capabilities_of_called_methods() {
        let client = JmapClient::new(Arc::new(FakeTransport::default()));
        let session = session::tests::session("alice", "s0");
        let request = client
            .request(
                &session,
                vec![
                    Invocation::new("Email/query", json!({}), "0"),
                    Invocation::new("Email/get", json!({}), "1"),
                    Invocation::new("Quota/get", json!({}), "2"),
                ],
            )
            .expect("request");
        assert_eq!(
            request.using,
            vec![
                session::CAPABILITY_CORE,
                session::CAPABILITY_MAIL,
                session::CAPABILITY_QUOTA
            ]
        );
    }
}
