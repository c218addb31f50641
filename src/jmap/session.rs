//! JMAP Session resource
//!
//! The raw `/.well-known/jmap` document is decoded into [`SessionResponse`]
//! and validated into a [`Session`] before anything else may use it.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{JmapError, JmapErrorKind, JmapResult};

pub const CAPABILITY_CORE: &str = "urn:ietf:params:jmap:core";
pub const CAPABILITY_MAIL: &str = "urn:ietf:params:jmap:mail";
pub const CAPABILITY_SUBMISSION: &str = "urn:ietf:params:jmap:submission";
pub const CAPABILITY_VACATION_RESPONSE: &str = "urn:ietf:params:jmap:vacationresponse";
pub const CAPABILITY_QUOTA: &str = "urn:ietf:params:jmap:quota";
pub const CAPABILITY_BLOB: &str = "urn:ietf:params:jmap:blob";
pub const CAPABILITY_CONTACTS: &str = "urn:ietf:params:jmap:contacts";
pub const CAPABILITY_CALENDARS: &str = "urn:ietf:params:jmap:calendars";
pub const CAPABILITY_TASKS: &str = "urn:ietf:params:jmap:tasks";
pub const CAPABILITY_SIEVE: &str = "urn:ietf:params:jmap:sieve";

/// Limits advertised under `urn:ietf:params:jmap:core`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreCapabilities {
    pub max_size_upload: u64,
    pub max_concurrent_upload: u64,
    pub max_size_request: u64,
    pub max_concurrent_requests: u64,
    pub max_calls_in_request: u64,
    pub max_objects_in_get: u64,
    pub max_objects_in_set: u64,
    pub collation_algorithms: Vec<String>,
}

/// Account entry of a Session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub name: String,
    pub is_personal: bool,
    pub is_read_only: bool,
    pub account_capabilities: BTreeMap<String, Value>,
}

impl Account {
    /// Whether the account exposes `capability` with a non-null object
    pub fn has_capability(&self, capability: &str) -> bool {
        self.account_capabilities
            .get(capability)
            .is_some_and(|v| !v.is_null())
    }
}

/// Undecoded Session document as returned by the server
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionResponse {
    pub capabilities: BTreeMap<String, Value>,
    pub accounts: BTreeMap<String, Account>,
    pub primary_accounts: BTreeMap<String, String>,
    pub username: String,
    pub api_url: String,
    pub download_url: String,
    pub upload_url: String,
    pub event_source_url: String,
    pub state: String,
}

/// Primary account bindings by well-known role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryAccounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vacation_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// Well-known roles an account can be primary for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountRole {
    Mail,
    Submission,
    Blob,
    VacationResponse,
    Quota,
    Task,
    Calendar,
    Contact,
}

impl AccountRole {
    /// Capability URI that defines the role
    pub fn capability(self) -> &'static str {
        match self {
            Self::Mail => CAPABILITY_MAIL,
            Self::Submission => CAPABILITY_SUBMISSION,
            Self::Blob => CAPABILITY_BLOB,
            Self::VacationResponse => CAPABILITY_VACATION_RESPONSE,
            Self::Quota => CAPABILITY_QUOTA,
            Self::Task => CAPABILITY_TASKS,
            Self::Calendar => CAPABILITY_CALENDARS,
            Self::Contact => CAPABILITY_CONTACTS,
        }
    }
}

impl PrimaryAccounts {
    pub fn for_role(&self, role: AccountRole) -> Option<&str> {
        match role {
            AccountRole::Mail => self.mail.as_deref(),
            AccountRole::Submission => self.submission.as_deref(),
            AccountRole::Blob => self.blob.as_deref(),
            AccountRole::VacationResponse => self.vacation_response.as_deref(),
            AccountRole::Quota => self.quota.as_deref(),
            AccountRole::Task => self.task.as_deref(),
            AccountRole::Calendar => self.calendar.as_deref(),
            AccountRole::Contact => self.contact.as_deref(),
        }
    }
}

/// Validated per-user JMAP Session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub username: String,
    pub state: String,
    pub accounts: BTreeMap<String, Account>,
    pub primary_accounts: PrimaryAccounts,
    pub core: CoreCapabilities,
    /// Raw session-level capability objects, keyed by URI
    pub capabilities: BTreeMap<String, Value>,
    pub api_url: Url,
    pub download_url: String,
    pub upload_url: String,
    /// `scheme://host[:port]` of the API URL, used as a metric label
    pub endpoint: String,
}

impl Session {
    /// Validate a raw Session document
    ///
    /// # Errors
    ///
    /// Returns `InvalidSessionResponse` if the username or any of the API,
    /// upload and download URLs is missing or unparseable.
    pub fn from_response(response: SessionResponse) -> JmapResult<Self> {
        let invalid = |msg: &str| JmapError::new(JmapErrorKind::InvalidSessionResponse, msg);

        if response.username.is_empty() {
            return Err(invalid("JMAP session response does not provide a username"));
        }
        if response.api_url.is_empty() {
            return Err(invalid("JMAP session response does not provide an API URL"));
        }
        let api_url = Url::parse(&response.api_url)
            .map_err(|_| invalid("JMAP session response provides an invalid API URL"))?;
        for (name, template) in [
            ("upload", &response.upload_url),
            ("download", &response.download_url),
        ] {
            if template.is_empty() {
                return Err(JmapError::new(
                    JmapErrorKind::InvalidSessionResponse,
                    format!("JMAP session response does not provide a {name} URL"),
                ));
            }
            if Url::parse(template).is_err() {
                return Err(JmapError::new(
                    JmapErrorKind::InvalidSessionResponse,
                    format!("JMAP session response provides an invalid {name} URL"),
                ));
            }
        }

        let endpoint = match (api_url.host_str(), api_url.port()) {
            (Some(host), Some(port)) => format!("{}://{host}:{port}", api_url.scheme()),
            (Some(host), None) => format!("{}://{host}", api_url.scheme()),
            _ => api_url.scheme().to_owned(),
        };

        let core = response
            .capabilities
            .get(CAPABILITY_CORE)
            .cloned()
            .map(serde_json::from_value::<CoreCapabilities>)
            .transpose()
            .map_err(|_| invalid("JMAP session response has a malformed core capability"))?
            .unwrap_or_default();

        let primary = |uri: &str| response.primary_accounts.get(uri).cloned();
        let primary_accounts = PrimaryAccounts {
            mail: primary(CAPABILITY_MAIL),
            submission: primary(CAPABILITY_SUBMISSION),
            blob: primary(CAPABILITY_BLOB),
            vacation_response: primary(CAPABILITY_VACATION_RESPONSE),
            quota: primary(CAPABILITY_QUOTA),
            task: primary(CAPABILITY_TASKS),
            calendar: primary(CAPABILITY_CALENDARS),
            contact: primary(CAPABILITY_CONTACTS),
        };

        Ok(Self {
            username: response.username,
            state: response.state,
            accounts: response.accounts,
            primary_accounts,
            core,
            capabilities: response.capabilities,
            api_url,
            download_url: response.download_url,
            upload_url: response.upload_url,
            endpoint,
        })
    }

    /// Whether the session itself advertises `capability`
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains_key(capability)
    }

    /// Ids of all accounts that expose `capability`, in id order
    pub fn account_ids_with(&self, capability: &str) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|(_, account)| account.has_capability(capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Expand the download URL template for a blob
    pub fn blob_download_url(&self, account_id: &str, blob_id: &str, name: &str, typ: &str) -> String {
        self.download_url
            .replace("{accountId}", &urlencoding::encode(account_id))
            .replace("{blobId}", &urlencoding::encode(blob_id))
            .replace("{name}", &urlencoding::encode(name))
            .replace("{type}", &urlencoding::encode(typ))
    }

    /// Expand the upload URL template for an account
    pub fn blob_upload_url(&self, account_id: &str) -> String {
        self.upload_url
            .replace("{accountId}", &urlencoding::encode(account_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    /// Session document with one mail account `a1` and one contacts-only account `c1`
    pub(crate) fn session_response(username: &str, state: &str) -> SessionResponse {
        serde_json::from_value(json!({
            "capabilities": {
                CAPABILITY_CORE: { "maxCallsInRequest": 16, "maxSizeUpload": 50000000 },
                CAPABILITY_MAIL: {},
                CAPABILITY_CONTACTS: {}
            },
            "accounts": {
                "a1": {
                    "name": format!("{username}@example.com"),
                    "isPersonal": true,
                    "isReadOnly": false,
                    "accountCapabilities": {
                        CAPABILITY_MAIL: { "maxMailboxDepth": 10 },
                        CAPABILITY_SUBMISSION: {},
                        CAPABILITY_VACATION_RESPONSE: {},
                        CAPABILITY_QUOTA: {},
                        CAPABILITY_BLOB: {}
                    }
                },
                "a2": {
                    "name": "shared",
                    "isPersonal": false,
                    "isReadOnly": false,
                    "accountCapabilities": { CAPABILITY_MAIL: {} }
                },
                "c1": {
                    "name": "contacts",
                    "isPersonal": true,
                    "isReadOnly": false,
                    "accountCapabilities": { CAPABILITY_CONTACTS: {}, CAPABILITY_CALENDARS: null }
                }
            },
            "primaryAccounts": {
                CAPABILITY_MAIL: "a1",
                CAPABILITY_SUBMISSION: "a1",
                CAPABILITY_VACATION_RESPONSE: "a1",
                CAPABILITY_BLOB: "a1",
                CAPABILITY_QUOTA: "a1",
                CAPABILITY_CONTACTS: "c1"
            },
            "username": username,
            "apiUrl": "https://jmap.example.com:8443/jmap/",
            "downloadUrl": "https://jmap.example.com:8443/jmap/download/{accountId}/{blobId}/{name}?accept={type}",
            "uploadUrl": "https://jmap.example.com:8443/jmap/upload/{accountId}/",
            "eventSourceUrl": "https://jmap.example.com:8443/jmap/eventsource/",
            "state": state
        }))
        .expect("valid session fixture")
    }

    pub(crate) fn session(username: &str, state: &str) -> Session {
        Session::from_response(session_response(username, state)).expect("valid session")
    }

    #[test]
    fn validates_and_resolves_primary_accounts() {
        let session = session("alice", "s0");
        assert_eq!(session.endpoint, "https://jmap.example.com:8443");
        assert_eq!(session.primary_accounts.for_role(AccountRole::Mail), Some("a1"));
        assert_eq!(session.primary_accounts.for_role(AccountRole::Calendar), None);
        assert_eq!(session.core.max_calls_in_request, 16);
        assert_eq!(session.account_ids_with(CAPABILITY_MAIL), vec!["a1", "a2"]);
    }

    #[test]
    fn null_account_capability_is_not_exposed() {
        let session = session("alice", "s0");
        let c1 = session.accounts.get("c1").expect("c1");
        assert!(c1.has_capability(CAPABILITY_CONTACTS));
        assert!(!c1.has_capability(CAPABILITY_CALENDARS));
    }

    #[test]
    fn rejects_sessions_without_required_fields() {
        let mut missing_user = session_response("alice", "s0");
        missing_user.username.clear();
        let err = Session::from_response(missing_user).expect_err("must fail");
        assert_eq!(err.kind, JmapErrorKind::InvalidSessionResponse);

        let mut missing_download = session_response("alice", "s0");
        missing_download.download_url.clear();
        let err = Session::from_response(missing_download).expect_err("must fail");
        assert!(err.message.contains("download"));

        let mut bad_api = session_response("alice", "s0");
        bad_api.api_url = "not a url".to_owned();
        assert!(Session::from_response(bad_api).is_err());
    }

    #[test]
    fn expands_download_template_with_encoding() {
        let session = session("alice", "s0");
        let url = session.blob_download_url("a1", "B 1", "report.pdf", "application/pdf");
        assert_eq!(
            url,
            "https://jmap.example.com:8443/jmap/download/a1/B%201/report.pdf?accept=application%2Fpdf"
        );
    }
}
