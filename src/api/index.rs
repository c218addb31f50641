//! Bootstrap document at the API root

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::Req;
use super::response::ApiResult;
use crate::jmap::session::{
    Account, CAPABILITY_MAIL, CAPABILITY_SIEVE, CAPABILITY_SUBMISSION, PrimaryAccounts, Session,
};

/// Feature set of this API, bumped on incompatible changes
const API_CAPABILITIES: &[&str] = &["mail:1"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexLimits {
    max_size_upload: u64,
    max_concurrent_upload: u64,
    max_size_request: u64,
    max_concurrent_requests: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MailLimits {
    max_mailbox_depth: Option<u64>,
    max_size_mailbox_name: Option<u64>,
    max_mailboxes_per_email: Option<u64>,
    max_size_attachments_per_email: Option<u64>,
    may_create_top_level_mailbox: Option<bool>,
    #[serde(skip_deserializing)]
    max_delayed_send: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SieveLimits {
    max_size_script_name: Option<u64>,
    max_size_script: Option<u64>,
    max_number_scripts: Option<u64>,
    max_number_redirects: Option<u64>,
}

#[derive(Debug, Serialize)]
struct IndexAccountCapabilities {
    mail: MailLimits,
    sieve: SieveLimits,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexAccount<'a> {
    account_id: &'a str,
    name: &'a str,
    is_personal: bool,
    is_read_only: bool,
    capabilities: IndexAccountCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse<'a> {
    version: &'static str,
    capabilities: &'static [&'static str],
    limits: IndexLimits,
    accounts: Vec<IndexAccount<'a>>,
    primary_accounts: &'a PrimaryAccounts,
}

fn capability<T: for<'de> Deserialize<'de> + Default>(account: &Account, uri: &str) -> T {
    account
        .account_capabilities
        .get(uri)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn index_accounts(session: &Session) -> Vec<IndexAccount<'_>> {
    session
        .accounts
        .iter()
        .map(|(id, account)| {
            let mut mail: MailLimits = capability(account, CAPABILITY_MAIL);
            mail.max_delayed_send = account
                .account_capabilities
                .get(CAPABILITY_SUBMISSION)
                .and_then(|s| s.get("maxDelayedSend"))
                .and_then(Value::as_u64);
            IndexAccount {
                account_id: id,
                name: &account.name,
                is_personal: account.is_personal,
                is_read_only: account.is_read_only,
                capabilities: IndexAccountCapabilities {
                    mail,
                    sieve: capability(account, CAPABILITY_SIEVE),
                },
            }
        })
        .collect()
}

pub(super) async fn index(req: Req) -> ApiResult {
    let session = &req.session;
    let body = IndexResponse {
        version: env!("CARGO_PKG_VERSION"),
        capabilities: API_CAPABILITIES,
        limits: IndexLimits {
            max_size_upload: session.core.max_size_upload,
            max_concurrent_upload: session.core.max_concurrent_upload,
            max_size_request: session.core.max_size_request,
            max_concurrent_requests: session.core.max_concurrent_requests,
        },
        accounts: index_accounts(session),
        primary_accounts: &session.primary_accounts,
    };
    req.respond(StatusCode::OK, &body, &session.state, "", None)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::api::tests::{app, get, send};

    #[tokio::test]
    async fn describes_limits_accounts_and_primary_accounts() {
        let app = app();
        for uri in ["/groupware", "/groupware/"] {
            let (status, headers, body) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(headers["etag"], "\"s0\"");
            assert_eq!(body["capabilities"][0], "mail:1");
            assert_eq!(body["limits"]["maxSizeUpload"], 50_000_000);
            assert_eq!(body["accounts"][0]["accountId"], "a1");
            assert_eq!(body["accounts"][0]["capabilities"]["mail"]["maxMailboxDepth"], 10);
            assert_eq!(body["primaryAccounts"]["mail"], "a1");
            assert_eq!(body["primaryAccounts"]["contact"], "c1");
        }
        assert!(app.fake.requests().is_empty());
    }
}
