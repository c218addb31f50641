//! Account-scoped operations: identities, vacation response, quotas and blobs

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::http::BlobDownload;
use super::model::{Blob, GetResponse, Identity, Invocation, Quota, SetError, SetResponse, VacationResponse};
use super::session::Session;
use super::{
    JmapClient, JmapError, JmapErrorKind, JmapResult, Reply, first_set_error, mcid, response_for,
    squash_states, unique,
};

/// Id of the only `VacationResponse` object of an account
pub const VACATION_RESPONSE_ID: &str = "singleton";

const BLOB_PROPERTIES: &[&str] = &["size", "digest:sha", "digest:sha-256"];

/// Quotas of one account
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReply {
    pub state: String,
    pub list: Vec<Quota>,
}

impl JmapClient {
    pub async fn get_identities(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
    ) -> JmapResult<Reply<Vec<Identity>>> {
        self.command(
            session,
            accept_language,
            "get_identities",
            vec![Invocation::new("Identity/get", json!({ "accountId": account_id }), "0")],
            |response| {
                let get: GetResponse<Identity> = response_for(response, "Identity/get", "0")?;
                Ok((get.list, get.state))
            },
        )
        .await
    }

    /// Fetch one identity, `None` if the server does not know it
    pub async fn get_identity(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        id: &str,
    ) -> JmapResult<Reply<Option<Identity>>> {
        let get = json!({ "accountId": account_id, "ids": [id] });
        self.command(
            session,
            accept_language,
            "get_identity",
            vec![Invocation::new("Identity/get", get, "0")],
            |response| {
                let get: GetResponse<Identity> = response_for(response, "Identity/get", "0")?;
                Ok((get.list.into_iter().next(), get.state))
            },
        )
        .await
    }

    pub async fn create_identity(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        identity: Map<String, Value>,
    ) -> JmapResult<Reply<Identity>> {
        let set = json!({ "accountId": account_id, "create": { "c": identity } });
        let calls = vec![
            Invocation::new("Identity/set", set, "0"),
            Invocation::new(
                "Identity/get",
                json!({ "accountId": account_id, "#ids": super::reference("0", "Identity/set", "/created/c/id") }),
                "1",
            ),
        ];
        self.command(session, accept_language, "create_identity", calls, |response| {
            let set: SetResponse<Value> = response_for(response, "Identity/set", "0")?;
            first_set_error(&set.not_created)?;
            let get: GetResponse<Identity> = response_for(response, "Identity/get", "1")?;
            let identity = get.list.into_iter().next().ok_or_else(|| {
                JmapError::new(
                    JmapErrorKind::InvalidJmapResponsePayload,
                    "Identity/get does not return the created identity",
                )
            })?;
            Ok((identity, set.new_state))
        })
        .await
    }

    /// Patch an identity and return it as stored afterwards
    pub async fn update_identity(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> JmapResult<Reply<Identity>> {
        let calls = vec![
            Invocation::new(
                "Identity/set",
                json!({ "accountId": account_id, "update": { id: patch } }),
                "0",
            ),
            Invocation::new("Identity/get", json!({ "accountId": account_id, "ids": [id] }), "1"),
        ];
        self.command(session, accept_language, "update_identity", calls, |response| {
            let set: SetResponse<Value> = response_for(response, "Identity/set", "0")?;
            first_set_error(&set.not_updated)?;
            let get: GetResponse<Identity> = response_for(response, "Identity/get", "1")?;
            let identity = get.list.into_iter().next().ok_or_else(|| {
                JmapError::new(JmapErrorKind::NotFound, format!("identity '{id}' not found"))
            })?;
            Ok((identity, set.new_state))
        })
        .await
    }

    /// Destroy identities; returns the ids that could not be destroyed
    pub async fn delete_identities(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        ids: &[String],
    ) -> JmapResult<Reply<BTreeMap<String, SetError>>> {
        let set = json!({ "accountId": account_id, "destroy": ids });
        self.command(
            session,
            accept_language,
            "delete_identities",
            vec![Invocation::new("Identity/set", set, "0")],
            |response| {
                let set: SetResponse<Value> = response_for(response, "Identity/set", "0")?;
                Ok((set.not_destroyed, set.new_state))
            },
        )
        .await
    }

    /// # Errors
    ///
    /// `NotFound` if the account has no vacation response object.
    pub async fn get_vacation_response(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
    ) -> JmapResult<Reply<VacationResponse>> {
        let get = json!({ "accountId": account_id, "ids": [VACATION_RESPONSE_ID] });
        self.command(
            session,
            accept_language,
            "get_vacation_response",
            vec![Invocation::new("VacationResponse/get", get, "0")],
            |response| {
                let get: GetResponse<VacationResponse> =
                    response_for(response, "VacationResponse/get", "0")?;
                let vacation = get.list.into_iter().next().ok_or_else(|| {
                    JmapError::new(JmapErrorKind::NotFound, "account has no vacation response")
                })?;
                Ok((vacation, get.state))
            },
        )
        .await
    }

    /// Replace every property of the vacation response
    ///
    /// Unset optional properties are cleared on the server.
    pub async fn set_vacation_response(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        vacation: &VacationResponse,
    ) -> JmapResult<Reply<VacationResponse>> {
        let patch = json!({
            "isEnabled": vacation.is_enabled,
            "fromDate": vacation.from_date,
            "toDate": vacation.to_date,
            "subject": vacation.subject,
            "textBody": vacation.text_body,
            "htmlBody": vacation.html_body,
        });
        let calls = vec![
            Invocation::new(
                "VacationResponse/set",
                json!({ "accountId": account_id, "update": { VACATION_RESPONSE_ID: patch } }),
                "0",
            ),
            Invocation::new(
                "VacationResponse/get",
                json!({ "accountId": account_id, "ids": [VACATION_RESPONSE_ID] }),
                "1",
            ),
        ];
        self.command(session, accept_language, "set_vacation_response", calls, |response| {
            let set: SetResponse<Value> = response_for(response, "VacationResponse/set", "0")?;
            first_set_error(&set.not_updated)?;
            let get: GetResponse<VacationResponse> =
                response_for(response, "VacationResponse/get", "1")?;
            let vacation = get.list.into_iter().next().ok_or_else(|| {
                JmapError::new(JmapErrorKind::NotFound, "account has no vacation response")
            })?;
            Ok((vacation, set.new_state))
        })
        .await
    }

    /// Quotas of every account in `account_ids`
    pub async fn get_quotas(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
    ) -> JmapResult<Reply<BTreeMap<String, QuotaReply>>> {
        let accounts = unique(account_ids);
        let calls = accounts
            .iter()
            .map(|account_id| {
                Invocation::new(
                    "Quota/get",
                    json!({ "accountId": account_id }),
                    mcid(account_id, "0"),
                )
            })
            .collect();
        self.command(session, accept_language, "get_quotas", calls, |response| {
            let mut results = BTreeMap::new();
            for account_id in &accounts {
                let get: GetResponse<Quota> =
                    response_for(response, "Quota/get", &mcid(account_id, "0"))?;
                results.insert(
                    account_id.clone(),
                    QuotaReply {
                        state: get.state,
                        list: get.list,
                    },
                );
            }
            let state = squash_states(
                results
                    .iter()
                    .map(|(a, q)| (a.as_str(), q.state.as_str())),
            );
            Ok((results, state))
        })
        .await
    }

    /// Blob metadata, `None` if the blob does not exist
    pub async fn get_blob(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        blob_id: &str,
    ) -> JmapResult<Reply<Option<Blob>>> {
        let get = json!({ "accountId": account_id, "ids": [blob_id], "properties": BLOB_PROPERTIES });
        self.command(
            session,
            accept_language,
            "get_blob",
            vec![Invocation::new("Blob/get", get, "0")],
            |response| {
                let get: GetResponse<Blob> = response_for(response, "Blob/get", "0")?;
                Ok((get.list.into_iter().next(), get.state))
            },
        )
        .await
    }

    /// Stream a blob through the session's download URL template
    pub async fn download_blob_stream(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        blob_id: &str,
        name: &str,
        media_type: &str,
    ) -> JmapResult<Option<BlobDownload>> {
        let url = session.blob_download_url(account_id, blob_id, name, media_type);
        self.transport()
            .download_blob(session, url, accept_language)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use serde_json::json;

    use super::super::tests::FakeTransport;
    use super::*;

    async fn client() -> (Arc<FakeTransport>, JmapClient, Session) {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        (fake, client, session)
    }

    #[tokio::test]
    async fn vacation_update_clears_unset_properties() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["VacationResponse/set", {"newState": "v2", "updated": {"singleton": null}}, "0"],
                ["VacationResponse/get", {"state": "v2", "list": [{"id": "singleton", "isEnabled": true}]}, "1"]
            ]),
        );
        let reply = client
            .set_vacation_response(
                &session,
                None,
                "a1",
                &VacationResponse {
                    is_enabled: true,
                    subject: Some("Away".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .expect("vacation");
        assert!(reply.value.is_enabled);
        assert_eq!(reply.state, "v2");
        let request = fake.last_request();
        let patch = &request.method_calls[0].arguments()["update"]["singleton"];
        assert_eq!(patch["subject"], "Away");
        assert_eq!(patch["textBody"], Value::Null);
        assert!(patch.get("id").is_none());
    }

    #[tokio::test]
    async fn quota_state_is_squashed_over_accounts() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["Quota/get", {"state": "q1", "list": [{"id": "q", "resourceType": "octets", "used": 10, "hardLimit": 100, "scope": "account", "name": "mail", "types": ["Mail"]}]}, "a1:0"],
                ["Quota/get", {"state": "q2", "list": []}, "a2:0"]
            ]),
        );
        let reply = client
            .get_quotas(&session, None, &["a2".to_owned(), "a1".to_owned()])
            .await
            .expect("quotas");
        assert_eq!(reply.state, "a1:q1,a2:q2");
        assert_eq!(reply.value["a1"].list[0].hard_limit, 100);
    }

    #[tokio::test]
    async fn unknown_blob_downloads_as_none() {
        let (fake, client, session) = client().await;
        let url = session.blob_download_url("a1", "B1", "mail.eml", "message/rfc822");
        fake.blobs
            .lock()
            .expect("lock")
            .insert(url, b"Subject: x\r\n\r\n".to_vec());

        let mut found = client
            .download_blob_stream(&session, None, "a1", "B1", "mail.eml", "message/rfc822")
            .await
            .expect("download")
            .expect("blob exists");
        let chunk = found.body.next().await.expect("chunk").expect("bytes");
        assert!(chunk.starts_with(b"Subject"));

        let missing = client
            .download_blob_stream(&session, None, "a1", "B2", "mail.eml", "message/rfc822")
            .await
            .expect("download");
        assert!(missing.is_none());
    }
}
