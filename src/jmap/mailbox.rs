//! `Mailbox/*` operations

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::model::{ChangesResponse, GetResponse, Invocation, Mailbox, MailboxFilter, QueryResponse, SetError, SetResponse};
use super::session::Session;
use super::{
    JmapClient, JmapError, JmapErrorKind, JmapResult, Reply, first_set_error, mcid, reference,
    response_for, squash_states, unique,
};

/// Mailboxes created, updated or destroyed since a state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxChanges {
    pub destroyed: Vec<String>,
    pub has_more_changes: bool,
    pub new_state: String,
    pub created: Vec<Mailbox>,
    pub updated: Vec<Mailbox>,
}

fn mailbox_changes_calls(
    account_id: &str,
    since_state: Option<&str>,
    max_changes: u64,
    tag: impl Fn(&str) -> String,
) -> Vec<Invocation> {
    let mut changes = json!({ "accountId": account_id, "sinceState": since_state.unwrap_or_default() });
    if max_changes > 0 {
        changes["maxChanges"] = json!(max_changes);
    }
    vec![
        Invocation::new("Mailbox/changes", changes, tag("0")),
        Invocation::new(
            "Mailbox/get",
            json!({
                "accountId": account_id,
                "#ids": reference(&tag("0"), "Mailbox/changes", "/created"),
            }),
            tag("1"),
        ),
        Invocation::new(
            "Mailbox/get",
            json!({
                "accountId": account_id,
                "#ids": reference(&tag("0"), "Mailbox/changes", "/updated"),
            }),
            tag("2"),
        ),
    ]
}

fn mailbox_changes_from(
    response: &super::model::JmapResponse,
    tag: impl Fn(&str) -> String,
) -> JmapResult<MailboxChanges> {
    let changes: ChangesResponse = response_for(response, "Mailbox/changes", &tag("0"))?;
    let created: GetResponse<Mailbox> = response_for(response, "Mailbox/get", &tag("1"))?;
    let updated: GetResponse<Mailbox> = response_for(response, "Mailbox/get", &tag("2"))?;
    Ok(MailboxChanges {
        destroyed: changes.destroyed,
        has_more_changes: changes.has_more_changes,
        new_state: changes.new_state,
        created: created.list,
        updated: updated.list,
    })
}

impl JmapClient {
    /// Fetch mailboxes by id, or all mailboxes of the account when `ids` is `None`
    pub async fn get_mailboxes(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        ids: Option<&[String]>,
    ) -> JmapResult<Reply<Vec<Mailbox>>> {
        let get = json!({ "accountId": account_id, "ids": ids });
        self.command(
            session,
            accept_language,
            "get_mailboxes",
            vec![Invocation::new("Mailbox/get", get, "0")],
            |response| {
                let get: GetResponse<Mailbox> = response_for(response, "Mailbox/get", "0")?;
                Ok((get.list, get.state))
            },
        )
        .await
    }

    /// Mailboxes matching `filter`, via `Mailbox/query` and `Mailbox/get`
    pub async fn search_mailboxes(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        filter: &MailboxFilter,
    ) -> JmapResult<Reply<Vec<Mailbox>>> {
        let calls = vec![
            Invocation::new(
                "Mailbox/query",
                json!({ "accountId": account_id, "filter": filter }),
                "0",
            ),
            Invocation::new(
                "Mailbox/get",
                json!({
                    "accountId": account_id,
                    "#ids": reference("0", "Mailbox/query", "/ids/*"),
                }),
                "1",
            ),
        ];
        self.command(session, accept_language, "search_mailboxes", calls, |response| {
            let get: GetResponse<Mailbox> = response_for(response, "Mailbox/get", "1")?;
            Ok((get.list, get.state))
        })
        .await
    }

    /// Id of the first mailbox with `role`, if any
    pub async fn find_mailbox_by_role(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        role: &str,
    ) -> JmapResult<Reply<Option<String>>> {
        let query = json!({ "accountId": account_id, "filter": { "role": role }, "limit": 1 });
        self.command(
            session,
            accept_language,
            "find_mailbox_by_role",
            vec![Invocation::new("Mailbox/query", query, "0")],
            |response| {
                let query: QueryResponse = response_for(response, "Mailbox/query", "0")?;
                Ok((query.ids.into_iter().next(), query.query_state))
            },
        )
        .await
    }

    /// Mailbox changes of one account since `since_state`
    pub async fn get_mailbox_changes(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        since_state: &str,
        max_changes: u64,
    ) -> JmapResult<Reply<MailboxChanges>> {
        let calls = mailbox_changes_calls(account_id, Some(since_state), max_changes, str::to_owned);
        self.command(session, accept_language, "get_mailbox_changes", calls, |response| {
            let changes = mailbox_changes_from(response, str::to_owned)?;
            let state = changes.new_state.clone();
            Ok((changes, state))
        })
        .await
    }

    /// Mailbox changes of several accounts, each from its own state
    ///
    /// Accounts missing from `since_states` are queried from the empty state.
    pub async fn get_mailbox_changes_for_accounts(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
        since_states: &BTreeMap<String, String>,
        max_changes: u64,
    ) -> JmapResult<Reply<BTreeMap<String, MailboxChanges>>> {
        let accounts = unique(account_ids);
        let mut calls = Vec::with_capacity(accounts.len() * 3);
        for account_id in &accounts {
            calls.extend(mailbox_changes_calls(
                account_id,
                since_states.get(account_id).map(String::as_str),
                max_changes,
                |tag| mcid(account_id, tag),
            ));
        }
        self.command(
            session,
            accept_language,
            "get_mailbox_changes_for_accounts",
            calls,
            |response| {
                let mut results = BTreeMap::new();
                for account_id in &accounts {
                    let changes = mailbox_changes_from(response, |tag| mcid(account_id, tag))?;
                    results.insert(account_id.clone(), changes);
                }
                let state = squash_states(
                    results
                        .iter()
                        .map(|(a, c)| (a.as_str(), c.new_state.as_str())),
                );
                Ok((results, state))
            },
        )
        .await
    }

    /// Create a mailbox from its JMAP properties
    pub async fn create_mailbox(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        mailbox: Map<String, Value>,
    ) -> JmapResult<Reply<Mailbox>> {
        let set = json!({ "accountId": account_id, "create": { "c": mailbox } });
        self.command(
            session,
            accept_language,
            "create_mailbox",
            vec![Invocation::new("Mailbox/set", set, "0")],
            |response| {
                let mut set: SetResponse<Mailbox> = response_for(response, "Mailbox/set", "0")?;
                first_set_error(&set.not_created)?;
                let created = set.created.remove("c").ok_or_else(|| {
                    JmapError::new(
                        JmapErrorKind::InvalidJmapResponsePayload,
                        "Mailbox/set response does not contain the created mailbox",
                    )
                })?;
                Ok((created, set.new_state))
            },
        )
        .await
    }

    /// Patch a mailbox and return it as stored afterwards
    pub async fn update_mailbox(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        id: &str,
        patch: Map<String, Value>,
        if_in_state: Option<&str>,
    ) -> JmapResult<Reply<Mailbox>> {
        let mut set = json!({ "accountId": account_id, "update": { id: patch } });
        if let Some(state) = if_in_state {
            set["ifInState"] = json!(state);
        }
        let calls = vec![
            Invocation::new("Mailbox/set", set, "0"),
            Invocation::new("Mailbox/get", json!({ "accountId": account_id, "ids": [id] }), "1"),
        ];
        self.command(session, accept_language, "update_mailbox", calls, |response| {
            let set: SetResponse<Value> = response_for(response, "Mailbox/set", "0")?;
            first_set_error(&set.not_updated)?;
            let get: GetResponse<Mailbox> = response_for(response, "Mailbox/get", "1")?;
            let mailbox = get.list.into_iter().next().ok_or_else(|| {
                JmapError::new(JmapErrorKind::NotFound, format!("mailbox '{id}' vanished after update"))
            })?;
            Ok((mailbox, set.new_state))
        })
        .await
    }

    /// Destroy mailboxes; returns the ids that could not be destroyed
    pub async fn delete_mailboxes(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        ids: &[String],
        if_in_state: Option<&str>,
    ) -> JmapResult<Reply<BTreeMap<String, SetError>>> {
        let mut set = json!({ "accountId": account_id, "destroy": ids });
        if let Some(state) = if_in_state {
            set["ifInState"] = json!(state);
        }
        self.command(
            session,
            accept_language,
            "delete_mailboxes",
            vec![Invocation::new("Mailbox/set", set, "0")],
            |response| {
                let set: SetResponse<Value> = response_for(response, "Mailbox/set", "0")?;
                Ok((set.not_destroyed, set.new_state))
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::super::tests::FakeTransport;
    use super::*;

    #[tokio::test]
    async fn all_account_changes_use_per_account_since_states() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        fake.respond(
            "s0",
            json!([
                ["Mailbox/changes", {"newState": "m5", "created": ["x"], "updated": [], "destroyed": []}, "a1:0"],
                ["Mailbox/get", {"state": "m5", "list": [{"id": "x", "name": "Projects"}]}, "a1:1"],
                ["Mailbox/get", {"state": "m5", "list": []}, "a1:2"],
                ["Mailbox/changes", {"newState": "n2", "destroyed": ["y"]}, "a2:0"],
                ["Mailbox/get", {"state": "n2", "list": []}, "a2:1"],
                ["Mailbox/get", {"state": "n2", "list": []}, "a2:2"]
            ]),
        );
        let since = BTreeMap::from([("a1".to_owned(), "m4".to_owned())]);
        let reply = client
            .get_mailbox_changes_for_accounts(
                &session,
                None,
                &["a1".to_owned(), "a2".to_owned()],
                &since,
                0,
            )
            .await
            .expect("changes");
        assert_eq!(reply.state, "a1:m5,a2:n2");
        assert_eq!(reply.value["a1"].created[0].name.as_deref(), Some("Projects"));
        assert_eq!(reply.value["a2"].destroyed, vec!["y"]);

        let request = fake.last_request();
        assert_eq!(request.method_calls[0].arguments()["sinceState"], "m4");
        assert_eq!(request.method_calls[3].arguments()["sinceState"], "");
        assert_eq!(request.method_calls[1].arguments()["#ids"]["resultOf"], "a1:0");
    }

    #[tokio::test]
    async fn update_forwards_if_in_state_and_reports_rejections() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        fake.respond(
            "s0",
            json!([
                ["Mailbox/set", {"newState": "m2", "notUpdated": {"m1": {"type": "forbidden"}}}, "0"],
                ["Mailbox/get", {"state": "m2", "list": []}, "1"]
            ]),
        );
        let mut patch = Map::new();
        patch.insert("name".to_owned(), json!("Renamed"));
        let err = client
            .update_mailbox(&session, None, "a1", "m1", patch, Some("m1state"))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, JmapErrorKind::Forbidden);
        let request = fake.last_request();
        assert_eq!(request.method_calls[0].arguments()["ifInState"], "m1state");
        assert_eq!(request.method_calls[0].arguments()["update"]["m1"]["name"], "Renamed");
    }

    #[tokio::test]
    async fn search_sends_only_the_set_filter_fields() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        fake.respond(
            "s0",
            json!([
                ["Mailbox/query", {"queryState": "q", "ids": ["m1"]}, "0"],
                ["Mailbox/get", {"state": "m9", "list": [{"id": "m1", "role": "inbox"}]}, "1"]
            ]),
        );
        let filter = MailboxFilter {
            role: Some("inbox".to_owned()),
            ..Default::default()
        };
        let reply = client
            .search_mailboxes(&session, None, "a1", &filter)
            .await
            .expect("mailboxes");
        assert_eq!(reply.state, "m9");
        assert_eq!(
            fake.last_request().method_calls[0].arguments()["filter"],
            json!({"role": "inbox"})
        );
    }
}
