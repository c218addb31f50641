//! Mailboxes and their changes

use std::cmp::Ordering;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Map, Value};
use tracing::debug;

use super::Groupware;
use super::request::Req;
use super::response::{ApiResult, Failure};
use crate::errors::GroupwareError;
use crate::jmap::model::{Mailbox, MailboxFilter};
use crate::jmap::session::AccountRole;

fn role_score(mailbox: &Mailbox) -> u32 {
    match mailbox.role.as_deref() {
        Some("inbox") => 100,
        Some("drafts") => 200,
        Some("sent") => 300,
        Some("junk") => 400,
        Some("trash") => 500,
        _ => 1000,
    }
}

/// Sort order, then well-known roles, then name
fn compare_mailboxes(a: &Mailbox, b: &Mailbox) -> Ordering {
    a.sort_order
        .unwrap_or(0)
        .cmp(&b.sort_order.unwrap_or(0))
        .then_with(|| role_score(a).cmp(&role_score(b)))
        .then_with(|| a.name.cmp(&b.name))
}

fn max_changes(req: &Req) -> Result<u64, Failure> {
    Ok(req.parse_count("maxchanges")?.unwrap_or(0))
}

async fn get_mailboxes(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let filter = MailboxFilter {
        name: req.query("name").map(str::to_owned),
        role: req.query("role").map(str::to_owned),
        is_subscribed: req.parse_bool("subscribed")?,
    };
    let reply = if filter.is_empty() {
        g.client
            .get_mailboxes(&req.session, req.language(), &account_id, None)
            .await
    } else {
        g.client
            .search_mailboxes(&req.session, req.language(), &account_id, &filter)
            .await
    }
    .map_err(|e| req.jmap_error(e))?;
    let reply = reply.map(|mut mailboxes| {
        mailboxes.sort_by(compare_mailboxes);
        mailboxes
    });
    req.ok(&reply)
}

async fn get_mailbox(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("mailboxid")?.to_owned();
    let reply = g
        .client
        .get_mailboxes(&req.session, req.language(), &account_id, Some(&[id]))
        .await
        .map_err(|e| req.jmap_error(e))?;
    match reply.value.first() {
        Some(mailbox) => req.respond(
            StatusCode::OK,
            mailbox,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        ),
        None => Err(req.not_found(&reply.session_state)),
    }
}

async fn create_mailbox(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let mut mailbox: Map<String, Value> = req.body(&body)?;
    mailbox.remove("id");
    let reply = g
        .client
        .create_mailbox(&req.session, req.language(), &account_id, mailbox)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.created(&reply)
}

async fn update_mailbox(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("mailboxid")?;
    let patch: Map<String, Value> = req.body(&body)?;
    let reply = g
        .client
        .update_mailbox(&req.session, req.language(), &account_id, id, patch, req.if_match())
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn delete_mailbox(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let ids: Vec<String> = req
        .path("mailboxid")?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect();
    if ids.is_empty() {
        return req.no_content(&req.session.state, "");
    }
    let reply = g
        .client
        .delete_mailboxes(&req.session, req.language(), &account_id, &ids, req.if_match())
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.deleted(&GroupwareError::FAILED_TO_DELETE_MAILBOX, &reply, false)
}

async fn get_mailbox_changes(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let mailbox_id = req.path("mailboxid")?;
    let max_changes = max_changes(&req)?;
    let since = req
        .query("since")
        .or_else(|| req.if_none_match())
        .unwrap_or_default();
    debug!(account_id = %account_id, mailbox_id = %mailbox_id, since = %since, max_changes, "mailbox changes");
    let reply = g
        .client
        .get_mailbox_changes(&req.session, req.language(), &account_id, since, max_changes)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn get_mailbox_changes_for_all_accounts(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_ids = req.accounts_with(AccountRole::Mail)?;
    let since = req.parse_map("since");
    let max_changes = max_changes(&req)?;
    let reply = g
        .client
        .get_mailbox_changes_for_accounts(&req.session, req.language(), &account_ids, &since, max_changes)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

pub(super) fn router() -> Router<Groupware> {
    Router::new()
        .route(
            "/accounts/{accountid}/mailboxes",
            get(get_mailboxes).post(create_mailbox),
        )
        .route(
            "/accounts/{accountid}/mailboxes/{mailboxid}",
            get(get_mailbox).patch(update_mailbox).delete(delete_mailbox),
        )
        .route(
            "/accounts/{accountid}/mailboxes/{mailboxid}/changes",
            get(get_mailbox_changes),
        )
        .route(
            "/accounts/all/mailboxes/changes",
            get(get_mailbox_changes_for_all_accounts),
        )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::tests::{app, get, json, request, send};

    #[tokio::test]
    async fn lists_mailboxes_with_inbox_first() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Mailbox/get", {"accountId": "a1", "state": "m1", "list": [
                {"id": "x", "name": "Archive"},
                {"id": "t", "name": "Trash", "role": "trash"},
                {"id": "i", "name": "Inbox", "role": "inbox"}
            ]}, "0"]]),
        );
        let (status, headers, body) = send(&app, get("/groupware/accounts/a1/mailboxes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"m1\"");
        let ids: Vec<&str> = body
            .as_array()
            .expect("list")
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["i", "t", "x"]);
        assert_eq!(app.fake.last_request().method_calls[0].name(), "Mailbox/get");
    }

    #[tokio::test]
    async fn filters_go_through_mailbox_query() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([
                ["Mailbox/query", {"accountId": "a1", "queryState": "q", "ids": ["i"]}, "0"],
                ["Mailbox/get", {"accountId": "a1", "state": "m1", "list": [{"id": "i", "role": "inbox"}]}, "1"]
            ]),
        );
        let (status, _, body) = send(
            &app,
            get("/groupware/accounts/a1/mailboxes?role=inbox&subscribed=true"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "i");
        let sent = app.fake.last_request();
        assert_eq!(sent.method_calls[0].arguments()["filter"], json!({"role": "inbox", "isSubscribed": true}));
    }

    #[tokio::test]
    async fn invalid_subscribed_flag_is_a_parameter_error() {
        let app = app();
        let (status, _, body) = send(&app, get("/groupware/accounts/a1/mailboxes?subscribed=maybe")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "INVREQP");
        assert_eq!(body["errors"][0]["source"]["parameter"], "subscribed");
        assert!(app.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_mailbox_is_not_found() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Mailbox/get", {"accountId": "a1", "state": "m1", "list": [], "notFound": ["nope"]}, "0"]]),
        );
        let (status, _, body) = send(&app, get("/groupware/accounts/a1/mailboxes/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOTFND");
    }

    #[tokio::test]
    async fn creates_a_mailbox() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Mailbox/set", {"accountId": "a1", "newState": "m2", "created": {"c": {"id": "n1", "name": "Projects"}}}, "0"]]),
        );
        let (status, headers, body) = send(
            &app,
            json("POST", "/groupware/accounts/a1/mailboxes", &json!({"id": "ignored", "name": "Projects"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["etag"], "\"m2\"");
        assert_eq!(body["id"], "n1");
        let sent = app.fake.last_request();
        assert_eq!(sent.method_calls[0].arguments()["create"]["c"], json!({"name": "Projects"}));
    }

    #[tokio::test]
    async fn deletion_passes_if_match_as_if_in_state() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Mailbox/set", {"accountId": "a1", "newState": "m3", "destroyed": ["m1"]}, "0"]]),
        );
        let req = request("DELETE", "/groupware/accounts/a1/mailboxes/m1")
            .header("if-match", "\"m2\"")
            .body(Body::empty())
            .expect("request");
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(headers["etag"], "\"m3\"");
        let sent = app.fake.last_request();
        assert_eq!(sent.method_calls[0].arguments()["ifInState"], "m2");
        assert_eq!(sent.method_calls[0].arguments()["destroy"], json!(["m1"]));
    }

    #[tokio::test]
    async fn changes_of_all_accounts_start_from_the_given_states() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([
                ["Mailbox/changes", {"accountId": "a1", "oldState": "m1", "newState": "m2", "hasMoreChanges": false, "created": ["n"], "updated": [], "destroyed": []}, "a1:0"],
                ["Mailbox/get", {"accountId": "a1", "state": "m2", "list": [{"id": "n", "name": "New"}]}, "a1:1"],
                ["Mailbox/get", {"accountId": "a1", "state": "m2", "list": []}, "a1:2"],
                ["Mailbox/changes", {"accountId": "a2", "oldState": "", "newState": "z1", "hasMoreChanges": false, "created": [], "updated": [], "destroyed": ["d"]}, "a2:0"],
                ["Mailbox/get", {"accountId": "a2", "state": "z1", "list": []}, "a2:1"],
                ["Mailbox/get", {"accountId": "a2", "state": "z1", "list": []}, "a2:2"]
            ]),
        );
        let (status, headers, body) = send(
            &app,
            get("/groupware/accounts/all/mailboxes/changes?since.a1=m1&maxchanges=5"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"a1:m2,a2:z1\"");
        assert_eq!(body["a1"]["created"][0]["name"], "New");
        assert_eq!(body["a2"]["destroyed"][0], "d");
        let sent = app.fake.last_request();
        assert_eq!(sent.method_calls[0].arguments()["sinceState"], "m1");
        assert_eq!(sent.method_calls[0].arguments()["maxChanges"], 5);
    }
}
