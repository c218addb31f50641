//! Address books, calendars and task lists with the items they hold

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use serde_json::Value;
use tracing::warn;

use super::Groupware;
use super::request::Req;
use super::response::ApiResult;
use crate::errors::GroupwareError;
use crate::jmap::session::AccountRole;
use crate::jmap::{CollectionKind, ItemPage};
use crate::jscontact;

fn role(kind: CollectionKind) -> AccountRole {
    match kind {
        CollectionKind::AddressBook => AccountRole::Contact,
        CollectionKind::Calendar => AccountRole::Calendar,
        CollectionKind::TaskList => AccountRole::Task,
    }
}

/// First language range of `Accept-Language`, without its weight
fn preferred_language(accept_language: &str) -> Option<&str> {
    accept_language
        .split(',')
        .next()
        .and_then(|range| range.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != "*")
}

async fn list_collections(g: &Groupware, req: &Req, kind: CollectionKind) -> ApiResult {
    let account_id = req.account(role(kind))?;
    let reply = g
        .client
        .get_collections(&req.session, req.language(), kind, &account_id, None)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn get_collection(g: &Groupware, req: &Req, kind: CollectionKind, param: &str) -> ApiResult {
    let account_id = req.account(role(kind))?;
    let id = req.path(param)?.to_owned();
    let reply = g
        .client
        .get_collections(
            &req.session,
            req.language(),
            kind,
            &account_id,
            Some(std::slice::from_ref(&id)),
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    match reply.value.first() {
        Some(collection) => req.respond(
            StatusCode::OK,
            collection,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        ),
        None => Err(req.not_found(&reply.session_state)),
    }
}

async fn list_items(g: &Groupware, req: &Req, kind: CollectionKind, param: &str) -> ApiResult {
    let account_id = req.account(role(kind))?;
    let collection_id = req.path(param)?;
    let offset = req.parse_count("offset")?.unwrap_or(0);
    let limit = req.parse_count("limit")?.unwrap_or(0);
    let reply = g
        .client
        .query_items::<Value>(
            &req.session,
            req.language(),
            kind.item(),
            &account_id,
            collection_id,
            offset,
            limit,
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn get_addressbooks(State(g): State<Groupware>, req: Req) -> ApiResult {
    list_collections(&g, &req, CollectionKind::AddressBook).await
}

async fn get_addressbook(State(g): State<Groupware>, req: Req) -> ApiResult {
    get_collection(&g, &req, CollectionKind::AddressBook, "addressbookid").await
}

async fn get_calendars(State(g): State<Groupware>, req: Req) -> ApiResult {
    list_collections(&g, &req, CollectionKind::Calendar).await
}

async fn get_calendar(State(g): State<Groupware>, req: Req) -> ApiResult {
    get_collection(&g, &req, CollectionKind::Calendar, "calendarid").await
}

async fn get_events(State(g): State<Groupware>, req: Req) -> ApiResult {
    list_items(&g, &req, CollectionKind::Calendar, "calendarid").await
}

async fn get_tasklists(State(g): State<Groupware>, req: Req) -> ApiResult {
    list_collections(&g, &req, CollectionKind::TaskList).await
}

async fn get_tasklist(State(g): State<Groupware>, req: Req) -> ApiResult {
    get_collection(&g, &req, CollectionKind::TaskList, "tasklistid").await
}

async fn get_tasks(State(g): State<Groupware>, req: Req) -> ApiResult {
    list_items(&g, &req, CollectionKind::TaskList, "tasklistid").await
}

/// Cards of an address book, localized to the preferred language
async fn get_contacts(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Contact)?;
    let address_book_id = req.path("addressbookid")?;
    let offset = req.parse_count("offset")?.unwrap_or(0);
    let limit = req.parse_count("limit")?.unwrap_or(0);
    let reply = g
        .client
        .query_items::<Value>(
            &req.session,
            req.language(),
            CollectionKind::AddressBook.item(),
            &account_id,
            address_book_id,
            offset,
            limit,
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Some(language) = req.language().and_then(preferred_language) else {
        return req.ok(&reply);
    };
    let page = &reply.value;
    let items = page
        .items
        .iter()
        .map(|card| {
            jscontact::localized(card, language).unwrap_or_else(|e| {
                let card_id = card["id"].as_str().unwrap_or_default();
                warn!(card_id, language, pointer = %e.pointer, error = %e.message, "ignoring invalid localization");
                card.clone()
            })
        })
        .collect();
    let localized = ItemPage {
        items,
        total: page.total,
        position: page.position,
        query_state: page.query_state.clone(),
    };
    req.respond(
        StatusCode::OK,
        &localized,
        &reply.session_state,
        &reply.state,
        reply.language.as_deref(),
    )
}

async fn create_contact(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Contact)?;
    let address_book_id = req.path("addressbookid")?.to_owned();
    let value: Value = req.body(&body)?;
    let mut card = jscontact::parse_card(value).map_err(|e| req.body_error(&e.pointer, e.message))?;
    card.id.clear();
    card.address_book_ids = [(address_book_id, true)].into();
    if card.uid.is_empty() {
        card.uid = format!("urn:uuid:{}", uuid::Uuid::new_v4());
    }
    let reply = g
        .client
        .create_contact_card(&req.session, req.language(), &account_id, &card)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.created(&reply)
}

async fn delete_contact(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Contact)?;
    let id = req.path("contactid")?.to_owned();
    let reply = g
        .client
        .delete_contact_cards(&req.session, req.language(), &account_id, &[id])
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.deleted(&GroupwareError::FAILED_TO_DELETE_CONTACT, &reply, true)
}

pub(super) fn router() -> Router<Groupware> {
    Router::new()
        .route("/accounts/{accountid}/addressbooks", get(get_addressbooks))
        .route(
            "/accounts/{accountid}/addressbooks/{addressbookid}",
            get(get_addressbook),
        )
        .route(
            "/accounts/{accountid}/addressbooks/{addressbookid}/contacts",
            get(get_contacts).post(create_contact),
        )
        .route(
            "/accounts/{accountid}/addressbooks/{addressbookid}/contacts/{contactid}",
            delete(delete_contact),
        )
        .route("/accounts/{accountid}/calendars", get(get_calendars))
        .route("/accounts/{accountid}/calendars/{calendarid}", get(get_calendar))
        .route("/accounts/{accountid}/calendars/{calendarid}/events", get(get_events))
        .route("/accounts/{accountid}/tasklists", get(get_tasklists))
        .route("/accounts/{accountid}/tasklists/{tasklistid}", get(get_tasklist))
        .route("/accounts/{accountid}/tasklists/{tasklistid}/tasks", get(get_tasks))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::StatusCode;
    use serde_json::json;

    use super::preferred_language;
    use crate::api::tests::{app, get, json, request, send};

    #[test]
    fn preferred_language_is_the_first_range() {
        assert_eq!(preferred_language("de-AT;q=0.9, en"), Some("de-AT"));
        assert_eq!(preferred_language("*"), None);
        assert_eq!(preferred_language(""), None);
    }

    #[tokio::test]
    async fn address_books_use_the_primary_contacts_account() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["AddressBook/get", {"accountId": "c1", "state": "ab1", "list": [{"id": "b1", "name": "Personal"}]}, "0"]]),
        );
        let (status, headers, body) = send(&app, get("/groupware/accounts/_/addressbooks")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"ab1\"");
        assert_eq!(body, json!([{"id": "b1", "name": "Personal"}]));
        assert_eq!(app.fake.last_request().method_calls[0].arguments()["accountId"], "c1");
    }

    #[tokio::test]
    async fn collections_are_guarded_by_their_capability() {
        let app = app();
        let (status, _, body) = send(&app, get("/groupware/accounts/c1/calendars")).await;
        assert_eq!(status, StatusCode::EXPECTATION_FAILED);
        assert_eq!(body["errors"][0]["code"], "MISSING_CAP_CALENDAR");

        let (status, _, body) = send(&app, get("/groupware/accounts/a1/tasklists/t1/tasks")).await;
        assert_eq!(status, StatusCode::EXPECTATION_FAILED);
        assert_eq!(body["errors"][0]["code"], "MISSING_CAP_TASK");
        assert!(app.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_address_book_is_not_found() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["AddressBook/get", {"accountId": "c1", "state": "ab1", "list": [], "notFound": ["zz"]}, "0"]]),
        );
        let (status, _, body) = send(&app, get("/groupware/accounts/c1/addressbooks/zz")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOTFND");
    }

    #[tokio::test]
    async fn contacts_are_localized_to_the_preferred_language() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([
                ["ContactCard/query", {"accountId": "c1", "queryState": "cq", "ids": ["k1"], "position": 0, "total": 1}, "0"],
                ["ContactCard/get", {"accountId": "c1", "state": "cs", "list": [{
                    "id": "k1",
                    "uid": "urn:uuid:k1",
                    "addressBookIds": {"b1": true},
                    "titles": {"t1": {"name": "Engineer"}},
                    "localizations": {"de": {"titles/t1/name": "Ingenieurin"}}
                }]}, "1"]
            ]),
        );
        let req = request("GET", "/groupware/accounts/c1/addressbooks/b1/contacts")
            .header("accept-language", "de")
            .body(Body::empty())
            .expect("request");
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"cq\"");
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["titles"]["t1"]["name"], "Ingenieurin");
        let sent = app.fake.last_request();
        assert_eq!(sent.method_calls[0].arguments()["filter"], json!({"inAddressBook": "b1"}));
    }

    #[tokio::test]
    async fn new_contacts_are_validated_before_creation() {
        let app = app();
        let (status, _, body) = send(
            &app,
            json(
                "POST",
                "/groupware/accounts/c1/addressbooks/b1/contacts",
                &json!({"emails": {"e1": {"address": "x@example.com", "pref": 101}}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "INVREQB");
        assert_eq!(body["errors"][0]["source"]["pointer"], "/emails/e1/pref");
        assert!(app.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn undecodable_contacts_point_at_the_member_without_decoder_text() {
        let app = app();
        let (status, _, body) = send(
            &app,
            json(
                "POST",
                "/groupware/accounts/c1/addressbooks/b1/contacts",
                &json!({"emails": {"e1": {"address": "x@example.com", "pref": "high"}}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error = &body["errors"][0];
        assert_eq!(error["code"], "INVREQB");
        assert_eq!(error["source"]["pointer"], "/emails/e1");
        assert_eq!(error["detail"], "not a valid contact card");
        assert!(app.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn listed_contacts_keep_unknown_enumerated_values() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([
                ["ContactCard/query", {"accountId": "c1", "queryState": "cq", "ids": ["k1"], "position": 0, "total": 1}, "0"],
                ["ContactCard/get", {"accountId": "c1", "state": "cs", "list": [{
                    "id": "k1",
                    "uid": "urn:uuid:k1",
                    "addressBookIds": {"b1": true},
                    "relatedTo": {"urn:uuid:u2": {"relation": {"example.com:mentor": true}}},
                    "titles": {"t1": {"name": "Engineer"}},
                    "localizations": {"de": {"titles/t1/name": "Ingenieurin"}}
                }]}, "1"]
            ]),
        );
        let req = request("GET", "/groupware/accounts/c1/addressbooks/b1/contacts")
            .header("accept-language", "de")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let card = &body["items"][0];
        assert_eq!(card["relatedTo"]["urn:uuid:u2"]["relation"]["example.com:mentor"], true);
        assert_eq!(card["titles"]["t1"]["name"], "Ingenieurin");
        assert!(card.get("localizations").is_none());
    }

    #[tokio::test]
    async fn created_contacts_belong_to_the_address_book() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([
                ["ContactCard/set", {"accountId": "c1", "newState": "cs2", "created": {"c": {"id": "k9"}}}, "0"],
                ["ContactCard/get", {"accountId": "c1", "state": "cs2", "list": [{"id": "k9", "uid": "urn:uuid:x", "addressBookIds": {"b1": true}}]}, "1"]
            ]),
        );
        let (status, headers, body) = send(
            &app,
            json(
                "POST",
                "/groupware/accounts/c1/addressbooks/b1/contacts",
                &json!({"id": "ignored", "name": {"full": "Jane Doe"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["etag"], "\"cs2\"");
        assert_eq!(body["id"], "k9");
        let sent = app.fake.last_request();
        let card = &sent.method_calls[0].arguments()["create"]["c"];
        assert!(card.get("id").is_none());
        assert_eq!(card["addressBookIds"], json!({"b1": true}));
        assert!(card["uid"].as_str().is_some_and(|uid| uid.starts_with("urn:uuid:")));
    }
}
