//! Contacts, calendars and tasks: collections and the items they hold

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::model::{Collection, GetResponse, Invocation, QueryResponse, SetError, SetResponse};
use super::session::{CAPABILITY_CALENDARS, CAPABILITY_CONTACTS, CAPABILITY_TASKS, Session};
use super::{JmapClient, JmapError, JmapErrorKind, JmapResult, Reply, first_set_error, reference, response_for};
use crate::jscontact::ContactCard;

/// Container data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    AddressBook,
    Calendar,
    TaskList,
}

impl CollectionKind {
    pub fn data_type(self) -> &'static str {
        match self {
            Self::AddressBook => "AddressBook",
            Self::Calendar => "Calendar",
            Self::TaskList => "TaskList",
        }
    }

    pub fn capability(self) -> &'static str {
        match self {
            Self::AddressBook => CAPABILITY_CONTACTS,
            Self::Calendar => CAPABILITY_CALENDARS,
            Self::TaskList => CAPABILITY_TASKS,
        }
    }

    /// Data type of the objects the collection contains
    pub fn item(self) -> ItemKind {
        match self {
            Self::AddressBook => ItemKind::ContactCard,
            Self::Calendar => ItemKind::CalendarEvent,
            Self::TaskList => ItemKind::Task,
        }
    }
}

/// Item data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    ContactCard,
    CalendarEvent,
    Task,
}

impl ItemKind {
    pub fn data_type(self) -> &'static str {
        match self {
            Self::ContactCard => "ContactCard",
            Self::CalendarEvent => "CalendarEvent",
            Self::Task => "Task",
        }
    }

    /// Filter condition selecting items of one collection
    fn collection_condition(self) -> &'static str {
        match self {
            Self::ContactCard => "inAddressBook",
            Self::CalendarEvent => "inCalendar",
            Self::Task => "inTaskList",
        }
    }
}

/// One page of collection items
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub position: u64,
    pub query_state: String,
}

impl JmapClient {
    /// Collections of `kind`, all of them when `ids` is `None`
    pub async fn get_collections(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        kind: CollectionKind,
        account_id: &str,
        ids: Option<&[String]>,
    ) -> JmapResult<Reply<Vec<Collection>>> {
        let method = format!("{}/get", kind.data_type());
        let get = json!({ "accountId": account_id, "ids": ids });
        self.command(
            session,
            accept_language,
            "get_collections",
            vec![Invocation::new(&method, get, "0")],
            |response| {
                let get: GetResponse<Collection> = response_for(response, &method, "0")?;
                Ok((get.list, get.state))
            },
        )
        .await
    }

    /// Items of one collection, via `<Item>/query` and `<Item>/get`
    pub async fn query_items<T: DeserializeOwned>(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        kind: ItemKind,
        account_id: &str,
        collection_id: &str,
        offset: u64,
        limit: u64,
    ) -> JmapResult<Reply<ItemPage<T>>> {
        let query_method = format!("{}/query", kind.data_type());
        let get_method = format!("{}/get", kind.data_type());
        let mut query = json!({
            "accountId": account_id,
            "filter": { kind.collection_condition(): collection_id },
            "calculateTotal": true,
        });
        if offset > 0 {
            query["position"] = json!(offset);
        }
        if limit > 0 {
            query["limit"] = json!(limit);
        }
        let calls = vec![
            Invocation::new(&query_method, query, "0"),
            Invocation::new(
                &get_method,
                json!({
                    "accountId": account_id,
                    "#ids": reference("0", &query_method, "/ids/*"),
                }),
                "1",
            ),
        ];
        self.command(session, accept_language, "query_items", calls, |response| {
            let query: QueryResponse = response_for(response, &query_method, "0")?;
            let get: GetResponse<T> = response_for(response, &get_method, "1")?;
            Ok((
                ItemPage {
                    items: get.list,
                    total: query.total,
                    position: query.position,
                    query_state: query.query_state.clone(),
                },
                query.query_state,
            ))
        })
        .await
    }

    /// Create a contact card and return it as stored by the server
    pub async fn create_contact_card(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        card: &ContactCard,
    ) -> JmapResult<Reply<Value>> {
        let calls = vec![
            Invocation::new(
                "ContactCard/set",
                json!({ "accountId": account_id, "create": { "c": card } }),
                "0",
            ),
            Invocation::new(
                "ContactCard/get",
                json!({
                    "accountId": account_id,
                    "#ids": reference("0", "ContactCard/set", "/created/c/id"),
                }),
                "1",
            ),
        ];
        self.command(session, accept_language, "create_contact_card", calls, |response| {
            let set: SetResponse<Value> = response_for(response, "ContactCard/set", "0")?;
            first_set_error(&set.not_created)?;
            let get: GetResponse<Value> = response_for(response, "ContactCard/get", "1")?;
            let card = get.list.into_iter().next().ok_or_else(|| {
                JmapError::new(
                    JmapErrorKind::InvalidJmapResponsePayload,
                    "ContactCard/get does not return the created card",
                )
            })?;
            Ok((card, set.new_state))
        })
        .await
    }

    /// Destroy contact cards; returns the ids that could not be destroyed
    pub async fn delete_contact_cards(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        ids: &[String],
    ) -> JmapResult<Reply<BTreeMap<String, SetError>>> {
        self.command(
            session,
            accept_language,
            "delete_contact_cards",
            vec![Invocation::new(
                "ContactCard/set",
                json!({ "accountId": account_id, "destroy": ids }),
                "0",
            )],
            |response| {
                let set: SetResponse<Value> = response_for(response, "ContactCard/set", "0")?;
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
    async fn items_are_filtered_by_their_collection() {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        fake.respond(
            "s0",
            json!([
                ["CalendarEvent/query", {"queryState": "cq", "ids": ["ev1"], "total": 1}, "0"],
                ["CalendarEvent/get", {"state": "cs", "list": [{"id": "ev1", "title": "Standup"}]}, "1"]
            ]),
        );
        let reply = client
            .query_items::<Value>(&session, None, ItemKind::CalendarEvent, "a1", "cal1", 0, 20)
            .await
            .expect("events");
        assert_eq!(reply.state, "cq");
        assert_eq!(reply.value.total, Some(1));
        assert_eq!(reply.value.items[0]["title"], "Standup");

        let request = fake.last_request();
        assert_eq!(request.method_calls[0].arguments()["filter"], json!({"inCalendar": "cal1"}));
        assert!(request.using.iter().any(|u| u == CAPABILITY_CALENDARS));
    }

    #[test]
    fn collections_know_their_items() {
        assert_eq!(CollectionKind::AddressBook.item(), ItemKind::ContactCard);
        assert_eq!(CollectionKind::TaskList.item().data_type(), "Task");
        assert_eq!(CollectionKind::Calendar.capability(), CAPABILITY_CALENDARS);
    }
}
