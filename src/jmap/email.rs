//! `Email/*`, `Thread/get` and `SearchSnippet/get` operations

use std::collections::{BTreeMap, HashMap};

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::filter::EmailFilter;
use super::model::{
    ChangesResponse, EMAIL_SUMMARY_PROPERTIES, Email, GetResponse, Invocation, QueryResponse,
    SearchSnippet, SetError, SetResponse, Thread,
};
use super::session::Session;
use super::{
    JmapClient, JmapError, JmapErrorKind, JmapResult, Reply, first_set_error, mcid, reference,
    response_for, squash_states, unique,
};

pub const KEYWORD_SEEN: &str = "$seen";
const EMAIL_MEDIA_TYPE: &str = "message/rfc822";

/// Options of a by-id email fetch
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEmailsOptions {
    pub fetch_bodies: bool,
    /// Truncation of body values, 0 for none
    pub max_body_value_bytes: u64,
    /// Set `$seen` on the emails before fetching them
    pub mark_as_seen: bool,
    /// Annotate emails with the size of their thread
    pub with_threads: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEmailsResult {
    pub list: Vec<Email>,
    pub not_found: Vec<String>,
}

/// Window and options of a mailbox listing
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailListing {
    pub offset: u64,
    /// Page size, 0 to let the server decide
    pub limit: u64,
    pub collapse_threads: bool,
    pub fetch_bodies: bool,
    pub max_body_value_bytes: u64,
    pub with_threads: bool,
}

/// One page of emails
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPage {
    pub emails: Vec<Email>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
}

/// Emails created, updated or destroyed since a state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailChanges {
    pub destroyed: Vec<String>,
    pub has_more_changes: bool,
    pub new_state: String,
    pub created: Vec<Email>,
    pub updated: Vec<Email>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailQueryResult {
    pub emails: Vec<Email>,
    pub total: u64,
    pub limit: u64,
    pub position: u64,
    pub query_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetWithMeta {
    pub email_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSnippetQueryResult {
    pub snippets: Vec<SnippetWithMeta>,
    pub total: u64,
    pub limit: u64,
    pub position: u64,
    pub query_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailWithSnippets {
    pub email: Email,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<SearchSnippet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailQueryWithSnippetsResult {
    pub results: Vec<EmailWithSnippets>,
    pub total: u64,
    pub limit: u64,
    pub position: u64,
    pub query_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailsSummary {
    pub emails: Vec<Email>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub state: String,
}

fn email_get(account_id: &str, fetch_bodies: bool, max_body_value_bytes: u64) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("accountId".to_owned(), json!(account_id));
    args.insert("fetchAllBodyValues".to_owned(), json!(fetch_bodies));
    if max_body_value_bytes > 0 {
        args.insert("maxBodyValueBytes".to_owned(), json!(max_body_value_bytes));
    }
    args
}

fn email_get_ref(
    account_id: &str,
    fetch_bodies: bool,
    max_body_value_bytes: u64,
    ids_ref: Value,
) -> Value {
    let mut args = email_get(account_id, fetch_bodies, max_body_value_bytes);
    args.insert("#ids".to_owned(), ids_ref);
    Value::Object(args)
}

struct QueryWindow {
    offset: u64,
    limit: u64,
    collapse_threads: bool,
    calculate_total: bool,
}

fn email_query(account_id: &str, filter: Option<&EmailFilter>, window: &QueryWindow) -> Value {
    let mut args = Map::new();
    args.insert("accountId".to_owned(), json!(account_id));
    if let Some(filter) = filter {
        args.insert("filter".to_owned(), json!(filter));
    }
    args.insert(
        "sort".to_owned(),
        json!([{ "property": "receivedAt", "isAscending": false }]),
    );
    args.insert("collapseThreads".to_owned(), json!(window.collapse_threads));
    args.insert("calculateTotal".to_owned(), json!(window.calculate_total));
    if window.offset > 0 {
        args.insert("position".to_owned(), json!(window.offset));
    }
    if window.limit > 0 {
        args.insert("limit".to_owned(), json!(window.limit));
    }
    Value::Object(args)
}

fn thread_get_ref(account_id: &str, result_of: &str) -> Value {
    json!({
        "accountId": account_id,
        "#ids": reference(result_of, "Email/get", "/list/*/threadId"),
    })
}

/// Annotate emails with the number of emails in their thread, 1 if unknown
fn set_thread_size(threads: &[Thread], emails: &mut [Email]) {
    let sizes: HashMap<&str, usize> = threads
        .iter()
        .map(|t| (t.id.as_str(), t.email_ids.len()))
        .collect();
    for email in emails {
        let size = email
            .thread_id
            .as_deref()
            .and_then(|id| sizes.get(id).copied())
            .unwrap_or(1);
        email.thread_size = Some(size);
    }
}

fn changes_from(changes: ChangesResponse, created: Vec<Email>, updated: Vec<Email>) -> EmailChanges {
    EmailChanges {
        destroyed: changes.destroyed,
        has_more_changes: changes.has_more_changes,
        new_state: changes.new_state,
        created,
        updated,
    }
}

impl JmapClient {
    /// Fetch emails by id, optionally marking them as seen first
    ///
    /// # Errors
    ///
    /// Transport or method errors, or the first `notUpdated` entry when
    /// marking as seen fails.
    pub async fn get_emails(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        ids: &[String],
        options: GetEmailsOptions,
    ) -> JmapResult<Reply<GetEmailsResult>> {
        let mut calls = Vec::with_capacity(3);
        if options.mark_as_seen {
            let updates: Map<String, Value> = ids
                .iter()
                .map(|id| (id.clone(), json!({ format!("keywords/{KEYWORD_SEEN}"): true })))
                .collect();
            calls.push(Invocation::new(
                "Email/set",
                json!({ "accountId": account_id, "update": updates }),
                "0",
            ));
        }
        let mut get = email_get(account_id, options.fetch_bodies, options.max_body_value_bytes);
        get.insert("ids".to_owned(), json!(ids));
        calls.push(Invocation::new("Email/get", Value::Object(get), "1"));
        if options.with_threads {
            calls.push(Invocation::new("Thread/get", thread_get_ref(account_id, "1"), "2"));
        }

        self.command(session, accept_language, "get_emails", calls, |response| {
            if options.mark_as_seen {
                let marked: SetResponse<Value> = response_for(response, "Email/set", "0")?;
                first_set_error(&marked.not_updated)?;
            }
            let mut get: GetResponse<Email> = response_for(response, "Email/get", "1")?;
            if options.with_threads {
                let threads: GetResponse<Thread> = response_for(response, "Thread/get", "2")?;
                set_thread_size(&threads.list, &mut get.list);
            }
            Ok((
                GetEmailsResult {
                    list: get.list,
                    not_found: get.not_found,
                },
                get.state,
            ))
        })
        .await
    }

    /// Blob id of the raw RFC 5322 message, `None` if the email is unknown
    pub async fn get_email_blob_id(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        id: &str,
    ) -> JmapResult<Reply<Option<String>>> {
        let get = json!({ "accountId": account_id, "ids": [id], "properties": ["blobId"] });
        self.command(
            session,
            accept_language,
            "get_email_blob_id",
            vec![Invocation::new("Email/get", get, "0")],
            |response| {
                let get: GetResponse<Email> = response_for(response, "Email/get", "0")?;
                let blob_id = match get.list.as_slice() {
                    [email] => email.blob_id.clone(),
                    _ => None,
                };
                Ok((blob_id, get.state))
            },
        )
        .await
    }

    /// Page through a mailbox, newest first
    pub async fn get_all_emails_in_mailbox(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        mailbox_id: &str,
        listing: EmailListing,
    ) -> JmapResult<Reply<EmailPage>> {
        let filter = EmailFilter::from(super::filter::EmailFilterCondition {
            in_mailbox: Some(mailbox_id.to_owned()),
            ..Default::default()
        });
        let window = QueryWindow {
            offset: listing.offset,
            limit: listing.limit,
            collapse_threads: listing.collapse_threads,
            calculate_total: true,
        };
        let mut calls = vec![
            Invocation::new("Email/query", email_query(account_id, Some(&filter), &window), "0"),
            Invocation::new(
                "Email/get",
                email_get_ref(
                    account_id,
                    listing.fetch_bodies,
                    listing.max_body_value_bytes,
                    reference("0", "Email/query", "/ids/*"),
                ),
                "1",
            ),
        ];
        if listing.with_threads {
            calls.push(Invocation::new("Thread/get", thread_get_ref(account_id, "1"), "2"));
        }

        self.command(session, accept_language, "get_all_emails_in_mailbox", calls, |response| {
            let query: QueryResponse = response_for(response, "Email/query", "0")?;
            let mut get: GetResponse<Email> = response_for(response, "Email/get", "1")?;
            if listing.with_threads {
                let threads: GetResponse<Thread> = response_for(response, "Thread/get", "2")?;
                set_thread_size(&threads.list, &mut get.list);
            }
            Ok((
                EmailPage {
                    emails: get.list,
                    total: query.total.unwrap_or_default(),
                    limit: query.limit.unwrap_or(listing.limit),
                    offset: query.position,
                },
                query.query_state,
            ))
        })
        .await
    }

    /// Emails created, updated and destroyed since `since_state`
    pub async fn get_emails_since(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        since_state: &str,
        fetch_bodies: bool,
        max_body_value_bytes: u64,
        max_changes: u64,
    ) -> JmapResult<Reply<EmailChanges>> {
        let mut changes = json!({ "accountId": account_id, "sinceState": since_state });
        if max_changes > 0 {
            changes["maxChanges"] = json!(max_changes);
        }
        let calls = vec![
            Invocation::new("Email/changes", changes, "0"),
            Invocation::new(
                "Email/get",
                email_get_ref(
                    account_id,
                    fetch_bodies,
                    max_body_value_bytes,
                    reference("0", "Email/changes", "/created"),
                ),
                "1",
            ),
            Invocation::new(
                "Email/get",
                email_get_ref(
                    account_id,
                    fetch_bodies,
                    max_body_value_bytes,
                    reference("0", "Email/changes", "/updated"),
                ),
                "2",
            ),
        ];

        self.command(session, accept_language, "get_emails_since", calls, |response| {
            let changes: ChangesResponse = response_for(response, "Email/changes", "0")?;
            let created: GetResponse<Email> = response_for(response, "Email/get", "1")?;
            let updated: GetResponse<Email> = response_for(response, "Email/get", "2")?;
            let state = changes.new_state.clone();
            Ok((changes_from(changes, created.list, updated.list), state))
        })
        .await
    }

    /// Changes since `since_state` restricted to emails in `mailbox_id`
    ///
    /// Updated emails that are no longer in the mailbox are reported as
    /// destroyed. Destroyed ids cannot be attributed to a mailbox any more
    /// and are reported unfiltered.
    pub async fn get_emails_in_mailbox_since(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        mailbox_id: &str,
        since_state: &str,
        fetch_bodies: bool,
        max_body_value_bytes: u64,
        max_changes: u64,
    ) -> JmapResult<Reply<EmailChanges>> {
        let reply = self
            .get_emails_since(
                session,
                accept_language,
                account_id,
                since_state,
                fetch_bodies,
                max_body_value_bytes,
                max_changes,
            )
            .await?;
        let in_mailbox = |email: &Email| {
            email
                .mailbox_ids
                .as_ref()
                .is_some_and(|m| m.get(mailbox_id).copied().unwrap_or(false))
        };
        Ok(reply.map(|mut changes| {
            changes.created.retain(in_mailbox);
            let (updated, moved_out): (Vec<Email>, Vec<Email>) =
                changes.updated.into_iter().partition(|e| in_mailbox(e));
            changes.updated = updated;
            changes.destroyed.extend(moved_out.into_iter().map(|e| e.id));
            changes
        }))
    }

    /// Run the same query in every account and fetch the matching emails
    pub async fn query_emails(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
        filter: Option<&EmailFilter>,
        offset: u64,
        limit: u64,
        fetch_bodies: bool,
        max_body_value_bytes: u64,
    ) -> JmapResult<Reply<BTreeMap<String, EmailQueryResult>>> {
        let accounts = unique(account_ids);
        let window = QueryWindow {
            offset,
            limit,
            collapse_threads: true,
            calculate_total: true,
        };
        let mut calls = Vec::with_capacity(accounts.len() * 2);
        for account_id in &accounts {
            calls.push(Invocation::new(
                "Email/query",
                email_query(account_id, filter, &window),
                mcid(account_id, "0"),
            ));
            calls.push(Invocation::new(
                "Email/get",
                email_get_ref(
                    account_id,
                    fetch_bodies,
                    max_body_value_bytes,
                    reference(&mcid(account_id, "0"), "Email/query", "/ids/*"),
                ),
                mcid(account_id, "1"),
            ));
        }

        self.command(session, accept_language, "query_emails", calls, |response| {
            let mut results = BTreeMap::new();
            for account_id in &accounts {
                let query: QueryResponse =
                    response_for(response, "Email/query", &mcid(account_id, "0"))?;
                let get: GetResponse<Email> =
                    response_for(response, "Email/get", &mcid(account_id, "1"))?;
                results.insert(
                    account_id.clone(),
                    EmailQueryResult {
                        emails: get.list,
                        total: query.total.unwrap_or_default(),
                        limit: query.limit.unwrap_or(limit),
                        position: query.position,
                        query_state: query.query_state,
                    },
                );
            }
            let state = squash_states(
                results
                    .iter()
                    .map(|(a, r)| (a.as_str(), r.query_state.as_str())),
            );
            Ok((results, state))
        })
        .await
    }

    /// Query every account and return highlighted snippets instead of emails
    pub async fn query_email_snippets(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
        filter: &EmailFilter,
        offset: u64,
        limit: u64,
    ) -> JmapResult<Reply<BTreeMap<String, EmailSnippetQueryResult>>> {
        let accounts = unique(account_ids);
        let window = QueryWindow {
            offset,
            limit,
            collapse_threads: true,
            calculate_total: true,
        };
        let mut calls = Vec::with_capacity(accounts.len() * 3);
        for account_id in &accounts {
            let ids = reference(&mcid(account_id, "0"), "Email/query", "/ids/*");
            calls.push(Invocation::new(
                "Email/query",
                email_query(account_id, Some(filter), &window),
                mcid(account_id, "0"),
            ));
            calls.push(Invocation::new(
                "Email/get",
                json!({
                    "accountId": account_id,
                    "#ids": ids.clone(),
                    "properties": ["id", "receivedAt", "sentAt"],
                }),
                mcid(account_id, "1"),
            ));
            calls.push(Invocation::new(
                "SearchSnippet/get",
                json!({ "accountId": account_id, "filter": filter, "#emailIds": ids.clone() }),
                mcid(account_id, "2"),
            ));
        }

        self.command(session, accept_language, "query_email_snippets", calls, |response| {
            let mut results = BTreeMap::new();
            for account_id in &accounts {
                let query: QueryResponse =
                    response_for(response, "Email/query", &mcid(account_id, "0"))?;
                let get: GetResponse<Email> =
                    response_for(response, "Email/get", &mcid(account_id, "1"))?;
                let snippets: GetResponse<SearchSnippet> =
                    response_for(response, "SearchSnippet/get", &mcid(account_id, "2"))?;

                let emails: HashMap<&str, &Email> =
                    get.list.iter().map(|e| (e.id.as_str(), e)).collect();
                let by_email: HashMap<&str, &SearchSnippet> = snippets
                    .list
                    .iter()
                    .map(|s| (s.email_id.as_str(), s))
                    .collect();
                let snippets = query
                    .ids
                    .iter()
                    .filter_map(|id| {
                        let email = emails.get(id.as_str())?;
                        let snippet = by_email.get(id.as_str());
                        Some(SnippetWithMeta {
                            email_id: id.clone(),
                            received_at: email.received_at,
                            subject: snippet.and_then(|s| s.subject.clone()),
                            preview: snippet.and_then(|s| s.preview.clone()),
                        })
                    })
                    .collect();
                results.insert(
                    account_id.clone(),
                    EmailSnippetQueryResult {
                        snippets,
                        total: query.total.unwrap_or_default(),
                        limit: query.limit.unwrap_or(limit),
                        position: query.position,
                        query_state: query.query_state,
                    },
                );
            }
            let state = squash_states(
                results
                    .iter()
                    .map(|(a, r)| (a.as_str(), r.query_state.as_str())),
            );
            Ok((results, state))
        })
        .await
    }

    /// Query every account and return emails together with their snippets
    pub async fn query_emails_with_snippets(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
        filter: &EmailFilter,
        offset: u64,
        limit: u64,
        fetch_bodies: bool,
        max_body_value_bytes: u64,
    ) -> JmapResult<Reply<BTreeMap<String, EmailQueryWithSnippetsResult>>> {
        let accounts = unique(account_ids);
        let window = QueryWindow {
            offset,
            limit,
            collapse_threads: false,
            calculate_total: true,
        };
        let mut calls = Vec::with_capacity(accounts.len() * 3);
        for account_id in &accounts {
            let ids = reference(&mcid(account_id, "0"), "Email/query", "/ids/*");
            calls.push(Invocation::new(
                "Email/query",
                email_query(account_id, Some(filter), &window),
                mcid(account_id, "0"),
            ));
            calls.push(Invocation::new(
                "SearchSnippet/get",
                json!({ "accountId": account_id, "filter": filter, "#emailIds": ids.clone() }),
                mcid(account_id, "1"),
            ));
            calls.push(Invocation::new(
                "Email/get",
                email_get_ref(account_id, fetch_bodies, max_body_value_bytes, ids),
                mcid(account_id, "2"),
            ));
        }

        self.command(session, accept_language, "query_emails_with_snippets", calls, |response| {
            let mut results = BTreeMap::new();
            for account_id in &accounts {
                let query: QueryResponse =
                    response_for(response, "Email/query", &mcid(account_id, "0"))?;
                let snippets: GetResponse<SearchSnippet> =
                    response_for(response, "SearchSnippet/get", &mcid(account_id, "1"))?;
                let get: GetResponse<Email> =
                    response_for(response, "Email/get", &mcid(account_id, "2"))?;

                let mut by_email: HashMap<String, Vec<SearchSnippet>> = HashMap::new();
                for snippet in snippets.list {
                    by_email
                        .entry(snippet.email_id.clone())
                        .or_default()
                        .push(snippet);
                }
                let entries = get
                    .list
                    .into_iter()
                    .map(|email| EmailWithSnippets {
                        snippets: by_email.remove(&email.id).unwrap_or_default(),
                        email,
                    })
                    .collect();
                results.insert(
                    account_id.clone(),
                    EmailQueryWithSnippetsResult {
                        results: entries,
                        total: query.total.unwrap_or_default(),
                        limit: query.limit.unwrap_or(limit),
                        position: query.position,
                        query_state: query.query_state,
                    },
                );
            }
            let state = squash_states(
                results
                    .iter()
                    .map(|(a, r)| (a.as_str(), r.query_state.as_str())),
            );
            Ok((results, state))
        })
        .await
    }

    /// Newest emails of every account, fetched with the summary properties
    pub async fn query_email_summaries(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_ids: &[String],
        filter: Option<&EmailFilter>,
        limit: u64,
        with_threads: bool,
    ) -> JmapResult<Reply<BTreeMap<String, EmailsSummary>>> {
        let accounts = unique(account_ids);
        let window = QueryWindow {
            offset: 0,
            limit,
            collapse_threads: false,
            calculate_total: true,
        };
        let mut calls = Vec::with_capacity(accounts.len() * 3);
        for account_id in &accounts {
            calls.push(Invocation::new(
                "Email/query",
                email_query(account_id, filter, &window),
                mcid(account_id, "0"),
            ));
            calls.push(Invocation::new(
                "Email/get",
                json!({
                    "accountId": account_id,
                    "#ids": reference(&mcid(account_id, "0"), "Email/query", "/ids/*"),
                    "properties": EMAIL_SUMMARY_PROPERTIES,
                }),
                mcid(account_id, "1"),
            ));
            if with_threads {
                calls.push(Invocation::new(
                    "Thread/get",
                    thread_get_ref(account_id, &mcid(account_id, "1")),
                    mcid(account_id, "2"),
                ));
            }
        }

        self.command(session, accept_language, "query_email_summaries", calls, |response| {
            let mut results = BTreeMap::new();
            for account_id in &accounts {
                let query: QueryResponse =
                    response_for(response, "Email/query", &mcid(account_id, "0"))?;
                let mut get: GetResponse<Email> =
                    response_for(response, "Email/get", &mcid(account_id, "1"))?;
                if with_threads {
                    let threads: GetResponse<Thread> =
                        response_for(response, "Thread/get", &mcid(account_id, "2"))?;
                    set_thread_size(&threads.list, &mut get.list);
                }
                let total = query.total.unwrap_or(get.list.len() as u64);
                results.insert(
                    account_id.clone(),
                    EmailsSummary {
                        emails: get.list,
                        total,
                        limit: query.limit.unwrap_or(limit),
                        offset: query.position,
                        state: get.state,
                    },
                );
            }
            let state = squash_states(
                results
                    .iter()
                    .map(|(a, r)| (a.as_str(), r.state.as_str())),
            );
            Ok((results, state))
        })
        .await
    }

    /// All emails of a thread
    pub async fn emails_in_thread(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        thread_id: &str,
        fetch_bodies: bool,
        max_body_value_bytes: u64,
    ) -> JmapResult<Reply<Vec<Email>>> {
        let calls = vec![
            Invocation::new(
                "Thread/get",
                json!({ "accountId": account_id, "ids": [thread_id] }),
                "0",
            ),
            Invocation::new(
                "Email/get",
                email_get_ref(
                    account_id,
                    fetch_bodies,
                    max_body_value_bytes,
                    reference("0", "Thread/get", "/list/*/emailIds"),
                ),
                "1",
            ),
        ];
        self.command(session, accept_language, "emails_in_thread", calls, |response| {
            let get: GetResponse<Email> = response_for(response, "Email/get", "1")?;
            Ok((get.list, get.state))
        })
        .await
    }

    /// Create an email, destroying `replace_id` in the same call
    ///
    /// # Errors
    ///
    /// The `notCreated` or `notDestroyed` error of the server, or
    /// `InvalidJmapResponsePayload` if the created email is missing.
    pub async fn create_email(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        email: Map<String, Value>,
        replace_id: Option<&str>,
    ) -> JmapResult<Reply<Email>> {
        let mut set = json!({ "accountId": account_id, "create": { "c": email } });
        if let Some(id) = replace_id {
            set["destroy"] = json!([id]);
        }
        self.command(
            session,
            accept_language,
            "create_email",
            vec![Invocation::new("Email/set", set, "0")],
            |response| {
                let mut set: SetResponse<Email> = response_for(response, "Email/set", "0")?;
                first_set_error(&set.not_created)?;
                first_set_error(&set.not_destroyed)?;
                let created = set.created.remove("c").ok_or_else(|| {
                    JmapError::new(
                        JmapErrorKind::InvalidJmapResponsePayload,
                        "Email/set response does not contain the created email",
                    )
                })?;
                Ok((created, set.new_state))
            },
        )
        .await
    }

    /// Apply patch objects to emails
    ///
    /// Keys of each patch are JMAP property paths such as `keywords/$seen`.
    pub async fn update_emails(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        updates: BTreeMap<String, Map<String, Value>>,
    ) -> JmapResult<Reply<BTreeMap<String, Option<Email>>>> {
        let set = json!({ "accountId": account_id, "update": updates });
        self.command(
            session,
            accept_language,
            "update_emails",
            vec![Invocation::new("Email/set", set, "0")],
            |response| {
                let set: SetResponse<Email> = response_for(response, "Email/set", "0")?;
                first_set_error(&set.not_updated)?;
                Ok((set.updated, set.new_state))
            },
        )
        .await
    }

    /// Destroy emails; returns the ids that could not be destroyed
    pub async fn delete_emails(
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
            "delete_emails",
            vec![Invocation::new("Email/set", set, "0")],
            |response| {
                let set: SetResponse<Value> = response_for(response, "Email/set", "0")?;
                Ok((set.not_destroyed, set.new_state))
            },
        )
        .await
    }

    /// Upload a raw RFC 5322 message and import it into `mailbox_id`
    pub async fn import_email(
        &self,
        session: &Session,
        accept_language: Option<&str>,
        account_id: &str,
        mailbox_id: &str,
        message: Bytes,
    ) -> JmapResult<Reply<Email>> {
        let blob = self
            .transport()
            .upload_blob(session, account_id, EMAIL_MEDIA_TYPE, message)
            .await?;
        let import = json!({
            "accountId": account_id,
            "emails": {
                "i": { "blobId": blob.id, "mailboxIds": { mailbox_id: true } }
            }
        });
        self.command(
            session,
            accept_language,
            "import_email",
            vec![Invocation::new("Email/import", import, "0")],
            |response| {
                let mut imported: SetResponse<Email> =
                    response_for(response, "Email/import", "0")?;
                first_set_error(&imported.not_created)?;
                let email = imported.created.remove("i").ok_or_else(|| {
                    JmapError::new(
                        JmapErrorKind::InvalidJmapResponsePayload,
                        "Email/import response does not contain the imported email",
                    )
                })?;
                Ok((email, imported.new_state))
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

    async fn client() -> (Arc<FakeTransport>, JmapClient, Session) {
        let fake = Arc::new(FakeTransport::with_session("alice", "s0"));
        let client = JmapClient::new(fake.clone());
        let session = client.fetch_session("alice").await.expect("session");
        (fake, client, session)
    }

    #[tokio::test]
    async fn mark_as_seen_precedes_get_and_threads_reference_get() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["Email/set", {"newState": "e2", "updated": {"e1": null}}, "0"],
                ["Email/get", {"state": "e2", "list": [{"id": "e1", "threadId": "t1"}], "notFound": []}, "1"],
                ["Thread/get", {"state": "t", "list": [{"id": "t1", "emailIds": ["e1", "e0"]}]}, "2"]
            ]),
        );
        let reply = client
            .get_emails(
                &session,
                None,
                "a1",
                &["e1".to_owned()],
                GetEmailsOptions {
                    mark_as_seen: true,
                    with_threads: true,
                    ..Default::default()
                },
            )
            .await
            .expect("emails");
        assert_eq!(reply.state, "e2");
        assert_eq!(reply.value.list[0].thread_size, Some(2));

        let request = fake.last_request();
        let names: Vec<&str> = request.method_calls.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["Email/set", "Email/get", "Thread/get"]);
        assert_eq!(
            request.method_calls[0].arguments()["update"]["e1"],
            json!({"keywords/$seen": true})
        );
        assert_eq!(
            request.method_calls[2].arguments()["#ids"]["path"],
            "/list/*/threadId"
        );
    }

    #[tokio::test]
    async fn multi_account_query_uses_scoped_call_ids() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["Email/query", {"queryState": "q2", "ids": [], "position": 0, "total": 0}, "a2:0"],
                ["Email/get", {"state": "x", "list": []}, "a2:1"],
                ["Email/query", {"queryState": "q1", "ids": ["e1"], "position": 0, "total": 1}, "a1:0"],
                ["Email/get", {"state": "x", "list": [{"id": "e1"}]}, "a1:1"]
            ]),
        );
        let reply = client
            .query_emails(
                &session,
                None,
                &["a2".to_owned(), "a1".to_owned(), "a2".to_owned()],
                None,
                0,
                10,
                false,
                0,
            )
            .await
            .expect("query");
        assert_eq!(reply.state, "a1:q1,a2:q2");
        assert_eq!(reply.value["a1"].emails.len(), 1);
        let request = fake.last_request();
        assert_eq!(request.method_calls.len(), 4);
        assert_eq!(request.method_calls[0].arguments()["collapseThreads"], true);
        assert_eq!(request.method_calls[0].arguments()["calculateTotal"], true);
        assert_eq!(
            request.method_calls[0].arguments()["sort"],
            json!([{"property": "receivedAt", "isAscending": false}])
        );
    }

    #[test]
    fn missing_thread_counts_as_single_email() {
        let mut emails = vec![Email {
            id: "e1".to_owned(),
            thread_id: Some("gone".to_owned()),
            ..Default::default()
        }];
        set_thread_size(&[], &mut emails);
        assert_eq!(emails[0].thread_size, Some(1));
    }

    #[tokio::test]
    async fn mailbox_changes_keep_only_emails_of_that_mailbox() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["Email/changes", {"oldState": "s0", "newState": "s1", "hasMoreChanges": false,
                    "created": ["e2", "e3"], "updated": [], "destroyed": ["e9"]}, "0"],
                ["Email/get", {"state": "s1", "list": [
                    {"id": "e2", "mailboxIds": {"m1": true}},
                    {"id": "e3", "mailboxIds": {"m2": true}}
                ]}, "1"],
                ["Email/get", {"state": "s1", "list": []}, "2"]
            ]),
        );
        let reply = client
            .get_emails_in_mailbox_since(&session, None, "a1", "m1", "s0", false, 0, 0)
            .await
            .expect("changes");
        assert_eq!(reply.state, "s1");
        let ids: Vec<&str> = reply.value.created.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2"]);
        assert_eq!(reply.value.destroyed, vec!["e9"]);
        assert_eq!(
            fake.last_request().method_calls[1].arguments()["#ids"]["path"],
            "/created"
        );
    }

    #[tokio::test]
    async fn emails_moved_out_of_the_mailbox_count_as_destroyed() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([
                ["Email/changes", {"oldState": "s0", "newState": "s1", "hasMoreChanges": false,
                    "created": [], "updated": ["e4", "e9"], "destroyed": []}, "0"],
                ["Email/get", {"state": "s1", "list": []}, "1"],
                ["Email/get", {"state": "s1", "list": [
                    {"id": "e4", "mailboxIds": {"m1": true}},
                    {"id": "e9", "mailboxIds": {"m2": true}}
                ]}, "2"]
            ]),
        );
        let reply = client
            .get_emails_in_mailbox_since(&session, None, "a1", "m1", "s0", false, 0, 0)
            .await
            .expect("changes");
        let updated: Vec<&str> = reply.value.updated.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(updated, vec!["e4"]);
        assert_eq!(reply.value.destroyed, vec!["e9"]);
        assert!(reply.value.created.is_empty());
    }

    #[tokio::test]
    async fn create_with_replacement_surfaces_set_errors() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([["Email/set", {"newState": "s1", "notCreated": {"c": {"type": "invalidProperties", "description": "bad"}}}, "0"]]),
        );
        let err = client
            .create_email(&session, None, "a1", Map::new(), Some("e1"))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind, JmapErrorKind::InvalidPatch);
        assert_eq!(fake.last_request().method_calls[0].arguments()["destroy"], json!(["e1"]));
    }

    #[tokio::test]
    async fn import_uploads_then_imports_into_mailbox() {
        let (fake, client, session) = client().await;
        fake.respond(
            "s0",
            json!([["Email/import", {"newState": "s1", "created": {"i": {"id": "e7", "blobId": "uploaded-1"}}}, "0"]]),
        );
        let reply = client
            .import_email(&session, None, "a1", "inbox-id", Bytes::from_static(b"Subject: hi\r\n\r\nbody"))
            .await
            .expect("import");
        assert_eq!(reply.value.id, "e7");
        assert_eq!(fake.uploads.lock().expect("lock")[0].0, "a1");
        assert_eq!(
            fake.last_request().method_calls[0].arguments()["emails"]["i"]["mailboxIds"],
            json!({"inbox-id": true})
        );
    }
}
