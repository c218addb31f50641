//! Emails: listing, search, changes, retrieval and modification

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::request::Req;
use super::response::{ApiResult, Failure};
use super::{Groupware, blobs};
use crate::errors::GroupwareError;
use crate::jmap::{EmailListing, EmailPage, GetEmailsOptions, KEYWORD_SEEN, SnippetWithMeta};
use crate::jmap::filter::{EmailFilter, EmailFilterCondition};
use crate::jmap::model::{Email, SearchSnippet, newest_first};
use crate::jmap::session::AccountRole;
use crate::jmap::Reply;
use crate::metrics::Metrics;
use crate::patch::{self, PatchObject};

const MESSAGE_RFC822: &str = "message/rfc822";
const KEYWORD_JUNK: &str = "$junk";
const KEYWORD_PHISHING: &str = "$phishing";
const INBOX_ROLE: &str = "inbox";
const DEFAULT_SUMMARY_LIMIT: u64 = 10;

/// Properties a client may set on a new email
const EMAIL_CREATE_PROPERTIES: &[&str] = &[
    "mailboxIds",
    "keywords",
    "from",
    "to",
    "cc",
    "bcc",
    "sender",
    "replyTo",
    "subject",
    "receivedAt",
    "sentAt",
    "bodyStructure",
    "textBody",
    "htmlBody",
    "attachments",
    "bodyValues",
];

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Patch key of a keyword, escaped as a JSON pointer token
fn keyword_key(keyword: &str) -> String {
    format!("keywords/{}", patch::escape(keyword))
}

fn sanitized(g: &Groupware, req: &Req, emails: Vec<Email>, session_state: &str) -> Result<Vec<Email>, Failure> {
    g.sanitizer
        .sanitize_emails(emails)
        .map_err(|e| req.sanitize_error(e).with_session_state(session_state))
}

fn sanitized_one(g: &Groupware, req: &Req, email: Email, session_state: &str) -> Result<Email, Failure> {
    g.sanitizer
        .sanitize_email(email)
        .map_err(|e| req.sanitize_error(e).with_session_state(session_state))
}

/// Filter and window of a search
struct Search {
    filter: Option<EmailFilter>,
    snippets: bool,
    offset: u64,
    /// `None` when the client asked for an empty page
    limit: Option<u64>,
}

fn search_params(g: &Groupware, req: &Req) -> Result<Search, Failure> {
    let offset = req.parse_count("offset")?.unwrap_or(0);
    let limit = match req.parse_count("limit")? {
        Some(0) => None,
        Some(n) => Some(n),
        None => Some(g.settings.default_email_limit),
    };
    let keywords = req.query_all("keyword");
    if let Some(invalid) = keywords.iter().find(|k| !g.keyword.is_match(k)) {
        return Err(req.parameter_error("keyword", format!("Invalid keyword: '{}'", invalid.escape_default())));
    }
    let mut keywords = keywords.into_iter();
    let text = |name: &str| req.query(name).map(str::to_owned);
    let condition = EmailFilterCondition {
        in_mailbox: text("mailbox"),
        in_mailbox_other_than: req.query_all("notmailbox"),
        before: req.parse_date("before")?,
        after: req.parse_date("after")?,
        min_size: req.parse_count("minsize")?.filter(|n| *n > 0),
        max_size: req.parse_count("maxsize")?.filter(|n| *n > 0),
        has_keyword: keywords.next(),
        text: text("text"),
        from: text("from"),
        to: text("to"),
        cc: text("cc"),
        bcc: text("bcc"),
        subject: text("subject"),
        body: text("body"),
        header: req
            .query("messageId")
            .map(|id| vec!["Message-ID".to_owned(), id.to_owned()])
            .unwrap_or_default(),
        ..Default::default()
    };
    let snippets = condition.wants_snippets();
    let more: Vec<EmailFilter> = keywords
        .map(|keyword| {
            EmailFilterCondition {
                has_keyword: Some(keyword),
                ..Default::default()
            }
            .into()
        })
        .collect();
    let filter = if !more.is_empty() {
        let mut all = vec![EmailFilter::from(condition)];
        all.extend(more);
        Some(EmailFilter::and(all))
    } else if condition.is_empty() {
        None
    } else {
        Some(condition.into())
    };
    Ok(Search {
        filter,
        snippets,
        offset,
        limit,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResults<T> {
    results: Vec<T>,
    total: u64,
    limit: u64,
    query_state: String,
}

impl<T> SearchResults<T> {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            total: 0,
            limit: 0,
            query_state: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FoundEmail {
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    #[serde(flatten)]
    email: Email,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    snippets: Vec<SearchSnippet>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FoundSnippet {
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    #[serde(flatten)]
    snippet: SnippetWithMeta,
}

async fn get_all_emails_in_mailbox(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let mailbox_id = req.path("mailboxid")?;
    let max_bytes = g.settings.max_body_value_bytes;

    if let Some(since) = req.if_none_match() {
        let max_changes = req.parse_count("maxchanges")?.unwrap_or(0);
        debug!(account_id = %account_id, mailbox_id = %mailbox_id, since = %since, max_changes, "email changes in mailbox");
        let reply = g
            .client
            .get_emails_in_mailbox_since(
                &req.session,
                req.language(),
                &account_id,
                mailbox_id,
                since,
                true,
                max_bytes,
                max_changes,
            )
            .await
            .map_err(|e| req.jmap_error(e))?;
        let Reply {
            value: mut changes,
            session_state,
            state,
            language,
        } = reply;
        changes.created = sanitized(&g, &req, changes.created, &session_state)?;
        changes.updated = sanitized(&g, &req, changes.updated, &session_state)?;
        return req.respond(StatusCode::OK, &changes, &session_state, &state, language.as_deref());
    }

    let offset = req.parse_count("offset")?.unwrap_or(0);
    let limit = match req.parse_count("limit")? {
        Some(0) => {
            let empty = EmailPage {
                offset,
                ..Default::default()
            };
            return req.respond(StatusCode::OK, &empty, &req.session.state, "", None);
        }
        Some(limit) => limit,
        None => g.settings.default_email_limit,
    };
    let reply = g
        .client
        .get_all_emails_in_mailbox(
            &req.session,
            req.language(),
            &account_id,
            mailbox_id,
            EmailListing {
                offset,
                limit,
                collapse_threads: false,
                fetch_bodies: true,
                max_body_value_bytes: max_bytes,
                with_threads: true,
            },
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Reply {
        value: mut page,
        session_state,
        state,
        language,
    } = reply;
    page.emails = sanitized(&g, &req, page.emails, &session_state)?;
    req.respond(StatusCode::OK, &page, &session_state, &state, language.as_deref())
}

async fn get_emails_since(g: &Groupware, req: &Req, since: &str) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let max_changes = req.parse_count("maxchanges")?.unwrap_or(0);
    let reply = g
        .client
        .get_emails_since(
            &req.session,
            req.language(),
            &account_id,
            since,
            true,
            g.settings.max_body_value_bytes,
            max_changes,
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Reply {
        value: mut changes,
        session_state,
        state,
        language,
    } = reply;
    changes.created = sanitized(g, req, changes.created, &session_state)?;
    changes.updated = sanitized(g, req, changes.updated, &session_state)?;
    req.respond(StatusCode::OK, &changes, &session_state, &state, language.as_deref())
}

async fn get_emails(State(g): State<Groupware>, req: Req) -> ApiResult {
    if let Some(since) = req.query("since").or_else(|| req.if_none_match()) {
        let since = since.to_owned();
        return get_emails_since(&g, &req, &since).await;
    }

    let account_id = req.account(AccountRole::Mail)?;
    let search = search_params(&g, &req)?;
    let fetch_emails = req.parse_bool("fetchemails")?.unwrap_or(false);
    let fetch_bodies = req.parse_bool("fetchbodies")?.unwrap_or(false);
    let Some(limit) = search.limit else {
        return req.respond(StatusCode::OK, &SearchResults::<Value>::empty(), &req.session.state, "", None);
    };
    let filter = search.filter.unwrap_or_else(|| EmailFilterCondition::default().into());
    let accounts = std::slice::from_ref(&account_id);

    if fetch_emails {
        let reply = g
            .client
            .query_emails_with_snippets(
                &req.session,
                req.language(),
                accounts,
                &filter,
                search.offset,
                limit,
                fetch_bodies,
                g.settings.max_body_value_bytes,
            )
            .await
            .map_err(|e| req.jmap_error(e))?;
        let Some(found) = reply.value.get(&account_id) else {
            return Err(req.not_found(&reply.session_state));
        };
        let mut results = Vec::with_capacity(found.results.len());
        for result in &found.results {
            results.push(FoundEmail {
                account_id: None,
                email: sanitized_one(&g, &req, result.email.clone(), &reply.session_state)?,
                snippets: if search.snippets { result.snippets.clone() } else { Vec::new() },
            });
        }
        let body = SearchResults {
            results,
            total: found.total,
            limit: found.limit,
            query_state: found.query_state.clone(),
        };
        return req.respond(
            StatusCode::OK,
            &body,
            &reply.session_state,
            &found.query_state,
            reply.language.as_deref(),
        );
    }

    let reply = g
        .client
        .query_email_snippets(&req.session, req.language(), accounts, &filter, search.offset, limit)
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Some(found) = reply.value.get(&account_id) else {
        return Err(req.not_found(&reply.session_state));
    };
    let body = SearchResults {
        results: found
            .snippets
            .iter()
            .cloned()
            .map(|snippet| FoundSnippet {
                account_id: None,
                snippet,
            })
            .collect(),
        total: found.total,
        limit: found.limit,
        query_state: found.query_state.clone(),
    };
    req.respond(
        StatusCode::OK,
        &body,
        &reply.session_state,
        &found.query_state,
        reply.language.as_deref(),
    )
}

async fn get_emails_for_all_accounts(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_ids = req.accounts_with(AccountRole::Mail)?;
    let search = search_params(&g, &req)?;
    let fetch_emails = req.parse_bool("fetchemails")?.unwrap_or(false);
    let fetch_bodies = req.parse_bool("fetchbodies")?.unwrap_or(false);
    let Some(limit) = search.limit else {
        return req.respond(StatusCode::OK, &SearchResults::<Value>::empty(), &req.session.state, "", None);
    };
    let max_bytes = g.settings.max_body_value_bytes;
    let truncate = usize::try_from(limit).unwrap_or(usize::MAX);

    if search.snippets && !fetch_emails {
        let filter = search.filter.unwrap_or_else(|| EmailFilterCondition::default().into());
        let reply = g
            .client
            .query_email_snippets(&req.session, req.language(), &account_ids, &filter, search.offset, limit)
            .await
            .map_err(|e| req.jmap_error(e))?;
        let total = reply.value.values().map(|r| r.total).sum();
        let mut results: Vec<FoundSnippet> = reply
            .value
            .iter()
            .flat_map(|(account_id, found)| {
                found.snippets.iter().cloned().map(|snippet| FoundSnippet {
                    account_id: Some(account_id.clone()),
                    snippet,
                })
            })
            .collect();
        results.sort_by(|a, b| {
            b.snippet
                .received_at
                .cmp(&a.snippet.received_at)
                .then_with(|| a.snippet.email_id.cmp(&b.snippet.email_id))
        });
        results.truncate(truncate);
        let body = SearchResults {
            results,
            total,
            limit,
            query_state: reply.state.clone(),
        };
        return req.ok(&reply.map(|_| body));
    }

    if search.snippets {
        let filter = search.filter.unwrap_or_else(|| EmailFilterCondition::default().into());
        let reply = g
            .client
            .query_emails_with_snippets(
                &req.session,
                req.language(),
                &account_ids,
                &filter,
                search.offset,
                limit,
                fetch_bodies,
                max_bytes,
            )
            .await
            .map_err(|e| req.jmap_error(e))?;
        let total = reply.value.values().map(|r| r.total).sum();
        let mut results = Vec::new();
        for (account_id, found) in &reply.value {
            for result in &found.results {
                results.push(FoundEmail {
                    account_id: Some(account_id.clone()),
                    email: sanitized_one(&g, &req, result.email.clone(), &reply.session_state)?,
                    snippets: result.snippets.clone(),
                });
            }
        }
        results.sort_by(|a, b| newest_first(&a.email, &b.email));
        results.truncate(truncate);
        let body = SearchResults {
            results,
            total,
            limit,
            query_state: reply.state.clone(),
        };
        return req.ok(&reply.map(|_| body));
    }

    let reply = g
        .client
        .query_emails(
            &req.session,
            req.language(),
            &account_ids,
            search.filter.as_ref(),
            search.offset,
            limit,
            fetch_emails && fetch_bodies,
            max_bytes,
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let total = reply.value.values().map(|r| r.total).sum();
    let mut results = Vec::new();
    for (account_id, found) in &reply.value {
        for email in &found.emails {
            results.push(FoundEmail {
                account_id: Some(account_id.clone()),
                email: sanitized_one(&g, &req, email.clone(), &reply.session_state)?,
                snippets: Vec::new(),
            });
        }
    }
    results.sort_by(|a, b| newest_first(&a.email, &b.email));
    results.truncate(truncate);
    let body = SearchResults {
        results,
        total,
        limit,
        query_state: reply.state.clone(),
    };
    req.ok(&reply.map(|_| body))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailSummary {
    account_id: String,
    #[serde(flatten)]
    email: Email,
}

#[derive(Debug, Serialize)]
struct EmailSummaries {
    emails: Vec<EmailSummary>,
    total: u64,
    limit: u64,
    state: String,
}

async fn get_latest_emails_summary_for_all_accounts(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_ids = req.accounts_with(AccountRole::Mail)?;
    let limit = req.parse_count("limit")?.unwrap_or(DEFAULT_SUMMARY_LIMIT);
    let seen = req.parse_bool("seen")?.unwrap_or(false);
    let undesirable = req.parse_bool("undesirable")?.unwrap_or(false);

    let mut not_keywords = Vec::new();
    if !seen {
        not_keywords.push(KEYWORD_SEEN);
    }
    if undesirable {
        not_keywords.extend([KEYWORD_JUNK, KEYWORD_PHISHING]);
    }
    let mut conditions: Vec<EmailFilter> = not_keywords
        .into_iter()
        .map(|keyword| {
            EmailFilterCondition {
                not_keyword: Some(keyword.to_owned()),
                ..Default::default()
            }
            .into()
        })
        .collect();
    let filter = match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(EmailFilter::and(conditions)),
    };

    if limit == 0 {
        let body = EmailSummaries {
            emails: Vec::new(),
            total: 0,
            limit,
            state: String::new(),
        };
        return req.respond(StatusCode::OK, &body, &req.session.state, "", None);
    }

    let reply = g
        .client
        .query_email_summaries(&req.session, req.language(), &account_ids, filter.as_ref(), limit, true)
        .await
        .map_err(|e| req.jmap_error(e))?;
    let total = reply.value.values().map(|s| s.total).sum();
    let mut emails: Vec<EmailSummary> = reply
        .value
        .iter()
        .flat_map(|(account_id, summary)| {
            summary.emails.iter().cloned().map(|email| EmailSummary {
                account_id: account_id.clone(),
                email,
            })
        })
        .collect();
    emails.sort_by(|a, b| newest_first(&a.email, &b.email));
    emails.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    let body = EmailSummaries {
        emails,
        total,
        limit,
        state: reply.state.clone(),
    };
    req.ok(&reply.map(|_| body))
}

async fn get_emails_by_id(State(g): State<Groupware>, req: Req) -> ApiResult {
    let ids = split_ids(req.path("emailid")?);
    if ids.is_empty() {
        return Err(req.parameter_error("emailid", "Empty list of email ids"));
    }
    if req.accepts(MESSAGE_RFC822) {
        return get_raw_email(&g, &req, &ids).await;
    }

    let account_id = req.account(AccountRole::Mail)?;
    let mark_as_seen = req.parse_bool("markAsSeen")?.unwrap_or(false);
    let started = Instant::now();
    let reply = g
        .client
        .get_emails(
            &req.session,
            req.language(),
            &account_id,
            &ids,
            GetEmailsOptions {
                fetch_bodies: true,
                max_body_value_bytes: g.settings.max_body_value_bytes,
                mark_as_seen,
                with_threads: ids.len() == 1,
            },
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let outcome = if reply.value.list.is_empty() { "notfound" } else { "found" };
    Metrics::observe(&g.metrics.email_by_id_duration, outcome, started.elapsed(), req.exemplar());

    let Reply {
        value,
        session_state,
        state,
        language,
    } = reply;
    if value.list.is_empty() {
        return Err(req.not_found(&session_state));
    }
    let mut emails = sanitized(&g, &req, value.list, &session_state)?;
    if ids.len() == 1 {
        let email = emails.remove(0);
        return req.respond(StatusCode::OK, &email, &session_state, &state, language.as_deref());
    }
    req.respond(StatusCode::OK, &emails, &session_state, &state, language.as_deref())
}

/// Stream the RFC 5322 source of a single email
async fn get_raw_email(g: &Groupware, req: &Req, ids: &[String]) -> ApiResult {
    let [id] = ids else {
        return Err(req.parameter_error(
            "emailid",
            format!("When the Accept header is '{MESSAGE_RFC822}', only a single email id is supported"),
        ));
    };
    if req.query("markAsSeen").is_some() {
        return Err(req.parameter_error(
            "markAsSeen",
            format!("When the Accept header is '{MESSAGE_RFC822}', markAsSeen is not supported"),
        ));
    }
    let account_id = req.account(AccountRole::Mail)?;
    let reply = g
        .client
        .get_email_blob_id(&req.session, req.language(), &account_id, id)
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Some(blob_id) = reply.value else {
        return Err(req.not_found(&reply.session_state));
    };
    let blob_account_id = req.account(AccountRole::Blob)?;
    let name = format!("{blob_id}.eml");
    let download = g
        .client
        .download_blob_stream(
            &req.session,
            req.language(),
            &blob_account_id,
            &blob_id,
            &name,
            MESSAGE_RFC822,
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    blobs::stream(req, download, Some(MESSAGE_RFC822))
}

async fn get_email_attachments(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?.to_owned();
    let part_id = req.query("partId");
    let name = req.query("name");
    let blob_id = req.query("blobId");

    let reply = g
        .client
        .get_emails(
            &req.session,
            req.language(),
            &account_id,
            std::slice::from_ref(&id),
            GetEmailsOptions::default(),
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Reply {
        value,
        session_state,
        state,
        language,
    } = reply;
    let Some(email) = value.list.into_iter().next() else {
        return Err(req.not_found(&session_state));
    };
    let attachments = email.attachments.unwrap_or_default();

    if part_id.is_none() && name.is_none() && blob_id.is_none() {
        return req.respond(StatusCode::OK, &attachments, &session_state, &state, language.as_deref());
    }

    let selected = attachments.into_iter().find(|part| {
        let matches = |wanted: Option<&str>, actual: &Option<String>| {
            wanted.is_none_or(|w| actual.as_deref() == Some(w))
        };
        matches(part_id, &part.part_id) && matches(name, &part.name) && matches(blob_id, &part.blob_id)
    });
    let Some((attachment_blob_id, part)) = selected.and_then(|p| p.blob_id.clone().map(|b| (b, p))) else {
        return Err(req.not_found(&session_state));
    };
    let blob_account_id = req.account(AccountRole::Blob)?;
    let download = g
        .client
        .download_blob_stream(
            &req.session,
            req.language(),
            &blob_account_id,
            &attachment_blob_id,
            part.name.as_deref().unwrap_or(&attachment_blob_id),
            part.media_type.as_deref().unwrap_or_default(),
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    blobs::stream(&req, download, None)
}

/// Keep only the properties a client may set on creation
fn creatable(email: Map<String, Value>) -> Map<String, Value> {
    email
        .into_iter()
        .filter(|(key, _)| EMAIL_CREATE_PROPERTIES.contains(&key.as_str()))
        .collect()
}

async fn create_email(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    if req.content_type_is(MESSAGE_RFC822) {
        return import_email(&g, &req, &account_id, body).await;
    }
    let email: Map<String, Value> = req.body(&body)?;
    let reply = g
        .client
        .create_email(&req.session, req.language(), &account_id, creatable(email), None)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.created(&reply)
}

/// Import a raw message into `?mailbox=` or the inbox
async fn import_email(g: &Groupware, req: &Req, account_id: &str, message: Bytes) -> ApiResult {
    if message.is_empty() {
        return Err(req.body_error("/", "The message must not be empty"));
    }
    let mailbox_id = match req.query("mailbox") {
        Some(id) => id.to_owned(),
        None => {
            let reply = g
                .client
                .find_mailbox_by_role(&req.session, req.language(), account_id, INBOX_ROLE)
                .await
                .map_err(|e| req.jmap_error(e))?;
            reply.value.ok_or_else(|| {
                req.parameter_error("mailbox", "No mailbox was given and the account has no inbox")
            })?
        }
    };
    let reply = g
        .client
        .import_email(&req.session, req.language(), account_id, &mailbox_id, message)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.created(&reply)
}

async fn replace_email(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?;
    let email: Map<String, Value> = req.body(&body)?;
    let reply = g
        .client
        .create_email(&req.session, req.language(), &account_id, creatable(email), Some(id))
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

/// Apply `patch` to email `id` and answer with the email as stored afterwards
async fn patch_email(g: &Groupware, req: &Req, account_id: &str, id: &str, patch: Map<String, Value>) -> ApiResult {
    if patch.is_empty() {
        return req.no_content(&req.session.state, "");
    }
    let updates = BTreeMap::from([(id.to_owned(), patch)]);
    let reply = g
        .client
        .update_emails(&req.session, req.language(), account_id, updates)
        .await
        .map_err(|e| req.jmap_error(e))?;
    match reply.value.get(id) {
        Some(Some(email)) => {
            let email = sanitized_one(g, req, email.clone(), &reply.session_state)?;
            req.respond(
                StatusCode::OK,
                &email,
                &reply.session_state,
                &reply.state,
                reply.language.as_deref(),
            )
        }
        Some(None) => req.no_content(&reply.session_state, &reply.state),
        None => Err(req
            .error(&GroupwareError::API_INCONSISTENCY)
            .with_session_state(&reply.session_state)),
    }
}

async fn update_email(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?;
    let patch: PatchObject = req.body(&body)?;
    patch::check(&patch).map_err(|e| {
        let pointer = format!("/{}", e.key().unwrap_or_default());
        req.body_error(&pointer, e.to_string())
    })?;
    patch_email(&g, &req, &account_id, id, patch.into_iter().collect()).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeywordUpdates {
    add: Vec<String>,
    remove: Vec<String>,
}

fn check_keywords(g: &Groupware, req: &Req, pointer: &str, keywords: &[String]) -> Result<(), Failure> {
    match keywords.iter().position(|k| !g.keyword.is_match(k)) {
        Some(i) => Err(req.body_error(&format!("{pointer}/{i}"), "Invalid keyword")),
        None => Ok(()),
    }
}

fn keyword_patch(set: &[String], unset: &[String]) -> Map<String, Value> {
    set.iter()
        .map(|k| (keyword_key(k), Value::Bool(true)))
        .chain(unset.iter().map(|k| (keyword_key(k), Value::Null)))
        .collect()
}

async fn update_email_keywords(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?;
    let updates: KeywordUpdates = req.body(&body)?;
    check_keywords(&g, &req, "/add", &updates.add)?;
    check_keywords(&g, &req, "/remove", &updates.remove)?;
    patch_email(&g, &req, &account_id, id, keyword_patch(&updates.add, &updates.remove)).await
}

async fn add_email_keywords(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?;
    let keywords: Vec<String> = req.body(&body)?;
    check_keywords(&g, &req, "", &keywords)?;
    patch_email(&g, &req, &account_id, id, keyword_patch(&keywords, &[])).await
}

async fn remove_email_keywords(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?;
    let keywords: Vec<String> = req.body(&body)?;
    check_keywords(&g, &req, "", &keywords)?;
    patch_email(&g, &req, &account_id, id, keyword_patch(&[], &keywords)).await
}

async fn delete_email(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let ids = split_ids(req.path("emailid")?);
    if ids.is_empty() {
        return req.no_content(&req.session.state, "");
    }
    let reply = g
        .client
        .delete_emails(&req.session, req.language(), &account_id, &ids)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.deleted(&GroupwareError::FAILED_TO_DELETE_EMAIL, &reply, true)
}

async fn delete_emails(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let ids: Vec<String> = req.body(&body)?;
    if ids.is_empty() {
        return req.no_content(&req.session.state, "");
    }
    let reply = g
        .client
        .delete_emails(&req.session, req.language(), &account_id, &ids)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.deleted(&GroupwareError::FAILED_TO_DELETE_EMAIL, &reply, false)
}

pub(super) fn router() -> Router<Groupware> {
    Router::new()
        .route(
            "/accounts/{accountid}/mailboxes/{mailboxid}/emails",
            get(get_all_emails_in_mailbox),
        )
        .route(
            "/accounts/{accountid}/emails",
            get(get_emails).post(create_email).delete(delete_emails),
        )
        .route("/accounts/all/emails", get(get_emails_for_all_accounts))
        .route(
            "/accounts/all/emails/latest/summary",
            get(get_latest_emails_summary_for_all_accounts),
        )
        .route(
            "/accounts/{accountid}/emails/{emailid}",
            get(get_emails_by_id)
                .put(replace_email)
                .post(update_email)
                .patch(update_email)
                .delete(delete_email),
        )
        .route(
            "/accounts/{accountid}/emails/{emailid}/attachments",
            get(get_email_attachments),
        )
        .route(
            "/accounts/{accountid}/emails/{emailid}/keywords",
            axum::routing::patch(update_email_keywords)
                .post(add_email_keywords)
                .delete(remove_email_keywords),
        )
}
