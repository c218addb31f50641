//! Related emails, delivered in the background over the SSE stream
//!
//! Reading an email through `/related` answers with the email right away and
//! enqueues one job per relation. Each job pushes what it found as an `email`
//! event tagged with the request id, so clients correlate the events with
//! their request.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::Groupware;
use super::request::Req;
use super::response::ApiResult;
use crate::jmap::filter::{EmailFilter, EmailFilterCondition};
use crate::jmap::model::Email;
use crate::jmap::session::AccountRole;
use crate::jmap::{GetEmailsOptions, JmapError, Session};
use crate::jobs::JobResult;
use crate::metrics::{Exemplar, Metrics};

const DEFAULT_LIMIT: u64 = 10;
const DEFAULT_DAYS: u64 = 5;
const SAME_SENDER: &str = "same-sender";
const SAME_THREAD: &str = "same-thread";
const EMAIL_EVENT: &str = "email";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AboutEmail {
    email: Email,
    request_id: String,
}

/// Payload of the events pushed by the jobs
#[derive(Debug, Serialize)]
struct AboutEmails<'a> {
    id: &'a str,
    source: &'a str,
    emails: &'a [Email],
    #[serde(skip_serializing_if = "Option::is_none")]
    lang: Option<&'a str>,
}

/// Emails received within `days` of `beacon` from any sender of `email`
fn same_sender_filter(email: &Email, beacon: DateTime<Utc>, days: u64) -> EmailFilter {
    let days = Duration::days(i64::try_from(days).unwrap_or(i64::MAX).min(36_500));
    let window = EmailFilterCondition {
        after: Some(beacon - days),
        before: Some(beacon + days),
        ..Default::default()
    };
    let senders: Vec<EmailFilter> = email
        .sender_addresses()
        .into_iter()
        .map(|address| {
            EmailFilterCondition {
                from: Some(address),
                ..Default::default()
            }
            .into()
        })
        .collect();
    if senders.is_empty() {
        window.into()
    } else {
        EmailFilter::and(vec![window.into(), EmailFilter::or(senders)])
    }
}

/// Everything a job needs once the request is gone
#[derive(Clone)]
struct JobContext {
    g: Groupware,
    session: Arc<Session>,
    username: String,
    language: Option<String>,
    account_id: String,
    request_id: String,
    trace_id: Option<String>,
    source_id: String,
}

impl JobContext {
    fn exemplar(&self) -> Exemplar<'_> {
        Exemplar {
            request_id: Some(&self.request_id),
            trace_id: self.trace_id.as_deref(),
        }
    }

    fn jmap_failed(&self, job: &str, err: &JmapError) {
        self.g
            .metrics
            .jmap_errors
            .with_label_values(&[self.session.endpoint.as_str(), err.kind.as_str()])
            .inc();
        debug!(job, request_id = %self.request_id, kind = %err.kind, error = %err.message, "related emails query failed");
    }

    /// Sanitize the emails other than the source and push them, if any
    fn publish(&self, source: &str, emails: Vec<Email>, language: Option<&str>) -> JobResult {
        let others: Vec<Email> = emails.into_iter().filter(|e| e.id != self.source_id).collect();
        let related = self.g.sanitizer.sanitize_emails(others)?;
        trace!(job = source, request_id = %self.request_id, found = related.len(), "related emails");
        if !related.is_empty() {
            let event = AboutEmails {
                id: &self.request_id,
                source,
                emails: &related,
                lang: language,
            };
            self.g.events.push(&self.username, EMAIL_EVENT, &event);
        }
        Ok(())
    }

    async fn same_sender(self, filter: EmailFilter, limit: u64) -> JobResult {
        let started = Instant::now();
        let accounts = std::slice::from_ref(&self.account_id);
        let result = self
            .g
            .client
            .query_emails(
                &self.session,
                self.language.as_deref(),
                accounts,
                Some(&filter),
                0,
                limit,
                false,
                self.g.settings.max_body_value_bytes,
            )
            .await;
        let histogram = &self.g.metrics.email_same_sender_duration;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                Metrics::observe(histogram, "failure", started.elapsed(), self.exemplar());
                self.jmap_failed(SAME_SENDER, &e);
                return Err(e.into());
            }
        };
        Metrics::observe(histogram, "success", started.elapsed(), self.exemplar());
        let language = reply.language.as_deref();
        let emails = reply
            .value
            .get(&self.account_id)
            .map(|found| found.emails.clone())
            .unwrap_or_default();
        self.publish(SAME_SENDER, emails, language)
    }

    async fn same_thread(self, thread_id: String) -> JobResult {
        let started = Instant::now();
        let result = self
            .g
            .client
            .emails_in_thread(
                &self.session,
                self.language.as_deref(),
                &self.account_id,
                &thread_id,
                false,
                self.g.settings.max_body_value_bytes,
            )
            .await;
        let histogram = &self.g.metrics.email_same_thread_duration;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                Metrics::observe(histogram, "failure", started.elapsed(), self.exemplar());
                self.jmap_failed(SAME_THREAD, &e);
                return Err(e.into());
            }
        };
        Metrics::observe(histogram, "success", started.elapsed(), self.exemplar());
        self.publish(SAME_THREAD, reply.value, reply.language.as_deref())
    }
}

async fn related_to_email(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let id = req.path("emailid")?.to_owned();
    let limit = req.parse_count("limit")?.unwrap_or(DEFAULT_LIMIT);
    let days = req.parse_count("days")?.unwrap_or(DEFAULT_DAYS);
    let request_id = req
        .request_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let started = Instant::now();
    let reply = g
        .client
        .get_emails(
            &req.session,
            req.language(),
            &account_id,
            std::slice::from_ref(&id),
            GetEmailsOptions {
                fetch_bodies: true,
                max_body_value_bytes: g.settings.max_body_value_bytes,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| req.jmap_error(e))?;
    let found = !reply.value.list.is_empty();
    Metrics::observe(
        &g.metrics.email_by_id_duration,
        if found { "found" } else { "notfound" },
        started.elapsed(),
        Exemplar {
            request_id: Some(&request_id),
            trace_id: req.trace_id.as_deref(),
        },
    );
    let Some(email) = reply.value.list.first().cloned() else {
        return Err(req.not_found(&reply.session_state));
    };

    let context = JobContext {
        g: g.clone(),
        session: Arc::clone(&req.session),
        username: req.username.clone(),
        language: req.language().map(str::to_owned),
        account_id,
        request_id: request_id.clone(),
        trace_id: req.trace_id.clone(),
        source_id: email.id.clone(),
    };
    let beacon = email.received_at.unwrap_or_else(Utc::now);
    let filter = same_sender_filter(&email, beacon, days);
    debug!(request_id = %request_id, email_id = %id, limit, days, "scheduling related email jobs");
    g.jobs.enqueue(SAME_SENDER, context.clone().same_sender(filter, limit));
    if let Some(thread_id) = email.thread_id.clone() {
        g.jobs.enqueue(SAME_THREAD, context.same_thread(thread_id));
    }

    let email = g
        .sanitizer
        .sanitize_email(email)
        .map_err(|e| req.sanitize_error(e).with_session_state(&reply.session_state))?;
    let body = AboutEmail { email, request_id };
    req.respond(
        StatusCode::OK,
        &body,
        &reply.session_state,
        &reply.state,
        reply.language.as_deref(),
    )
}

/// `REPORT` is answered like `GET`; other methods are not allowed
async fn report_related_to_email(method: Method, state: State<Groupware>, req: Req) -> ApiResult {
    if method.as_str() == "REPORT" {
        related_to_email(state, req).await
    } else {
        Ok(StatusCode::METHOD_NOT_ALLOWED.into_response())
    }
}

pub(super) fn router() -> Router<Groupware> {
    Router::new().route(
        "/accounts/{accountid}/emails/{emailid}/related",
        get(related_to_email).fallback(report_related_to_email),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::StatusCode;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    use super::same_sender_filter;
    use crate::api::tests::{app, request, send};
    use crate::jmap::model::{Email, EmailAddress};

    fn address(email: &str) -> EmailAddress {
        EmailAddress {
            name: None,
            email: email.to_owned(),
        }
    }

    #[test]
    fn same_sender_filter_combines_window_and_senders() {
        let email = Email {
            from: Some(vec![address("a@x")]),
            sender: Some(vec![address("b@x")]),
            ..Default::default()
        };
        let beacon = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).single().expect("date");
        let filter = serde_json::to_value(same_sender_filter(&email, beacon, 3)).expect("filter");
        assert_eq!(filter["operator"], "AND");
        let window = &filter["conditions"][0];
        assert!(window["after"].as_str().is_some_and(|a| a.starts_with("2025-01-07T00:00:00")));
        assert!(window["before"].as_str().is_some_and(|b| b.starts_with("2025-01-13T00:00:00")));
        assert_eq!(
            filter["conditions"][1],
            json!({"operator": "OR", "conditions": [{"from": "a@x"}, {"from": "b@x"}]})
        );

        let anonymous = serde_json::to_value(same_sender_filter(&Email::default(), beacon, 3)).expect("filter");
        assert!(anonymous.get("operator").is_none());
    }

    /// Answers to both jobs; each picks its own invocations by call id
    fn job_responses() -> Value {
        json!([
            ["Email/query", {"accountId": "a1", "queryState": "q", "ids": ["e1", "e2"], "total": 2}, "a1:0"],
            ["Email/get", {"accountId": "a1", "state": "st", "list": [
                {"id": "e1", "threadId": "t1"},
                {"id": "e2", "threadId": "t2", "subject": "from the same sender"}
            ]}, "a1:1"],
            ["Thread/get", {"accountId": "a1", "state": "t", "list": [{"id": "t1", "emailIds": ["e1", "e3"]}]}, "0"],
            ["Email/get", {"accountId": "a1", "state": "st", "list": [
                {"id": "e1", "threadId": "t1"},
                {"id": "e3", "threadId": "t1", "subject": "in the same thread"}
            ]}, "1"]
        ])
    }

    #[tokio::test]
    async fn related_emails_arrive_as_events() {
        let app = app();
        let subscription = app.state.events.subscribe("alice");
        app.fake.respond(
            "s0",
            json!([["Email/get", {"accountId": "a1", "state": "st1", "list": [{
                "id": "e1",
                "threadId": "t1",
                "receivedAt": "2025-01-10T00:00:00Z",
                "from": [{"email": "boss@example.com"}]
            }]}, "1"]]),
        );
        app.fake.respond("s0", job_responses());
        app.fake.respond("s0", job_responses());

        let req = request("GET", "/groupware/accounts/a1/emails/e1/related?limit=5&days=3")
            .header("x-request-id", "r1")
            .body(Body::empty())
            .expect("request");
        let (status, headers, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"st1\"");
        assert_eq!(body["requestId"], "r1");
        assert_eq!(body["email"]["id"], "e1");

        let mut sources = BTreeSet::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
                .await
                .expect("event in time");
            assert_eq!(event.kind, "email");
            let data: Value = serde_json::from_str(&event.data).expect("JSON event");
            assert_eq!(data["id"], "r1");
            let ids: Vec<&str> = data["emails"]
                .as_array()
                .expect("emails")
                .iter()
                .filter_map(|e| e["id"].as_str())
                .collect();
            assert!(!ids.contains(&"e1"), "the source email is excluded");
            sources.insert(data["source"].as_str().unwrap_or_default().to_owned());
        }
        assert_eq!(
            sources,
            BTreeSet::from(["same-sender".to_owned(), "same-thread".to_owned()])
        );
    }

    #[tokio::test]
    async fn report_is_answered_like_get() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Email/get", {"accountId": "a1", "state": "st1", "list": []}, "1"]]),
        );
        let req = request("REPORT", "/groupware/accounts/a1/emails/e1/related")
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOTFND");

        let req = request("POST", "/groupware/accounts/a1/emails/e1/related")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
