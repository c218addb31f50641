//! Accounts, vacation response, quotas and identities

use std::collections::BTreeMap;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde::Serialize;
use serde_json::{Map, Value};

use super::Groupware;
use super::request::Req;
use super::response::ApiResult;
use crate::errors::GroupwareError;
use crate::jmap::model::{Quota, VacationResponse};
use crate::jmap::session::{Account, AccountRole};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountWithId<'a> {
    account_id: &'a str,
    #[serde(flatten)]
    account: &'a Account,
}

#[derive(Debug, Serialize)]
struct AccountQuota<'a> {
    state: &'a str,
    quotas: &'a [Quota],
}

async fn get_accounts(req: Req) -> ApiResult {
    let list: Vec<AccountWithId<'_>> = req
        .session
        .accounts
        .iter()
        .map(|(account_id, account)| AccountWithId { account_id, account })
        .collect();
    req.respond(StatusCode::OK, &list, &req.session.state, "", None)
}

async fn get_account(req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Mail)?;
    let Some(account) = req.session.accounts.get(&account_id) else {
        return Err(req.not_found(&req.session.state));
    };
    let body = AccountWithId {
        account_id: &account_id,
        account,
    };
    req.respond(StatusCode::OK, &body, &req.session.state, "", None)
}

async fn get_vacation(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::VacationResponse)?;
    let reply = g
        .client
        .get_vacation_response(&req.session, req.language(), &account_id)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn set_vacation(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::VacationResponse)?;
    let vacation: VacationResponse = req.body(&body)?;
    let reply = g
        .client
        .set_vacation_response(&req.session, req.language(), &account_id, &vacation)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn get_quota(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Quota)?;
    let reply = g
        .client
        .get_quotas(&req.session, req.language(), std::slice::from_ref(&account_id))
        .await
        .map_err(|e| req.jmap_error(e))?;
    let Some(quotas) = reply.value.get(&account_id) else {
        return Err(req.not_found(&reply.session_state));
    };
    req.respond(
        StatusCode::OK,
        &quotas.list,
        &reply.session_state,
        &quotas.state,
        reply.language.as_deref(),
    )
}

async fn get_quota_for_all_accounts(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_ids = req.accounts_with(AccountRole::Quota)?;
    let reply = g
        .client
        .get_quotas(&req.session, req.language(), &account_ids)
        .await
        .map_err(|e| req.jmap_error(e))?;
    let body: BTreeMap<&str, AccountQuota<'_>> = reply
        .value
        .iter()
        .map(|(account_id, quotas)| {
            (
                account_id.as_str(),
                AccountQuota {
                    state: &quotas.state,
                    quotas: &quotas.list,
                },
            )
        })
        .collect();
    req.respond(
        StatusCode::OK,
        &body,
        &reply.session_state,
        &reply.state,
        reply.language.as_deref(),
    )
}

async fn get_identities(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Submission)?;
    let reply = g
        .client
        .get_identities(&req.session, req.language(), &account_id)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn get_identity(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Submission)?;
    let id = req.path("identityid")?;
    let reply = g
        .client
        .get_identity(&req.session, req.language(), &account_id, id)
        .await
        .map_err(|e| req.jmap_error(e))?;
    match &reply.value {
        Some(identity) => req.respond(
            StatusCode::OK,
            identity,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        ),
        None => Err(req.not_found(&reply.session_state)),
    }
}

async fn create_identity(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Submission)?;
    let mut identity: Map<String, Value> = req.body(&body)?;
    identity.remove("id");
    let reply = g
        .client
        .create_identity(&req.session, req.language(), &account_id, identity)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.created(&reply)
}

async fn update_identity(State(g): State<Groupware>, req: Req, body: Bytes) -> ApiResult {
    let account_id = req.account(AccountRole::Submission)?;
    let id = req.path("identityid")?;
    let patch: Map<String, Value> = req.body(&body)?;
    let reply = g
        .client
        .update_identity(&req.session, req.language(), &account_id, id, patch)
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.ok(&reply)
}

async fn delete_identity(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Submission)?;
    let id = req.path("identityid")?.to_owned();
    let reply = g
        .client
        .delete_identities(&req.session, req.language(), &account_id, &[id])
        .await
        .map_err(|e| req.jmap_error(e))?;
    req.deleted(&GroupwareError::FAILED_TO_DELETE_IDENTITY, &reply, true)
}

pub(super) fn router() -> Router<Groupware> {
    Router::new()
        .route("/accounts", get(get_accounts))
        .route("/accounts/{accountid}", get(get_account))
        .route("/accounts/{accountid}/vacation", get(get_vacation).put(set_vacation))
        .route("/accounts/{accountid}/quota", get(get_quota))
        .route("/accounts/all/quota", get(get_quota_for_all_accounts))
        .route(
            "/accounts/{accountid}/identities",
            get(get_identities).post(create_identity),
        )
        .route(
            "/accounts/{accountid}/identities/{identityid}",
            get(get_identity).patch(update_identity).delete(delete_identity),
        )
}
