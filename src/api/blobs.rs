//! Blob metadata and streamed downloads

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;

use super::Groupware;
use super::request::Req;
use super::response::{self, ApiResult, SESSION_STATE};
use crate::jmap::http::BlobDownload;
use crate::jmap::session::AccountRole;

const OCTET_STREAM: &str = "application/octet-stream";

/// Stream a download to the client
///
/// `content_type` overrides the media type the JMAP server announced.
pub(super) fn stream(req: &Req, download: Option<BlobDownload>, content_type: Option<&str>) -> ApiResult {
    let Some(download) = download else {
        return Err(req.not_found(&req.session.state));
    };
    let mut headers = HeaderMap::new();
    let content_type = content_type
        .or(download.content_type.as_deref())
        .unwrap_or(OCTET_STREAM);
    response::set(&mut headers, CONTENT_TYPE, content_type);
    if let Some(disposition) = download.content_disposition.as_deref() {
        response::set(&mut headers, CONTENT_DISPOSITION, disposition);
    }
    if let Some(cache_control) = download.cache_control.as_deref() {
        response::set(&mut headers, CACHE_CONTROL, cache_control);
    }
    if let Some(size) = download.size {
        response::set(&mut headers, CONTENT_LENGTH, &size.to_string());
    }
    response::set(&mut headers, SESSION_STATE, &req.session.state);
    Ok((StatusCode::OK, headers, Body::from_stream(download.body)).into_response())
}

async fn get_blob(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Blob)?;
    let blob_id = req.path("blobid")?;
    let reply = g
        .client
        .get_blob(&req.session, req.language(), &account_id, blob_id)
        .await
        .map_err(|e| req.jmap_error(e))?;
    match &reply.value {
        Some(blob) => req.respond(
            StatusCode::OK,
            blob,
            &reply.session_state,
            &reply.state,
            reply.language.as_deref(),
        ),
        None => Err(req.not_found(&reply.session_state)),
    }
}

async fn download_blob(State(g): State<Groupware>, req: Req) -> ApiResult {
    let account_id = req.account(AccountRole::Blob)?;
    let blob_id = req.path("blobid")?;
    let name = req.path("name")?;
    let media_type = req.query("type").unwrap_or_default();
    let download = g
        .client
        .download_blob_stream(&req.session, req.language(), &account_id, blob_id, name, media_type)
        .await
        .map_err(|e| req.jmap_error(e))?;
    stream(&req, download, req.query("type"))
}

pub(super) fn router() -> Router<Groupware> {
    Router::new()
        .route("/accounts/{accountid}/blobs/{blobid}", get(get_blob))
        .route("/accounts/{accountid}/blobs/{blobid}/{name}", get(download_blob))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::tests::{app, get, send, send_raw};

    #[tokio::test]
    async fn metadata_comes_from_blob_get() {
        let app = app();
        app.fake.respond(
            "s0",
            json!([["Blob/get", {"accountId": "a1", "state": "b1", "list": [{"id": "B1", "size": 12, "digest:sha": "abc"}]}, "0"]]),
        );
        let (status, headers, body) = send(&app, get("/groupware/accounts/a1/blobs/B1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["etag"], "\"b1\"");
        assert_eq!(body, json!({"id": "B1", "size": 12, "digest:sha": "abc"}));

        app.fake.respond(
            "s0",
            json!([["Blob/get", {"accountId": "a1", "state": "b1", "list": [], "notFound": ["B2"]}, "0"]]),
        );
        let (status, _, body) = send(&app, get("/groupware/accounts/a1/blobs/B2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOTFND");
    }

    #[tokio::test]
    async fn blobs_need_the_blob_capability() {
        let app = app();
        let (status, _, body) = send(&app, get("/groupware/accounts/a2/blobs/B1")).await;
        assert_eq!(status, StatusCode::EXPECTATION_FAILED);
        assert_eq!(body["errors"][0]["code"], "MISSING_CAP_BLOB");
        assert!(app.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn downloads_stream_with_the_requested_type() {
        let app = app();
        app.fake.blobs.lock().expect("lock").insert(
            "https://jmap.example.com:8443/jmap/download/a1/B1/report.pdf?accept=application%2Fpdf".to_owned(),
            b"%PDF-1.7".to_vec(),
        );
        let (status, headers, body) = send_raw(
            &app,
            get("/groupware/accounts/a1/blobs/B1/report.pdf?type=application/pdf"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/pdf");
        assert_eq!(headers["content-length"], "8");
        assert_eq!(headers["session-state"], "s0");
        assert_eq!(&body[..], b"%PDF-1.7");

        let (status, _, _) = send_raw(&app, get("/groupware/accounts/a1/blobs/B9/x.bin")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
