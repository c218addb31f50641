//! Server-Sent Events stream of the authenticated user

use std::convert::Infallible;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use tracing::debug;

use super::Groupware;
use super::request::Req;
use super::response::ApiResult;

const KEEPALIVE_TEXT: &str = "keepalive";

/// Open a stream delivering the events published for the user
///
/// The stream name only tags the connection in logs; every stream of a user
/// receives every event. Streams end when the service shuts down.
async fn stream(State(g): State<Groupware>, req: Req) -> ApiResult {
    let name = req.path("stream")?.to_owned();
    let subscription = g.events.subscribe(&req.username);
    debug!(username = %req.username, stream = %name, "opened SSE stream");

    let shutdown = g.settings.shutdown.clone();
    let events = async_stream::stream! {
        loop {
            let event = tokio::select! {
                event = subscription.next() => event,
                () = shutdown.cancelled() => break,
            };
            yield Ok::<_, Infallible>(SseEvent::default().event(event.kind).data(event.data));
        }
    };
    let keepalive = KeepAlive::new()
        .interval(g.settings.keepalive)
        .text(KEEPALIVE_TEXT);
    Ok(Sse::new(events).keep_alive(keepalive).into_response())
}

pub(super) fn router() -> Router<Groupware> {
    Router::new().route("/events/{stream}", get(stream))
}
