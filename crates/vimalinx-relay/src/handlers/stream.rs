//! Delivery handlers: the SSE stream and the long-poll endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use vimalinx_relay_protocol::{InboundMessage, OutboundEvent};

use crate::credentials::UsageEvent;
use crate::error::{ApiError, ApiResult};
use crate::security::{client_ip, ip_allowed, now_ms};
use crate::server::AppState;
use crate::sessions::ConnectionGuard;

use super::{authenticate, enforce_request_security};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    token: Option<String>,
    last_event_id: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    token: Option<String>,
    wait_ms: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    ok: bool,
    messages: Vec<InboundMessage>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/stream
///
/// Opens an SSE channel for the caller's device key. Buffered outbox entries
/// with `eventId` greater than the caller's cursor (the `Last-Event-ID`
/// header or `lastEventId` query parameter, default 0) replay first in
/// ascending order, then live entries stream as they are sent. A periodic
/// keep-alive ping detects dead connections.
pub async fn stream(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let auth = authenticate(&state, &headers, query.token.as_deref())?;
    let cfg = state.resolved_security(Some(&auth.user.id));

    let ip = client_ip(&headers, Some(remote), state.config.security.trust_forwarded_for);
    if !ip_allowed(cfg.allowed_ips.as_deref(), ip.as_deref()) {
        return Err(ApiError::Forbidden("client ip not allowed".into()));
    }
    state.guard.check_rate(
        &format!("global:{}", auth.user.id),
        cfg.rate_limit_per_minute,
        now_ms(),
    )?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(query.last_event_id)
        .unwrap_or(0);

    let (replay, live, guard) = state.hub.attach(&auth.device_key, last_event_id);
    state
        .credentials
        .record_usage(&auth.user.id, &auth.stored_token, UsageEvent::StreamConnect);

    let events = futures::stream::iter(replay)
        .chain(UnboundedReceiverStream::new(live))
        .map(sse_event);
    let events = DetachOnDrop {
        inner: events,
        _guard: guard,
    };

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(
            state.config.server.keep_alive_interval_seconds,
        ))
        .text("ping");

    Ok(Sse::new(events).keep_alive(keep_alive).into_response())
}

/// GET /api/poll?waitMs=
///
/// Long-poll for inbound messages on the caller's device key: drains
/// immediately when messages are pending, otherwise holds the request open
/// up to `waitMs` (clamped to 30s, default 20s) and returns `[]` on timeout.
/// Closing the connection cancels the wait.
///
/// Inbound messages are queued to the device key of the user's *primary*
/// (first issued) token, so a poll holding a secondary token never drains
/// them. A gateway must poll with the primary token.
pub async fn poll(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<PollResponse>> {
    let auth = authenticate(&state, &headers, query.token.as_deref())?;
    let cfg = state.resolved_security(Some(&auth.user.id));

    // Polls carry no body; signatures, when required, cover the empty body.
    enforce_request_security(
        &state,
        &cfg,
        &headers,
        Some(remote),
        &format!("poll:{}", auth.user.id),
        b"",
    )?;
    state.guard.check_rate(
        &format!("global:{}", auth.user.id),
        cfg.rate_limit_per_minute,
        now_ms(),
    )?;

    let messages = state.inbound.poll(&auth.device_key, query.wait_ms).await;
    state
        .credentials
        .record_usage(&auth.user.id, &auth.stored_token, UsageEvent::Seen);
    Ok(Json(PollResponse { ok: true, messages }))
}

// ============================================================================
// SSE plumbing
// ============================================================================

fn sse_event(entry: OutboundEvent) -> Result<Event, Infallible> {
    let id = entry.event_id.to_string();
    Ok(Event::default()
        .id(id.clone())
        .event("message")
        .json_data(&entry)
        .unwrap_or_else(|_| Event::default().id(id).event("message").data("{}")))
}

/// Stream wrapper holding the hub registration: dropping the response body
/// (client disconnect) deregisters the connection without touching the
/// outbox.
struct DetachOnDrop<S> {
    inner: S,
    _guard: ConnectionGuard,
}

impl<S: Stream + Unpin> Stream for DetachOnDrop<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
