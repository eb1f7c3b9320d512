//! Message relay handlers: client-to-gateway inbound and gateway-to-client
//! outbound.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use vimalinx_relay_protocol::{ChatType, InboundMessage, ModeMetadata};

use crate::credentials::{CredentialStore, UsageEvent};
use crate::error::{ApiError, ApiResult};
use crate::security::{now_ms, outbound_signature};
use crate::server::AppState;

use super::{authenticate, decode_json, enforce_request_security, is_admin};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    chat_id: Option<String>,
    chat_name: Option<String>,
    chat_type: Option<ChatType>,
    sender_id: Option<String>,
    sender_name: Option<String>,
    text: String,
    mentioned: Option<bool>,
    timestamp: Option<i64>,
    /// Declaring both upserts the conversation's instance config.
    model_tier_id: Option<String>,
    identity_id: Option<String>,
    #[serde(flatten)]
    mode: ModeMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    ok: bool,
    message_id: String,
    chat_id: String,
    /// True when queued for long-poll, false when forwarded to a webhook.
    queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target user; required for the server token, must be the caller (or
    /// absent) otherwise.
    to: Option<String>,
    /// Arbitrary payload delivered as-is. Falls back to a message envelope
    /// built from `text`/`chatId`.
    payload: Option<Value>,
    text: Option<String>,
    chat_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    ok: bool,
    /// Number of device keys the payload was recorded for.
    delivered: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/message
///
/// Client -> relay. Validates, stamps mode metadata (a stored instance
/// config always wins over client-supplied mode fields), then either queues
/// the message for the gateway's next poll or forwards it to the user's
/// gateway webhook.
pub async fn post_message(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    let auth = authenticate(&state, &headers, query.token.as_deref())?;
    let user_id = auth.user.id.clone();
    let cfg = state.resolved_security(Some(&user_id));

    enforce_request_security(
        &state,
        &cfg,
        &headers,
        Some(remote),
        &format!("message:{user_id}"),
        &body,
    )?;
    state.guard.check_rate(
        &format!("global:{user_id}"),
        cfg.rate_limit_per_minute,
        now_ms(),
    )?;

    let req: MessageRequest = decode_json(&body)?;
    if req.text.is_empty() {
        return Err(ApiError::InvalidInput("text must not be empty".into()));
    }

    let sender_id = req.sender_id.unwrap_or_else(|| user_id.clone());
    state.guard.check_rate(
        &format!("sender:{sender_id}"),
        cfg.sender_rate_limit_per_minute,
        now_ms(),
    )?;

    let chat_id = req.chat_id.unwrap_or_else(|| format!("user:{user_id}"));

    // A message declaring tier + identity pins the conversation's instance
    // config before stamping.
    if let (Some(tier), Some(identity)) = (&req.model_tier_id, &req.identity_id) {
        state
            .instances
            .upsert_from_ids(&user_id, &chat_id, tier, identity)?;
    }
    let mode = state.instances.stamp(&user_id, &chat_id, req.mode);

    let message = InboundMessage {
        id: Some(format!("msg_{}", ulid::Ulid::new().to_string().to_ascii_lowercase())),
        chat_id: chat_id.clone(),
        chat_name: req.chat_name,
        chat_type: req.chat_type.unwrap_or_default(),
        sender_id,
        sender_name: req.sender_name,
        text: req.text,
        mentioned: req.mentioned,
        timestamp: req.timestamp.unwrap_or_else(now_ms),
        mode,
    };

    let queued = match state.credentials.gateway_override(&user_id) {
        Some(gateway) => {
            forward_to_gateway(&state, &cfg, &gateway, &message).await?;
            false
        }
        None => {
            let Some(primary) = state.credentials.primary_token(&user_id) else {
                return Err(ApiError::Unavailable(format!(
                    "no device token issued for {user_id}"
                )));
            };
            let device_key = CredentialStore::device_key(&user_id, &primary);
            state.inbound.enqueue(&device_key, message.clone());
            true
        }
    };

    state
        .credentials
        .record_usage(&user_id, &auth.stored_token, UsageEvent::Inbound);

    let message_id = message.id.clone().unwrap_or_default();
    info!(user = %user_id, chat = %message.chat_id, queued, "relayed inbound message");
    Ok(Json(MessageResponse {
        ok: true,
        message_id,
        chat_id: message.chat_id,
        queued,
        mode_id: message.mode.mode_id,
    }))
}

/// POST /send
///
/// Gateway -> relay. Records the payload in the outbox of every device key
/// derived from the target user's token set and pushes it to attached SSE
/// connections. With a user token the target is the caller; the server token
/// addresses any user via `to`.
pub async fn send_outbound(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<SendResponse>> {
    let auth = if is_admin(&state, &headers) {
        None
    } else {
        Some(authenticate(&state, &headers, query.token.as_deref())?)
    };

    // The gate runs before the body is decoded. With the server token the
    // target only becomes known from the body, so the gate uses the server
    // defaults and a shared nonce scope.
    let gate_cfg = state.resolved_security(auth.as_ref().map(|a| a.user.id.as_str()));
    let scope = match &auth {
        Some(auth) => format!("send:{}", auth.user.id),
        None => "send:admin".to_string(),
    };
    enforce_request_security(&state, &gate_cfg, &headers, Some(remote), &scope, &body)?;

    let req: SendRequest = decode_json(&body)?;
    let target = match &auth {
        Some(auth) => {
            if let Some(to) = req.to.as_deref()
                && to != auth.user.id
            {
                return Err(ApiError::Forbidden(
                    "a device token may only send to its own user".into(),
                ));
            }
            auth.user.id.clone()
        }
        None => {
            let target = req.to.clone().ok_or_else(|| {
                ApiError::InvalidInput("'to' is required with the server token".into())
            })?;
            if !state.credentials.user_exists(&target) {
                return Err(ApiError::NotFound(format!("user {target} not found")));
            }
            target
        }
    };

    let cfg = state.resolved_security(Some(&target));
    state.guard.check_rate(
        &format!("global:{target}"),
        cfg.rate_limit_per_minute,
        now_ms(),
    )?;

    let payload = match req.payload {
        Some(payload) => payload,
        None => {
            let text = req
                .text
                .ok_or_else(|| ApiError::InvalidInput("payload or text is required".into()))?;
            json!({
                "type": "message",
                "text": text,
                "chatId": req.chat_id.unwrap_or_else(|| format!("user:{target}")),
                "timestamp": now_ms(),
            })
        }
    };

    let device_keys = state.credentials.device_keys(&target);
    if device_keys.is_empty() {
        return Err(ApiError::Unavailable(format!(
            "no device session derivable for {target}"
        )));
    }
    for device_key in &device_keys {
        state.hub.send(device_key, payload.clone());
    }

    if let Some(auth) = auth {
        state
            .credentials
            .record_usage(&auth.user.id, &auth.stored_token, UsageEvent::Outbound);
    }

    Ok(Json(SendResponse {
        ok: true,
        delivered: device_keys.len(),
    }))
}

// ============================================================================
// Webhook forwarding
// ============================================================================

/// Forward an inbound message straight to the user's gateway URL. Failures
/// surface as 502 to the original caller; there is no automatic retry.
async fn forward_to_gateway(
    state: &AppState,
    cfg: &crate::security::ResolvedSecurity,
    gateway: &crate::credentials::GatewayOverride,
    message: &InboundMessage,
) -> ApiResult<()> {
    let body = serde_json::to_vec(message)
        .map_err(|e| ApiError::Internal(format!("failed to encode message: {e}")))?;

    let mut request = state
        .http
        .post(&gateway.url)
        .header("content-type", "application/json");
    if let Some(token) = &gateway.token {
        request = request.bearer_auth(token);
    }
    if cfg.sign_outbound
        && let Some(secret) = cfg.hmac_secret.as_deref()
    {
        for (name, value) in outbound_signature(secret, &body, now_ms()) {
            request = request.header(name, value);
        }
    }

    let response = request.body(body).send().await.map_err(|e| {
        warn!(url = %gateway.url, error = %e, "gateway forward failed");
        ApiError::UpstreamFailure(format!("gateway forward failed: {e}"))
    })?;

    if !response.status().is_success() {
        warn!(url = %gateway.url, status = %response.status(), "gateway rejected forward");
        return Err(ApiError::UpstreamFailure(format!(
            "gateway responded with status {}",
            response.status()
        )));
    }
    Ok(())
}
