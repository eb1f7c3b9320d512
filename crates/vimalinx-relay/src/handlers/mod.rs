//! HTTP request handlers.

mod account;
mod health;
mod machines;
mod messages;
mod stream;

pub use account::{account_login, issue_token, register, token_login, token_usage};
pub use health::{healthz, public_config};
pub use machines::{
    get_machine, list_machines, machine_config, machine_heartbeat, machine_register,
    patch_machine, provision_contributor,
};
pub use messages::{post_message, send_outbound};
pub use stream::{poll, stream};

use std::net::SocketAddr;

use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;
use vimalinx_relay_protocol::headers as wire_headers;

use crate::credentials::{CredentialStore, UserRecord};
use crate::error::{ApiError, ApiResult};
use crate::security::{ResolvedSecurity, client_ip, ip_allowed, now_ms};
use crate::server::AppState;

/// Resolved caller identity for token-authenticated routes.
pub(crate) struct AuthContext {
    pub user: UserRecord,
    /// Stored form of the token that authenticated this request.
    pub stored_token: String,
    /// `userId:storedToken`, the session/outbox key for this caller.
    pub device_key: String,
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn user_hint(headers: &HeaderMap) -> Option<String> {
    headers
        .get(wire_headers::USER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Authenticate a token-bearing request. The token comes from the
/// `Authorization` header or, when the server allows it, a `token` query
/// parameter. An `x-vimalinx-user` header scopes verification to one account.
///
/// The query-param decision uses the server-wide default: per-user overrides
/// cannot apply before the user is known.
pub(crate) fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> ApiResult<AuthContext> {
    let token = bearer_token(headers)
        .or_else(|| {
            state
                .config
                .security
                .allow_token_in_query
                .then(|| query_token.map(str::to_string))
                .flatten()
        })
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

    let user = state
        .credentials
        .verify_token(user_hint(headers).as_deref(), &token)?;
    let stored_token = state.credentials.token_stored_form(&token);
    let device_key = CredentialStore::device_key(&user.id, &stored_token);
    Ok(AuthContext {
        user,
        stored_token,
        device_key,
    })
}

/// Whether the request authenticates with the configured server token.
pub(crate) fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.config.server.server_token.as_deref() else {
        return false;
    };
    let Some(provided) = bearer_token(headers) else {
        return false;
    };
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Shared request gate: payload size, IP allow-list, and signature/replay
/// verification over the raw body.
pub(crate) fn enforce_request_security(
    state: &AppState,
    cfg: &ResolvedSecurity,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    scope: &str,
    body: &[u8],
) -> ApiResult<()> {
    if body.len() > cfg.max_payload_bytes {
        return Err(ApiError::PayloadTooLarge(format!(
            "payload exceeds {} bytes",
            cfg.max_payload_bytes
        )));
    }
    let ip = client_ip(headers, remote, state.config.security.trust_forwarded_for);
    if !ip_allowed(cfg.allowed_ips.as_deref(), ip.as_deref()) {
        return Err(ApiError::Forbidden("client ip not allowed".into()));
    }
    state
        .guard
        .verify_request(cfg, scope, headers, body, now_ms())
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidInput(format!("invalid JSON body: {e}")))
}
