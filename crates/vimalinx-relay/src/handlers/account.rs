//! Account lifecycle handlers: registration, logins, token issuance, and
//! per-token usage reporting.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::credentials::{TokenUsageEntry, UsageEvent};
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

use super::{authenticate, is_admin};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    user_id: String,
    password: String,
    display_name: Option<String>,
    invite_code: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    ok: bool,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuthRequest {
    user_id: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    ok: bool,
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    ok: bool,
    user_id: String,
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageResponse {
    ok: bool,
    tokens: Vec<TokenUsageEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLoginRequest {
    token: Option<String>,
    user_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/register
///
/// Self-service when registration is open (and the invite code matches, if
/// invites are configured); the server token bypasses both gates.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    if !is_admin(&state, &headers) {
        let registration = &state.config.registration;
        if !registration.open {
            return Err(ApiError::Forbidden("registration is disabled".into()));
        }
        if registration.invite_required() {
            let ok = req
                .invite_code
                .as_deref()
                .is_some_and(|code| registration.invite_codes.iter().any(|c| c == code));
            if !ok {
                return Err(ApiError::Forbidden("a valid invite code is required".into()));
            }
        }
    }

    let user_id = state
        .credentials
        .register(&req.user_id, &req.password, req.display_name)
        .await?;
    Ok(Json(RegisterResponse { ok: true, user_id }))
}

/// POST /api/account/login
pub async fn account_login(
    State(state): State<AppState>,
    Json(req): Json<PasswordAuthRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user = state.credentials.login(&req.user_id, &req.password)?;
    Ok(Json(LoginResponse {
        ok: true,
        user_id: user.id,
        display_name: user.display_name,
    }))
}

/// POST /api/token
///
/// Verifies the password and mints a new device token.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<PasswordAuthRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token = state
        .credentials
        .issue_token(&req.user_id, &req.password)
        .await?;
    let user_id = crate::credentials::CredentialStore::normalize_user_id(&req.user_id)?;
    Ok(Json(TokenResponse {
        ok: true,
        user_id,
        token,
    }))
}

/// POST /api/token/usage
pub async fn token_usage(
    State(state): State<AppState>,
    Json(req): Json<PasswordAuthRequest>,
) -> ApiResult<Json<TokenUsageResponse>> {
    let user = state.credentials.login(&req.user_id, &req.password)?;
    Ok(Json(TokenUsageResponse {
        ok: true,
        tokens: state.credentials.usage_report(&user.id),
    }))
}

/// POST /api/login
///
/// Token-based login used by the mobile client. The token comes from the
/// body or the `Authorization` header; an optional `userId` scopes the
/// lookup.
pub async fn token_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenLoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let auth = match req.token {
        Some(token) => {
            let user = state
                .credentials
                .verify_token(req.user_id.as_deref(), &token)?;
            let stored = state.credentials.token_stored_form(&token);
            super::AuthContext {
                device_key: crate::credentials::CredentialStore::device_key(&user.id, &stored),
                stored_token: stored,
                user,
            }
        }
        None => authenticate(&state, &headers, None)?,
    };

    state
        .credentials
        .record_usage(&auth.user.id, &auth.stored_token, UsageEvent::Seen);
    Ok(Json(LoginResponse {
        ok: true,
        user_id: auth.user.id,
        display_name: auth.user.display_name,
    }))
}
