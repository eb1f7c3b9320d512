//! Machine registry handlers and admin provisioning.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use vimalinx_relay_protocol::{MachineRecord, MachineRouting, MachineStatus};

use crate::error::{ApiError, ApiResult};
use crate::machines::{MachineMetadata, MachinePatch};
use crate::server::AppState;

use super::{authenticate, bearer_token, decode_json, enforce_request_security, is_admin};

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
pub struct MachineRegisterRequest {
    machine_id: Option<String>,
    /// Password credentials, accepted as an alternative to a bearer token.
    user_id: Option<String>,
    password: Option<String>,
    #[serde(flatten)]
    metadata: MachineMetadata,
    routing: Option<MachineRouting>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    machine_id: String,
    status: Option<MachineStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineResponse {
    ok: bool,
    machine: MachineRecord,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineListResponse {
    ok: bool,
    machines: Vec<MachineRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigResponse {
    ok: bool,
    machines: Vec<MachineRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    user_id: String,
    password: Option<String>,
    display_name: Option<String>,
    machine_id: Option<String>,
    #[serde(flatten)]
    metadata: MachineMetadata,
    routing: Option<MachineRouting>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    ok: bool,
    user_id: String,
    token: String,
    machine_id: String,
    /// Present only when the password was generated server-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/machine/register
///
/// Accepts either a bearer token or `userId`+`password` in the body, so a
/// gateway can self-register before a token has been issued.
pub async fn machine_register(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<MachineResponse>> {
    let token_user = if bearer_token(&headers).is_some() || query.token.is_some() {
        Some(authenticate(&state, &headers, query.token.as_deref())?.user.id)
    } else {
        None
    };

    // The gate runs before the body is decoded. With body credentials the
    // identity is not known yet, so the gate uses the server defaults and a
    // shared nonce scope.
    let cfg = state.resolved_security(token_user.as_deref());
    let scope = match &token_user {
        Some(user) => format!("machine:{user}"),
        None => "machine:register".to_string(),
    };
    enforce_request_security(&state, &cfg, &headers, Some(remote), &scope, &body)?;

    let req: MachineRegisterRequest = decode_json(&body)?;
    let user_id = match token_user {
        Some(user) => user,
        None => {
            let (Some(user_id), Some(password)) = (&req.user_id, &req.password) else {
                return Err(ApiError::Unauthorized(
                    "a bearer token or userId+password is required".into(),
                ));
            };
            state.credentials.login(user_id, password)?.id
        }
    };

    let machine = state
        .machines
        .register(&user_id, req.machine_id, req.metadata, req.routing)?;
    Ok(Json(MachineResponse { ok: true, machine }))
}

/// POST /api/machine/heartbeat
pub async fn machine_heartbeat(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> ApiResult<Json<MachineResponse>> {
    let auth = authenticate(&state, &headers, query.token.as_deref())?;
    let cfg = state.resolved_security(Some(&auth.user.id));
    enforce_request_security(
        &state,
        &cfg,
        &headers,
        Some(remote),
        &format!("machine:{}", auth.user.id),
        &body,
    )?;

    let req: HeartbeatRequest = decode_json(&body)?;
    let machine = state
        .machines
        .heartbeat(&auth.user.id, &req.machine_id, req.status)?;
    Ok(Json(MachineResponse { ok: true, machine }))
}

/// GET /api/machine/config
///
/// The caller's machines with their routing tables, for a gateway to pull its
/// effective configuration.
pub async fn machine_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<MachineConfigResponse>> {
    let auth = authenticate(&state, &headers, query.token.as_deref())?;
    Ok(Json(MachineConfigResponse {
        ok: true,
        machines: state.machines.list(Some(&auth.user.id)),
    }))
}

/// GET /api/machines
///
/// The server token sees every machine; a user token sees its own.
pub async fn list_machines(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<MachineListResponse>> {
    let owner = if is_admin(&state, &headers) {
        None
    } else {
        Some(authenticate(&state, &headers, query.token.as_deref())?.user.id)
    };
    Ok(Json(MachineListResponse {
        ok: true,
        machines: state.machines.list(owner.as_deref()),
    }))
}

/// GET /api/machines/{machineId}
pub async fn get_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(machine_id): Path<String>,
) -> ApiResult<Json<MachineResponse>> {
    let machine = state
        .machines
        .get(&machine_id)
        .ok_or_else(|| ApiError::NotFound(format!("machine {machine_id} not found")))?;

    if !is_admin(&state, &headers) {
        let auth = authenticate(&state, &headers, query.token.as_deref())?;
        if machine.user_id != auth.user.id {
            // Existence of another user's machine is not disclosed.
            return Err(ApiError::NotFound(format!("machine {machine_id} not found")));
        }
    }
    Ok(Json(MachineResponse { ok: true, machine }))
}

/// PATCH /api/machines/{machineId}
pub async fn patch_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(machine_id): Path<String>,
    Json(patch): Json<MachinePatch>,
) -> ApiResult<Json<MachineResponse>> {
    let owner = if is_admin(&state, &headers) {
        None
    } else {
        Some(authenticate(&state, &headers, query.token.as_deref())?.user.id)
    };
    let machine = state
        .machines
        .patch(owner.as_deref(), &machine_id, patch)?;
    Ok(Json(MachineResponse { ok: true, machine }))
}

/// POST /api/machines/contributors
///
/// Server token only. Creates the user when absent (generating a password if
/// none is supplied), mints a device token, and registers the machine in one
/// call.
pub async fn provision_contributor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<Json<ProvisionResponse>> {
    if !is_admin(&state, &headers) {
        return Err(ApiError::Forbidden("server token required".into()));
    }

    let user_id = crate::credentials::CredentialStore::normalize_user_id(&req.user_id)?;
    let generated = if state.credentials.user_exists(&user_id) {
        None
    } else {
        let password = req.password.clone().unwrap_or_else(random_password);
        state
            .credentials
            .register(&user_id, &password, req.display_name.clone())
            .await?;
        req.password.is_none().then_some(password)
    };

    let token = state.credentials.issue_token_for(&user_id).await?;
    let machine = state
        .machines
        .register(&user_id, req.machine_id, req.metadata, req.routing)?;

    Ok(Json(ProvisionResponse {
        ok: true,
        user_id,
        token,
        machine_id: machine.machine_id,
        password: generated,
    }))
}

fn random_password() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
