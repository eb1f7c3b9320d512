use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::server::AppState;

pub async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConfig {
    ok: bool,
    registration_open: bool,
    invite_required: bool,
}

/// GET /api/config
///
/// Unauthenticated: tells clients whether registration is open and whether an
/// invite code is required.
pub async fn public_config(State(state): State<AppState>) -> Json<PublicConfig> {
    Json(PublicConfig {
        ok: true,
        registration_open: state.config.registration.open,
        invite_required: state.config.registration.invite_required(),
    })
}
