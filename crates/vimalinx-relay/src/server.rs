use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::ApiError;
use crate::handlers;
use crate::inbound::InboundQueue;
use crate::instances::InstanceRouter;
use crate::machines::MachineRegistry;
use crate::persist::StoreError;
use crate::security::{ResolvedSecurity, SecurityGuard};
use crate::sessions::SessionHub;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub hub: Arc<SessionHub>,
    pub inbound: Arc<InboundQueue>,
    pub machines: Arc<MachineRegistry>,
    pub instances: Arc<InstanceRouter>,
    pub guard: Arc<SecurityGuard>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Load the persistent stores from the configured state directory.
    pub async fn open(config: Config) -> Result<Self, StoreError> {
        let dir = config.state.dir.clone();
        let credentials =
            CredentialStore::open(dir.join("users.json"), &config.auth).await?;
        let machines = MachineRegistry::open(dir.join("machines.json")).await?;
        let instances = InstanceRouter::open(dir.join("instances.json")).await?;
        Ok(Self {
            config: Arc::new(config),
            credentials,
            hub: Arc::new(SessionHub::new()),
            inbound: Arc::new(InboundQueue::new()),
            machines,
            instances,
            guard: Arc::new(SecurityGuard::new()),
            http: reqwest::Client::new(),
        })
    }

    /// Effective security settings for a request, merging the user's stored
    /// overrides over the server defaults.
    pub fn resolved_security(&self, user_id: Option<&str>) -> ResolvedSecurity {
        let overrides = user_id.and_then(|id| self.credentials.security_overrides(id));
        self.config.security.resolve(overrides.as_ref())
    }
}

pub fn build_app(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_seconds);

    let api = Router::new()
        .route("/api/config", get(handlers::public_config))
        .route("/api/register", post(handlers::register))
        .route("/api/account/login", post(handlers::account_login))
        .route("/api/token", post(handlers::issue_token))
        .route("/api/token/usage", post(handlers::token_usage))
        .route("/api/login", post(handlers::token_login))
        .route("/api/message", post(handlers::post_message))
        .route("/send", post(handlers::send_outbound))
        .route("/api/machine/register", post(handlers::machine_register))
        .route("/api/machine/heartbeat", post(handlers::machine_heartbeat))
        .route("/api/machine/config", get(handlers::machine_config))
        .route("/api/machines", get(handlers::list_machines))
        .route("/api/machines/{machine_id}", get(handlers::get_machine))
        .route("/api/machines/{machine_id}", patch(handlers::patch_machine))
        .route(
            "/api/machines/contributors",
            post(handlers::provision_contributor),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    // The SSE stream and the long-poll endpoint hold connections open far
    // longer than any regular request, so the timeout layer skips them.
    let streaming = Router::new()
        .route("/api/stream", get(handlers::stream))
        .route("/api/poll", get(handlers::poll));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(api)
        .merge(streaming)
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".into())
}

/// Flush every debounced snapshot before exit.
pub async fn flush_state(state: &AppState) {
    if let Err(e) = state.credentials.save_now().await {
        tracing::warn!(error = %e, "final user snapshot write failed");
    }
    if let Err(e) = state.machines.save_now().await {
        tracing::warn!(error = %e, "final machine snapshot write failed");
    }
    if let Err(e) = state.instances.save_now().await {
        tracing::warn!(error = %e, "final instance snapshot write failed");
    }
}
