//! Per-conversation instance configs and derived mode metadata.
//!
//! An instance config pins a conversation to a model tier and an identity
//! profile. Whenever a config exists for `(userId, chatId)`, the metadata
//! derived from it overrides any mode fields supplied by the client.
//!
//! The `modeId` encoding `inst_<tier>_<identity>` is a wire-format contract;
//! clients parse it. Non-alphanumeric characters in either component fold to
//! underscores.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vimalinx_relay_protocol::ModeMetadata;

use crate::error::{ApiError, ApiResult};
use crate::persist::{Debouncer, StoreError, load_snapshot, write_snapshot};

/// Instance snapshots tolerate a shorter debounce than user data; they are
/// small and upserts are rare.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(200);

// ============================================================================
// Closed enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Standard,
    Pro,
    Max,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Standard => "standard",
            ModelTier::Pro => "pro",
            ModelTier::Max => "max",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ModelTier::Standard => "Standard",
            ModelTier::Pro => "Pro",
            ModelTier::Max => "Max",
        }
    }

    fn model_hint(&self) -> &'static str {
        match self {
            ModelTier::Standard => "balanced",
            ModelTier::Pro => "advanced",
            ModelTier::Max => "frontier",
        }
    }
}

impl FromStr for ModelTier {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ModelTier::Standard),
            "pro" => Ok(ModelTier::Pro),
            "max" => Ok(ModelTier::Max),
            other => Err(ApiError::InvalidInput(format!(
                "unknown model tier: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityProfile {
    #[serde(rename = "e-commerce")]
    ECommerce,
    #[serde(rename = "writing")]
    Writing,
    #[serde(rename = "creator")]
    Creator,
}

impl IdentityProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityProfile::ECommerce => "e-commerce",
            IdentityProfile::Writing => "writing",
            IdentityProfile::Creator => "creator",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            IdentityProfile::ECommerce => "E-commerce",
            IdentityProfile::Writing => "Writing",
            IdentityProfile::Creator => "Creator",
        }
    }

    fn agent_hint(&self) -> &'static str {
        match self {
            IdentityProfile::ECommerce => "storefront",
            IdentityProfile::Writing => "editor",
            IdentityProfile::Creator => "studio",
        }
    }

    fn skills_hint(&self) -> &'static str {
        match self {
            IdentityProfile::ECommerce => "catalog,inventory,orders",
            IdentityProfile::Writing => "drafting,rewriting,summaries",
            IdentityProfile::Creator => "scripts,captions,publishing",
        }
    }
}

impl FromStr for IdentityProfile {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e-commerce" => Ok(IdentityProfile::ECommerce),
            "writing" => Ok(IdentityProfile::Writing),
            "creator" => Ok(IdentityProfile::Creator),
            other => Err(ApiError::InvalidInput(format!(
                "unknown identity profile: {other}"
            ))),
        }
    }
}

/// Fold a tier or identity id into a mode-id component: lowercase, with
/// every non-alphanumeric character replaced by `_`.
pub fn fold_mode_component(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Whether a string is a well-formed mode id (used when validating machine
/// routing maps).
pub fn is_valid_mode_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ============================================================================
// InstanceConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub user_id: String,
    pub chat_id: String,
    pub model_tier_id: ModelTier,
    pub identity_id: IdentityProfile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceConfig {
    /// Stable mode id: `inst_<tier>_<identity>`, components folded.
    pub fn mode_id(&self) -> String {
        format!(
            "inst_{}_{}",
            fold_mode_component(self.model_tier_id.as_str()),
            fold_mode_component(self.identity_id.as_str())
        )
    }

    pub fn derive_mode(&self) -> ModeMetadata {
        ModeMetadata {
            mode_id: Some(self.mode_id()),
            mode_label: Some(format!(
                "{} {}",
                self.model_tier_id.label(),
                self.identity_id.label()
            )),
            model_hint: Some(self.model_tier_id.model_hint().to_string()),
            agent_hint: Some(self.identity_id.agent_hint().to_string()),
            skills_hint: Some(self.identity_id.skills_hint().to_string()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstancesFile {
    instances: Vec<InstanceConfig>,
}

// ============================================================================
// InstanceRouter
// ============================================================================

pub struct InstanceRouter {
    /// Keyed by `(user_id, chat_id)`.
    instances: Mutex<HashMap<(String, String), InstanceConfig>>,
    path: PathBuf,
    debounce: Debouncer,
}

impl InstanceRouter {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>, StoreError> {
        let mut instances = HashMap::new();
        if let Some(file) = load_snapshot::<InstancesFile>(&path).await? {
            for config in file.instances {
                instances.insert((config.user_id.clone(), config.chat_id.clone()), config);
            }
            info!(count = instances.len(), "loaded instance snapshot");
        }
        Ok(Arc::new(Self {
            instances: Mutex::new(instances),
            path,
            debounce: Debouncer::new(SAVE_DEBOUNCE),
        }))
    }

    /// Create or update the config for a conversation. An existing record
    /// keeps its original `created_at`.
    pub fn upsert(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: &str,
        tier: ModelTier,
        identity: IdentityProfile,
    ) -> InstanceConfig {
        let now = Utc::now();
        let config = {
            let mut instances = lock(&self.instances);
            let key = (user_id.to_string(), chat_id.to_string());
            let created_at = instances.get(&key).map(|c| c.created_at).unwrap_or(now);
            let config = InstanceConfig {
                user_id: user_id.to_string(),
                chat_id: chat_id.to_string(),
                model_tier_id: tier,
                identity_id: identity,
                created_at,
                updated_at: now,
            };
            instances.insert(key, config.clone());
            config
        };
        self.schedule_save();
        config
    }

    /// Parse-and-upsert from wire strings; both ids must be members of the
    /// closed enumerations.
    pub fn upsert_from_ids(
        self: &Arc<Self>,
        user_id: &str,
        chat_id: &str,
        tier_id: &str,
        identity_id: &str,
    ) -> ApiResult<InstanceConfig> {
        let tier = tier_id.parse()?;
        let identity = identity_id.parse()?;
        Ok(self.upsert(user_id, chat_id, tier, identity))
    }

    pub fn lookup(&self, user_id: &str, chat_id: &str) -> Option<InstanceConfig> {
        let instances = lock(&self.instances);
        instances
            .get(&(user_id.to_string(), chat_id.to_string()))
            .cloned()
    }

    /// Metadata for an inbound message: derived from the stored config when
    /// one exists (always winning), otherwise whatever the client supplied.
    pub fn stamp(&self, user_id: &str, chat_id: &str, client_mode: ModeMetadata) -> ModeMetadata {
        match self.lookup(user_id, chat_id) {
            Some(config) => config.derive_mode(),
            None => client_mode,
        }
    }

    fn snapshot(&self) -> InstancesFile {
        let instances = lock(&self.instances);
        let mut list: Vec<InstanceConfig> = instances.values().cloned().collect();
        list.sort_by(|a, b| (&a.user_id, &a.chat_id).cmp(&(&b.user_id, &b.chat_id)));
        InstancesFile { instances: list }
    }

    pub async fn save_now(&self) -> Result<(), StoreError> {
        let file = self.snapshot();
        write_snapshot(&self.path, &file).await
    }

    fn schedule_save(self: &Arc<Self>) {
        let router = Arc::clone(self);
        self.debounce.schedule(move || async move {
            if let Err(e) = router.save_now().await {
                warn!(error = %e, "deferred instance snapshot write failed");
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
