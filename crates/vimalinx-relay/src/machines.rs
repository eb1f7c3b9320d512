//! Registry of gateway machines: registration, heartbeats, ownership, and
//! per-machine routing configuration.
//!
//! A machine id, once bound to a user, can never be claimed by another user.
//! Client-supplied ids must match `^[a-z0-9][a-z0-9_-]{2,63}$`; the server
//! generates a ULID-based id otherwise. Routing maps are sanitized entry by
//! entry: malformed keys or oversized values are dropped silently instead of
//! failing the whole request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use vimalinx_relay_protocol::{MachineRecord, MachineRouting, MachineStatus};

use crate::error::{ApiError, ApiResult};
use crate::instances::is_valid_mode_id;
use crate::persist::{Debouncer, StoreError, load_snapshot, write_snapshot};

const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Longest accepted routing hint value.
const MAX_HINT_LEN: usize = 200;

// ============================================================================
// Request shapes
// ============================================================================

/// Descriptive fields accepted on register.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    pub account_id: Option<String>,
    pub machine_label: Option<String>,
    pub host_name: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub runtime_version: Option<String>,
    pub plugin_version: Option<String>,
}

/// Partial update applied by PATCH.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePatch {
    pub routing: Option<MachineRouting>,
    pub status: Option<MachineStatus>,
    pub machine_label: Option<String>,
}

#[derive(Debug, Default, serde::Serialize, Deserialize)]
struct MachinesFile {
    machines: Vec<MachineRecord>,
}

// ============================================================================
// MachineRegistry
// ============================================================================

pub struct MachineRegistry {
    machines: Mutex<HashMap<String, MachineRecord>>,
    path: PathBuf,
    debounce: Debouncer,
}

impl MachineRegistry {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>, StoreError> {
        let mut machines = HashMap::new();
        if let Some(file) = load_snapshot::<MachinesFile>(&path).await? {
            for machine in file.machines {
                machines.insert(machine.machine_id.clone(), machine);
            }
            info!(count = machines.len(), "loaded machine snapshot");
        }
        Ok(Arc::new(Self {
            machines: Mutex::new(machines),
            path,
            debounce: Debouncer::new(SAVE_DEBOUNCE),
        }))
    }

    /// `^[a-z0-9][a-z0-9_-]{2,63}$`
    pub fn valid_machine_id(id: &str) -> bool {
        let mut chars = id.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        (3..=64).contains(&id.len())
            && (first.is_ascii_lowercase() || first.is_ascii_digit())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    }

    /// Create or update a machine owned by `user_id`. A requested id already
    /// bound to a different user is a conflict.
    pub fn register(
        self: &Arc<Self>,
        user_id: &str,
        machine_id: Option<String>,
        metadata: MachineMetadata,
        routing: Option<MachineRouting>,
    ) -> ApiResult<MachineRecord> {
        let machine_id = match machine_id {
            Some(id) => {
                if !Self::valid_machine_id(&id) {
                    return Err(ApiError::InvalidInput(
                        "machineId must match ^[a-z0-9][a-z0-9_-]{2,63}$".into(),
                    ));
                }
                id
            }
            None => format!("m-{}", ulid::Ulid::new().to_string().to_ascii_lowercase()),
        };

        let now = Utc::now();
        let routing = routing.map(sanitize_routing).filter(|r| !r.is_empty());

        let record = {
            let mut machines = lock(&self.machines);
            match machines.get_mut(&machine_id) {
                Some(existing) if existing.user_id != user_id => {
                    return Err(ApiError::Conflict(format!(
                        "machine {machine_id} belongs to another user"
                    )));
                }
                Some(existing) => {
                    apply_metadata(existing, metadata);
                    if routing.is_some() {
                        existing.routing = routing;
                    }
                    existing.status = MachineStatus::Online;
                    existing.updated_at = now;
                    existing.last_seen_at = now;
                    existing.clone()
                }
                None => {
                    let record = MachineRecord {
                        machine_id: machine_id.clone(),
                        user_id: user_id.to_string(),
                        account_id: metadata.account_id,
                        machine_label: metadata.machine_label,
                        host_name: metadata.host_name,
                        platform: metadata.platform,
                        arch: metadata.arch,
                        runtime_version: metadata.runtime_version,
                        plugin_version: metadata.plugin_version,
                        status: MachineStatus::Online,
                        created_at: now,
                        updated_at: now,
                        last_seen_at: now,
                        routing,
                    };
                    machines.insert(machine_id.clone(), record.clone());
                    record
                }
            }
        };

        self.schedule_save();
        info!(machine = %machine_id, user = %user_id, "registered machine");
        Ok(record)
    }

    /// Refresh `lastSeenAt`; the machine must exist and be owned by the
    /// caller.
    pub fn heartbeat(
        self: &Arc<Self>,
        user_id: &str,
        machine_id: &str,
        status: Option<MachineStatus>,
    ) -> ApiResult<MachineRecord> {
        let record = {
            let mut machines = lock(&self.machines);
            let machine = machines
                .get_mut(machine_id)
                .filter(|m| m.user_id == user_id)
                .ok_or_else(|| ApiError::NotFound(format!("machine {machine_id} not found")))?;
            let now = Utc::now();
            machine.last_seen_at = now;
            machine.updated_at = now;
            if let Some(status) = status {
                machine.status = status;
            }
            machine.clone()
        };
        self.schedule_save();
        Ok(record)
    }

    /// Admin- or owner-scoped partial update; `owner` restricts the update to
    /// machines owned by that user, `None` is the admin scope.
    pub fn patch(
        self: &Arc<Self>,
        owner: Option<&str>,
        machine_id: &str,
        patch: MachinePatch,
    ) -> ApiResult<MachineRecord> {
        let record = {
            let mut machines = lock(&self.machines);
            let machine = machines
                .get_mut(machine_id)
                .filter(|m| owner.is_none_or(|o| m.user_id == o))
                .ok_or_else(|| ApiError::NotFound(format!("machine {machine_id} not found")))?;
            if let Some(routing) = patch.routing {
                let routing = sanitize_routing(routing);
                machine.routing = (!routing.is_empty()).then_some(routing);
            }
            if let Some(status) = patch.status {
                machine.status = status;
            }
            if let Some(label) = patch.machine_label {
                machine.machine_label = Some(label);
            }
            machine.updated_at = Utc::now();
            machine.clone()
        };
        self.schedule_save();
        Ok(record)
    }

    pub fn get(&self, machine_id: &str) -> Option<MachineRecord> {
        lock(&self.machines).get(machine_id).cloned()
    }

    /// All machines (admin scope) or the owner's machines.
    pub fn list(&self, owner: Option<&str>) -> Vec<MachineRecord> {
        let machines = lock(&self.machines);
        let mut list: Vec<MachineRecord> = machines
            .values()
            .filter(|m| owner.is_none_or(|o| m.user_id == o))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        list
    }

    fn snapshot(&self) -> MachinesFile {
        MachinesFile {
            machines: self.list(None),
        }
    }

    pub async fn save_now(&self) -> Result<(), StoreError> {
        let file = self.snapshot();
        write_snapshot(&self.path, &file).await
    }

    fn schedule_save(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        self.debounce.schedule(move || async move {
            if let Err(e) = registry.save_now().await {
                warn!(error = %e, "deferred machine snapshot write failed");
            }
        });
    }
}

fn apply_metadata(record: &mut MachineRecord, metadata: MachineMetadata) {
    if metadata.account_id.is_some() {
        record.account_id = metadata.account_id;
    }
    if metadata.machine_label.is_some() {
        record.machine_label = metadata.machine_label;
    }
    if metadata.host_name.is_some() {
        record.host_name = metadata.host_name;
    }
    if metadata.platform.is_some() {
        record.platform = metadata.platform;
    }
    if metadata.arch.is_some() {
        record.arch = metadata.arch;
    }
    if metadata.runtime_version.is_some() {
        record.runtime_version = metadata.runtime_version;
    }
    if metadata.plugin_version.is_some() {
        record.plugin_version = metadata.plugin_version;
    }
}

/// Drop malformed routing entries instead of failing the request: keys must
/// be well-formed mode ids, values are length-capped.
fn sanitize_routing(routing: MachineRouting) -> MachineRouting {
    let keep = |(k, v): (String, String)| {
        (is_valid_mode_id(&k) && !v.is_empty() && v.len() <= MAX_HINT_LEN).then_some((k, v))
    };
    MachineRouting {
        accounts: routing.accounts.into_iter().filter_map(keep).collect(),
        hints: routing.hints.into_iter().filter_map(keep).collect(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
