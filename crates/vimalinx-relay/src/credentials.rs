//! User identities, device tokens, and password verification.
//!
//! Users are kept in an in-memory map and snapshotted to `users.json`.
//! Passwords are scrypt hashes in PHC string format, so the cost parameters
//! travel inside the stored hash and can change without invalidating old
//! hashes. Device tokens are persisted as `HMAC_SHA256(signing_key, token)`
//! when a signing key is configured; the snapshot then contains no usable
//! credential.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use rand::RngCore;
use scrypt::{Params, Scrypt};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::error::{ApiError, ApiResult};
use crate::persist::{Debouncer, StoreError, load_snapshot, write_snapshot};
use crate::security::{SecurityOverrides, hmac_hex};

/// Debounce delay for user snapshot writes.
const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

// ============================================================================
// Records
// ============================================================================

/// Per-token usage counters, keyed by the stored token form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stream_connects: u64,
    #[serde(default)]
    pub inbound_count: u64,
    #[serde(default)]
    pub outbound_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inbound_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outbound_at: Option<DateTime<Utc>>,
}

impl TokenUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_seen_at: None,
            stream_connects: 0,
            inbound_count: 0,
            outbound_count: 0,
            last_inbound_at: None,
            last_outbound_at: None,
        }
    }
}

/// Counter bumped by [`CredentialStore::record_usage`].
#[derive(Debug, Clone, Copy)]
pub enum UsageEvent {
    Seen,
    StreamConnect,
    Inbound,
    Outbound,
}

/// Per-user gateway override: inbound messages are forwarded to this URL
/// (webhook mode) instead of being queued for long-poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOverride {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    /// Stored token forms; the first entry is the primary token.
    #[serde(default)]
    pub tokens: Vec<String>,
    pub password_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityOverrides>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub token_usage: HashMap<String, TokenUsage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    users: Vec<UserRecord>,
}

/// One row of the `/api/token/usage` report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageEntry {
    /// Stored token form (a digest when a signing key is configured).
    pub token: String,
    pub primary: bool,
    #[serde(flatten)]
    pub usage: TokenUsage,
}

// ============================================================================
// CredentialStore
// ============================================================================

pub struct CredentialStore {
    users: Mutex<HashMap<String, UserRecord>>,
    path: PathBuf,
    signing_key: Option<String>,
    params: Params,
    debounce: Debouncer,
}

impl CredentialStore {
    pub async fn open(path: PathBuf, auth: &AuthConfig) -> Result<Arc<Self>, StoreError> {
        let params = Params::new(auth.scrypt_log_n, auth.scrypt_r, auth.scrypt_p, 32)
            .unwrap_or_else(|_| Params::recommended());

        let mut users = HashMap::new();
        if let Some(file) = load_snapshot::<UsersFile>(&path).await? {
            for user in file.users {
                users.insert(user.id.clone(), user);
            }
            info!(count = users.len(), "loaded user snapshot");
        }

        Ok(Arc::new(Self {
            users: Mutex::new(users),
            path,
            signing_key: auth.token_signing_key.clone(),
            params,
            debounce: Debouncer::new(SAVE_DEBOUNCE),
        }))
    }

    // ------------------------------------------------------------------
    // Identity format
    // ------------------------------------------------------------------

    /// User ids are 2-32 chars of `[a-z0-9_-]`, case-insensitive.
    pub fn normalize_user_id(raw: &str) -> ApiResult<String> {
        let id = raw.trim().to_ascii_lowercase();
        let valid_len = (2..=32).contains(&id.len());
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_len || !valid_chars {
            return Err(ApiError::InvalidInput(
                "userId must be 2-32 chars of [a-z0-9_-]".into(),
            ));
        }
        Ok(id)
    }

    /// Stored form of a raw token: an HMAC digest when a signing key is
    /// configured, otherwise the raw token itself.
    pub fn token_stored_form(&self, raw_token: &str) -> String {
        match &self.signing_key {
            Some(key) => hmac_hex(key.as_bytes(), raw_token.as_bytes()),
            None => raw_token.to_string(),
        }
    }

    /// Device key for a user and a stored token form.
    pub fn device_key(user_id: &str, stored_token: &str) -> String {
        format!("{user_id}:{stored_token}")
    }

    // ------------------------------------------------------------------
    // Registration and login
    // ------------------------------------------------------------------

    pub async fn register(
        self: &Arc<Self>,
        user_id: &str,
        password: &str,
        display_name: Option<String>,
    ) -> ApiResult<String> {
        let user_id = Self::normalize_user_id(user_id)?;
        if password.len() < 8 {
            return Err(ApiError::InvalidInput(
                "password must be at least 8 characters".into(),
            ));
        }
        let password_hash = self.hash_password(password)?;

        {
            let mut users = lock(&self.users);
            if users.contains_key(&user_id) {
                return Err(ApiError::Conflict(format!("user {user_id} already exists")));
            }
            users.insert(
                user_id.clone(),
                UserRecord {
                    id: user_id.clone(),
                    tokens: Vec::new(),
                    password_hash,
                    display_name,
                    gateway: None,
                    security: None,
                    token_usage: HashMap::new(),
                },
            );
        }

        // Registration persists synchronously; a lost snapshot here would
        // lose the account.
        self.save_now().await?;
        info!(user = %user_id, "registered user");
        Ok(user_id)
    }

    /// Verify a password. A legacy plaintext stored password is migrated to
    /// scrypt in place on first successful check.
    pub fn login(self: &Arc<Self>, user_id: &str, password: &str) -> ApiResult<UserRecord> {
        let user_id = Self::normalize_user_id(user_id)?;
        let stored_hash = {
            let users = lock(&self.users);
            users
                .get(&user_id)
                .map(|u| u.password_hash.clone())
                .ok_or_else(|| ApiError::Unauthorized("unknown user or bad password".into()))?
        };

        if let Ok(parsed) = PasswordHash::new(&stored_hash) {
            if Scrypt
                .verify_password(password.as_bytes(), &parsed)
                .is_err()
            {
                return Err(ApiError::Unauthorized("unknown user or bad password".into()));
            }
        } else {
            // Legacy plaintext password.
            let matches: bool = stored_hash
                .as_bytes()
                .ct_eq(password.as_bytes())
                .into();
            if !matches {
                return Err(ApiError::Unauthorized("unknown user or bad password".into()));
            }
            if let Ok(rehashed) = self.hash_password(password) {
                let mut users = lock(&self.users);
                if let Some(user) = users.get_mut(&user_id) {
                    user.password_hash = rehashed;
                }
                drop(users);
                self.schedule_save();
                info!(user = %user_id, "migrated legacy plaintext password");
            }
        }

        let users = lock(&self.users);
        users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("unknown user or bad password".into()))
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Verify the password, then mint a random 128-bit hex token that is
    /// globally unique across all users' token sets.
    pub async fn issue_token(self: &Arc<Self>, user_id: &str, password: &str) -> ApiResult<String> {
        let user = self.login(user_id, password)?;
        self.issue_token_for(&user.id).await
    }

    /// Mint a token without a password check. Admin provisioning only.
    pub async fn issue_token_for(self: &Arc<Self>, user_id: &str) -> ApiResult<String> {
        let raw = {
            let mut users = lock(&self.users);
            if !users.contains_key(user_id) {
                return Err(ApiError::NotFound(format!("user {user_id} not found")));
            }
            let raw = loop {
                let candidate = random_token();
                let stored = self.token_stored_form(&candidate);
                let taken = users.values().any(|u| u.tokens.iter().any(|t| *t == stored));
                if !taken {
                    break candidate;
                }
            };
            let stored = self.token_stored_form(&raw);
            let user = users.get_mut(user_id).ok_or_else(|| {
                ApiError::NotFound(format!("user {user_id} not found"))
            })?;
            user.tokens.push(stored.clone());
            user.token_usage.insert(stored, TokenUsage::new(Utc::now()));
            raw
        };

        // Token issuance also persists synchronously.
        self.save_now().await?;
        info!(user = %user_id, "issued device token");
        Ok(raw)
    }

    /// Resolve a user by exact token match, scoped to `user_id` when given,
    /// otherwise a global scan. Independent of the password.
    pub fn verify_token(&self, user_id: Option<&str>, raw_token: &str) -> ApiResult<UserRecord> {
        let stored = self.token_stored_form(raw_token);
        let users = lock(&self.users);

        let matches_token = |user: &UserRecord| {
            user.tokens.iter().any(|t| {
                let eq: bool = t.as_bytes().ct_eq(stored.as_bytes()).into();
                eq
            })
        };

        let found = match user_id {
            Some(id) => users.get(&id.to_ascii_lowercase()).filter(|u| matches_token(u)),
            None => users.values().find(|u| matches_token(u)),
        };

        found
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("invalid token".into()))
    }

    /// Stored form of the user's primary (first issued) token.
    pub fn primary_token(&self, user_id: &str) -> Option<String> {
        let users = lock(&self.users);
        users.get(user_id).and_then(|u| u.tokens.first().cloned())
    }

    /// All device keys derivable from the user's token set.
    pub fn device_keys(&self, user_id: &str) -> Vec<String> {
        let users = lock(&self.users);
        users
            .get(user_id)
            .map(|u| {
                u.tokens
                    .iter()
                    .map(|t| Self::device_key(user_id, t))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Usage counters and lookups
    // ------------------------------------------------------------------

    pub fn record_usage(self: &Arc<Self>, user_id: &str, stored_token: &str, event: UsageEvent) {
        let now = Utc::now();
        {
            let mut users = lock(&self.users);
            let Some(user) = users.get_mut(user_id) else {
                return;
            };
            let usage = user
                .token_usage
                .entry(stored_token.to_string())
                .or_insert_with(|| TokenUsage::new(now));
            usage.last_seen_at = Some(now);
            match event {
                UsageEvent::Seen => {}
                UsageEvent::StreamConnect => usage.stream_connects += 1,
                UsageEvent::Inbound => {
                    usage.inbound_count += 1;
                    usage.last_inbound_at = Some(now);
                }
                UsageEvent::Outbound => {
                    usage.outbound_count += 1;
                    usage.last_outbound_at = Some(now);
                }
            }
        }
        self.schedule_save();
    }

    pub fn usage_report(&self, user_id: &str) -> Vec<TokenUsageEntry> {
        let users = lock(&self.users);
        let Some(user) = users.get(user_id) else {
            return Vec::new();
        };
        user.tokens
            .iter()
            .enumerate()
            .map(|(i, token)| TokenUsageEntry {
                token: token.clone(),
                primary: i == 0,
                usage: user
                    .token_usage
                    .get(token)
                    .cloned()
                    .unwrap_or_else(|| TokenUsage::new(Utc::now())),
            })
            .collect()
    }

    pub fn gateway_override(&self, user_id: &str) -> Option<GatewayOverride> {
        let users = lock(&self.users);
        users.get(user_id).and_then(|u| u.gateway.clone())
    }

    pub fn security_overrides(&self, user_id: &str) -> Option<SecurityOverrides> {
        let users = lock(&self.users);
        users.get(user_id).and_then(|u| u.security.clone())
    }

    pub fn user_exists(&self, user_id: &str) -> bool {
        lock(&self.users).contains_key(user_id)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn snapshot(&self) -> UsersFile {
        let users = lock(&self.users);
        let mut list: Vec<UserRecord> = users.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        UsersFile { users: list }
    }

    pub async fn save_now(&self) -> ApiResult<()> {
        let file = self.snapshot();
        write_snapshot(&self.path, &file)
            .await
            .map_err(|e| ApiError::Internal(format!("failed to persist users: {e}")))
    }

    fn schedule_save(self: &Arc<Self>) {
        let store = Arc::clone(self);
        self.debounce.schedule(move || async move {
            if let Err(e) = store.save_now().await {
                warn!(error = %e, "deferred user snapshot write failed");
            }
        });
    }

    fn hash_password(&self, password: &str) -> ApiResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Scrypt
            .hash_password_customized(password.as_bytes(), None, None, self.params, &salt)
            .map(|h| h.to_string())
            .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// Tests
// ============================================================================
