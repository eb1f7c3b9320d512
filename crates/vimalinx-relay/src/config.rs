use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::security::SecurityOverrides;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub security: SecurityDefaults,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// SSE keep-alive ping interval; detects dead connections.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
    /// Admin token. Grants the admin scope on machine endpoints and bypasses
    /// registration gating. If unset, admin endpoints reject everyone.
    #[serde(default)]
    pub server_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
            server_token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8484
}

fn default_request_timeout() -> u64 {
    300
}

fn default_keep_alive_interval() -> u64 {
    25
}

// ============================================================================
// RegistrationConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegistrationConfig {
    /// Whether self-service registration is open at all.
    #[serde(default = "default_true")]
    pub open: bool,
    /// Accepted invite codes. Empty means no invite is required.
    #[serde(default)]
    pub invite_codes: Vec<String>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            open: true,
            invite_codes: Vec::new(),
        }
    }
}

impl RegistrationConfig {
    pub fn invite_required(&self) -> bool {
        !self.invite_codes.is_empty()
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SecurityDefaults
// ============================================================================

/// Server-wide security defaults. Per-user [`SecurityOverrides`] stored on a
/// user record are merged over these at request time.
#[derive(Debug, Deserialize)]
pub struct SecurityDefaults {
    #[serde(default)]
    pub require_https: bool,
    /// Tokens belong in headers; query-param tokens are opt-in.
    #[serde(default)]
    pub allow_token_in_query: bool,
    /// Secret for request signing. Enables signature verification by default.
    #[serde(default)]
    pub hmac_secret: Option<String>,
    /// Defaults to "true iff a secret is configured" when unset.
    #[serde(default)]
    pub require_signature: Option<bool>,
    #[serde(default = "default_timestamp_skew_ms")]
    pub timestamp_skew_ms: i64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_sender_rate_limit")]
    pub sender_rate_limit_per_minute: u32,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Exact-match (or `*`) client IP allow-list. Unset allows all.
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    /// Defaults to "true iff a secret is configured" when unset.
    #[serde(default)]
    pub sign_outbound: Option<bool>,
    /// Trust `X-Forwarded-For` when resolving the client IP.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for SecurityDefaults {
    fn default() -> Self {
        Self {
            require_https: false,
            allow_token_in_query: false,
            hmac_secret: None,
            require_signature: None,
            timestamp_skew_ms: default_timestamp_skew_ms(),
            rate_limit_per_minute: default_rate_limit(),
            sender_rate_limit_per_minute: default_sender_rate_limit(),
            max_payload_bytes: default_max_payload_bytes(),
            allowed_ips: None,
            sign_outbound: None,
            trust_forwarded_for: false,
        }
    }
}

fn default_timestamp_skew_ms() -> i64 {
    5 * 60 * 1000
}

fn default_rate_limit() -> u32 {
    120
}

fn default_sender_rate_limit() -> u32 {
    60
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

// ============================================================================
// AuthConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Key used to HMAC device tokens at rest. When set, the persisted user
    /// snapshot never contains a usable credential.
    #[serde(default)]
    pub token_signing_key: Option<String>,
    /// Scrypt cost parameters. Embedded in each stored hash, so changing them
    /// never invalidates old hashes.
    #[serde(default = "default_scrypt_log_n")]
    pub scrypt_log_n: u8,
    #[serde(default = "default_scrypt_r")]
    pub scrypt_r: u32,
    #[serde(default = "default_scrypt_p")]
    pub scrypt_p: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_signing_key: None,
            scrypt_log_n: default_scrypt_log_n(),
            scrypt_r: default_scrypt_r(),
            scrypt_p: default_scrypt_p(),
        }
    }
}

fn default_scrypt_log_n() -> u8 {
    15
}

fn default_scrypt_r() -> u32 {
    8
}

fn default_scrypt_p() -> u32 {
    1
}

// ============================================================================
// StateConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StateConfig {
    /// Directory holding `users.json`, `machines.json` and `instances.json`.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".vimalinx")
}

// ============================================================================
// Per-user override hook
// ============================================================================

impl SecurityDefaults {
    /// Merge per-user overrides over these defaults.
    pub fn resolve(&self, overrides: Option<&SecurityOverrides>) -> crate::security::ResolvedSecurity {
        crate::security::resolve_security(self, overrides)
    }
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8484);
        assert_eq!(config.server.keep_alive_interval_seconds, 25);
        assert!(config.registration.open);
        assert!(!config.registration.invite_required());
        assert_eq!(config.security.timestamp_skew_ms, 300_000);
        assert_eq!(config.security.rate_limit_per_minute, 120);
        assert_eq!(config.security.sender_rate_limit_per_minute, 60);
        assert_eq!(config.security.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.state.dir, PathBuf::from(".vimalinx"));
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(&missing).await.unwrap();
        assert_eq!(config.server.port, 8484);
    }

    #[tokio::test]
    async fn load_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 9000
security:
  hmac_secret: "shared-secret"
registration:
  invite_codes: ["alpha", "beta"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.host, "0.0.0.0"); // default
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.security.hmac_secret.as_deref(), Some("shared-secret"));
        assert!(config.registration.invite_required());
    }

    #[tokio::test]
    async fn load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server: [not: a: map").unwrap();
        assert!(Config::load(file.path()).await.is_err());
    }
}
