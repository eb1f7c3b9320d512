//! Request authenticity and abuse controls.
//!
//! Three concerns live here:
//!
//! - **Signing**: `HMAC_SHA256(secret, "{timestamp}.{nonce}.{raw_body}")`
//!   carried in the `x-vimalinx-*` headers, verified with a constant-time
//!   comparison against the raw request body.
//! - **Replay protection**: a per-scope nonce window rejects a reused nonce
//!   within the freshness window; entries older than the window are pruned on
//!   each check.
//! - **Rate limiting**: a fixed-window per-minute counter keyed by
//!   `scope:identity`. Approximate on purpose; bursts straddling a window
//!   boundary are under-penalized.
//!
//! Nonce and rate-limit maps grow with the number of distinct scopes/keys and
//! are only pruned lazily on the next access to the same key. Sustained
//! traffic from many distinct identities therefore grows these maps without
//! bound; known limitation carried over from the wire contract.

use std::collections::HashMap;

use axum::http::HeaderMap;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use vimalinx_relay_protocol::{headers, signing_payload};

use crate::config::SecurityDefaults;
use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Per-user overrides and resolution
// ============================================================================

/// Per-user security overrides, stored on the user record. Any field left
/// unset falls through to the server-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_https: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_token_in_query: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmac_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_signature: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_skew_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_rate_limit_per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_payload_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_outbound: Option<bool>,
}

/// Fully resolved security settings for one request.
#[derive(Debug, Clone)]
pub struct ResolvedSecurity {
    pub require_https: bool,
    pub allow_token_in_query: bool,
    pub hmac_secret: Option<String>,
    pub require_signature: bool,
    pub timestamp_skew_ms: i64,
    pub rate_limit_per_minute: u32,
    pub sender_rate_limit_per_minute: u32,
    pub max_payload_bytes: usize,
    pub allowed_ips: Option<Vec<String>>,
    pub sign_outbound: bool,
}

/// Merge per-user overrides over the server defaults. `require_signature`
/// and `sign_outbound` default to "true iff a secret is configured".
pub fn resolve_security(
    defaults: &SecurityDefaults,
    overrides: Option<&SecurityOverrides>,
) -> ResolvedSecurity {
    let o = overrides.cloned().unwrap_or_default();
    let hmac_secret = o.hmac_secret.or_else(|| defaults.hmac_secret.clone());
    let has_secret = hmac_secret.is_some();
    ResolvedSecurity {
        require_https: o.require_https.unwrap_or(defaults.require_https),
        allow_token_in_query: o
            .allow_token_in_query
            .unwrap_or(defaults.allow_token_in_query),
        require_signature: o
            .require_signature
            .or(defaults.require_signature)
            .unwrap_or(has_secret),
        timestamp_skew_ms: o.timestamp_skew_ms.unwrap_or(defaults.timestamp_skew_ms),
        rate_limit_per_minute: o
            .rate_limit_per_minute
            .unwrap_or(defaults.rate_limit_per_minute),
        sender_rate_limit_per_minute: o
            .sender_rate_limit_per_minute
            .unwrap_or(defaults.sender_rate_limit_per_minute),
        max_payload_bytes: o.max_payload_bytes.unwrap_or(defaults.max_payload_bytes),
        allowed_ips: o.allowed_ips.or_else(|| defaults.allowed_ips.clone()),
        sign_outbound: o
            .sign_outbound
            .or(defaults.sign_outbound)
            .unwrap_or(has_secret),
        hmac_secret,
    }
}

// ============================================================================
// HMAC helpers
// ============================================================================

/// Hex-encoded `HMAC_SHA256(key, message)`.
pub fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Sign a request body for the given timestamp and nonce.
pub fn sign_request(secret: &str, timestamp_ms: i64, nonce: &str, body: &[u8]) -> String {
    hmac_hex(secret.as_bytes(), &signing_payload(timestamp_ms, nonce, body))
}

/// Produce the three signature headers for an outbound webhook forward.
pub fn outbound_signature(secret: &str, body: &[u8], now_ms: i64) -> [(&'static str, String); 3] {
    let nonce = ulid::Ulid::new().to_string().to_lowercase();
    let signature = sign_request(secret, now_ms, &nonce, body);
    [
        (headers::TIMESTAMP, now_ms.to_string()),
        (headers::NONCE, nonce),
        (headers::SIGNATURE, signature),
    ]
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ============================================================================
// SecurityGuard
// ============================================================================

struct RateWindow {
    minute: i64,
    count: u32,
}

/// Shared mutable security state: nonce windows and rate-limit counters.
#[derive(Default)]
pub struct SecurityGuard {
    /// scope -> nonce -> first-seen timestamp (ms).
    nonces: DashMap<String, HashMap<String, i64>>,
    /// `scope:identity` -> fixed-window counter.
    windows: DashMap<String, RateWindow>,
}

impl SecurityGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify the signature headers of a request against its raw body.
    ///
    /// With no headers present and signatures not required, the request
    /// passes. When a secret is configured, present headers are always
    /// verified, even if signatures are optional.
    pub fn verify_request(
        &self,
        cfg: &ResolvedSecurity,
        scope: &str,
        request_headers: &HeaderMap,
        body: &[u8],
        now_ms: i64,
    ) -> ApiResult<()> {
        let timestamp = header_str(request_headers, headers::TIMESTAMP);
        let nonce = header_str(request_headers, headers::NONCE);
        let signature = header_str(request_headers, headers::SIGNATURE);

        let (timestamp, nonce, signature) = match (timestamp, nonce, signature) {
            (Some(t), Some(n), Some(s)) => (t, n, s),
            (None, None, None) if !cfg.require_signature => return Ok(()),
            _ => {
                return Err(ApiError::Unauthorized(
                    "signature headers missing or incomplete".into(),
                ));
            }
        };

        let Some(secret) = cfg.hmac_secret.as_deref() else {
            return Err(ApiError::Unauthorized(
                "signed request received but no signing secret is configured".into(),
            ));
        };

        let timestamp_ms: i64 = timestamp
            .parse()
            .map_err(|_| ApiError::Unauthorized("malformed signature timestamp".into()))?;
        if (now_ms - timestamp_ms).abs() > cfg.timestamp_skew_ms {
            return Err(ApiError::Unauthorized(
                "signature timestamp outside freshness window".into(),
            ));
        }

        self.note_nonce(scope, nonce, now_ms, cfg.timestamp_skew_ms)?;

        let expected = sign_request(secret, timestamp_ms, nonce, body);
        if !constant_time_eq(&expected, signature) {
            return Err(ApiError::Unauthorized("signature mismatch".into()));
        }
        Ok(())
    }

    /// Record a nonce for a scope, rejecting reuse within the TTL window.
    /// Expired entries for the scope are pruned on each check.
    fn note_nonce(&self, scope: &str, nonce: &str, now_ms: i64, ttl_ms: i64) -> ApiResult<()> {
        let mut scoped = self.nonces.entry(scope.to_string()).or_default();
        scoped.retain(|_, seen| now_ms - *seen <= ttl_ms);
        if scoped.contains_key(nonce) {
            return Err(ApiError::ReplayDetected(format!(
                "nonce already used in scope {scope}"
            )));
        }
        scoped.insert(nonce.to_string(), now_ms);
        Ok(())
    }

    /// Fixed-window rate limit: at most `limit` requests per key per minute.
    pub fn check_rate(&self, key: &str, limit: u32, now_ms: i64) -> ApiResult<()> {
        let minute = now_ms.div_euclid(60_000);
        let mut window = self.windows.entry(key.to_string()).or_insert(RateWindow {
            minute,
            count: 0,
        });
        if window.minute != minute {
            window.minute = minute;
            window.count = 0;
        }
        window.count += 1;
        if window.count > limit {
            return Err(ApiError::TooManyRequests(format!(
                "rate limit exceeded for {key}"
            )));
        }
        Ok(())
    }
}

fn header_str<'a>(map: &'a HeaderMap, name: &str) -> Option<&'a str> {
    map.get(name).and_then(|v| v.to_str().ok())
}

// ============================================================================
// Client IP resolution
// ============================================================================

/// Resolve the client IP, optionally trusting the first `X-Forwarded-For`
/// entry, falling back to the socket peer address.
pub fn client_ip(
    request_headers: &HeaderMap,
    remote: Option<std::net::SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<String> {
    if trust_forwarded_for
        && let Some(forwarded) = header_str(request_headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    remote.map(|addr| addr.ip().to_string())
}

/// Exact-match (or wildcard) allow-list check. `None` allows everything; an
/// unknown client IP only passes an unrestricted list.
pub fn ip_allowed(allowed: Option<&[String]>, ip: Option<&str>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let Some(ip) = ip else {
        return false;
    };
    allowed.iter().any(|entry| entry == "*" || entry == ip)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Tests
// ============================================================================
