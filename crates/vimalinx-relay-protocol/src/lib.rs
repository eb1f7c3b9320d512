//! Wire types for the Vimalinx relay protocol.
//!
//! The relay bridges mobile chat clients and gateway host processes. Both
//! sides exchange the JSON shapes defined here, so gateway plugins can depend
//! on this crate without pulling in the server.
//!
//! Two message directions exist:
//!
//! - [`InboundMessage`]: client -> relay -> gateway (a chat message for an
//!   agent, stamped with mode metadata).
//! - [`OutboundEvent`]: gateway -> relay -> client (an outbox entry with a
//!   per-device monotonic event id, replayable after reconnect).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// HTTP header names
// ============================================================================

/// Header names used by the relay's signed-request scheme.
pub mod headers {
    /// Millisecond timestamp of the signed request.
    pub const TIMESTAMP: &str = "x-vimalinx-timestamp";
    /// Single-use nonce, unique within the freshness window.
    pub const NONCE: &str = "x-vimalinx-nonce";
    /// Hex-encoded HMAC-SHA256 signature.
    pub const SIGNATURE: &str = "x-vimalinx-signature";
    /// Optional user-id hint, scopes token verification to one account.
    pub const USER: &str = "x-vimalinx-user";
}

/// Build the byte string covered by a request signature.
///
/// The signature is `HMAC_SHA256(secret, "{timestamp_ms}.{nonce}.{raw_body}")`
/// over the raw request body, before any JSON decoding.
pub fn signing_payload(timestamp_ms: i64, nonce: &str, body: &[u8]) -> Vec<u8> {
    let mut buf = format!("{timestamp_ms}.{nonce}.").into_bytes();
    buf.extend_from_slice(body);
    buf
}

// ============================================================================
// Inbound messages (client -> gateway)
// ============================================================================

/// Conversation kind for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// Direct message (the default conversation with a bare user).
    #[default]
    Dm,
    /// Group conversation.
    Group,
}

/// Hint fields attached to an inbound message to steer agent behavior.
///
/// Either supplied by the client or derived from a stored instance config;
/// the derived form always wins when a config exists for the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills_hint: Option<String>,
}

/// A normalized chat message flowing from a client toward a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Server-assigned message id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Conversation id; `user:<id>` is the default conversation for a bare user.
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub chat_type: ChatType,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    /// Whether the agent was explicitly mentioned (group chats).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentioned: Option<bool>,
    /// Millisecond epoch timestamp.
    pub timestamp: i64,
    #[serde(flatten)]
    pub mode: ModeMetadata,
}

// ============================================================================
// Outbound events (gateway -> client)
// ============================================================================

/// One outbox entry: a payload plus its per-device-key monotonic event id.
///
/// Event ids start at 1 and strictly increase for the lifetime of the relay
/// process. Clients present the last id they saw to replay missed entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub event_id: u64,
    pub payload: serde_json::Value,
}

// ============================================================================
// Machines
// ============================================================================

/// Reachability status of a registered gateway machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

/// Per-machine routing overrides: mode id -> account / hint mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRouting {
    /// Mode id -> account id handling that mode on this machine.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub accounts: std::collections::HashMap<String, String>,
    /// Mode id -> hint override applied when routing through this machine.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub hints: std::collections::HashMap<String, String>,
}

impl MachineRouting {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.hints.is_empty()
    }
}

/// A gateway host process registered with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub machine_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,
    pub status: MachineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<MachineRouting>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_wire_shape() {
        let json = r#"{
            "chatId": "group:42",
            "chatType": "group",
            "senderId": "ana",
            "text": "hello",
            "timestamp": 1724300000000,
            "modeId": "inst_pro_writing"
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.chat_id, "group:42");
        assert_eq!(msg.chat_type, ChatType::Group);
        assert_eq!(msg.mode.mode_id.as_deref(), Some("inst_pro_writing"));
        assert!(msg.mode.model_hint.is_none());

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["chatId"], "group:42");
        assert_eq!(out["modeId"], "inst_pro_writing");
        // Empty optional hints stay off the wire.
        assert!(out.get("agentHint").is_none());
    }

    #[test]
    fn chat_type_defaults_to_dm() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"chatId":"user:ana","senderId":"ana","text":"hi","timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(msg.chat_type, ChatType::Dm);
    }

    #[test]
    fn signing_payload_layout() {
        let payload = signing_payload(1724300000000, "n-1", b"{\"a\":1}");
        assert_eq!(payload, b"1724300000000.n-1.{\"a\":1}".to_vec());
    }

    #[test]
    fn outbound_event_uses_camel_case() {
        let event = OutboundEvent {
            event_id: 7,
            payload: serde_json::json!({"text": "hi"}),
        };
        let out = serde_json::to_value(&event).unwrap();
        assert_eq!(out["eventId"], 7);
        assert_eq!(out["payload"]["text"], "hi");
    }
}
