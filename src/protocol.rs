//! JSON envelope protocol between clients and the relay.
//!
//! Wire format: one JSON object per WebSocket text frame,
//! ```text
//! { "type": "<envelope kind>", "payload": { … } }
//! ```
//!
//! Both directions are closed tagged enums — an unknown `type` or a payload
//! that does not match its variant fails to decode and is answered with a
//! non-fatal protocol error instead of being passed through.
//!
//! Message `content` is opaque to the relay: clients encrypt end-to-end and
//! the server only ever stores and forwards the ciphertext string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelopes accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Authenticate into a room. Only valid on a connection that has not
    /// joined yet.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: Uuid,
        display_name: String,
        passphrase: String,
        /// Client-generated identity; passphrase knowledge is the only gate.
        user_id: Uuid,
        /// Accepted as presented — see the trust note on `session::SessionEngine::join`.
        is_admin: bool,
    },

    /// Relay an opaque message to the whole room (sender included).
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: Uuid,
        user_id: Uuid,
        content: String,
    },

    /// Admin-only: replace the room passphrase, purge history, evict
    /// non-admin members.
    #[serde(rename_all = "camelCase")]
    ChangePassphrase {
        room_id: Uuid,
        user_id: Uuid,
        new_passphrase: String,
    },

    /// Leave the room; the connection is closed once teardown completes.
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: Uuid, user_id: Uuid },
}

/// A message as it appears on the wire and in history replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    /// Opaque ciphertext — never parsed or mutated by the relay.
    pub content: String,
    /// Wall-clock milliseconds; relative ordering only.
    pub timestamp: u64,
    pub is_system: bool,
}

/// One roster entry in a `user_list_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_admin: bool,
    pub joined_at: u64,
}

/// Envelopes pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// A message relayed to the room — also used for history replay on join.
    MessageBroadcast(WireMessage),

    /// A peer joined the room (sent to everyone but the joiner).
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: Uuid, display_name: String },

    /// A peer left the room.
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: Uuid, display_name: String },

    /// Full membership roster, in join order.
    #[serde(rename_all = "camelCase")]
    UserListUpdate { users: Vec<RosterEntry> },

    /// History is gone for everyone — drop any locally cached messages.
    ClearHistory,

    /// The passphrase was rotated; this session is being evicted and must
    /// rejoin with the new passphrase.
    PassphraseChanged,

    /// Error report. `fatal: true` means the session is over and the client
    /// should return to its entry screen.
    #[serde(rename_all = "camelCase")]
    Error { message: String, fatal: bool },
}

impl ServerEnvelope {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error { message: message.into(), fatal }
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize a frame pushed by the server (client side).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ClientEnvelope {
    /// Serialize to a wire frame (client side).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize a frame received from a client.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
