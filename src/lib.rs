//! # confab — ephemeral passphrase-gated chat relay
//!
//! Rooms are created with a shared passphrase and identified by an opaque
//! id. Everything lives in process memory: when the last member leaves, the
//! room and its history are gone; when an admin rotates the passphrase, the
//! history is purged and every non-admin session is evicted.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    WebSocket     ┌─────────────────┐
//! │ ChatClient │ ◄───────────────► │ ChatServer      │
//! │ (per user) │   JSON envelopes  │                 │
//! └────────────┘                   │  SessionEngine  │ per-room locking
//!                                  │   ├ RoomStore   │ argon2 verifiers
//!                                  │   ├ Membership  │
//!                                  │   ├ MessageLog  │
//!                                  │   └ Registry    │ fan-out queues
//!                                  │  LivenessMonitor│ ping sweep
//!                                  └─────────────────┘
//! ```
//!
//! Message content is opaque ciphertext: clients encrypt end-to-end and the
//! relay only stores and forwards.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope types for both directions
//! - [`store`] — in-memory rooms, membership and message history
//! - [`registry`] — live connection handles and room fan-out
//! - [`session`] — the join/send/rotate/leave state machine
//! - [`liveness`] — heartbeat sweep over all connections
//! - [`api`] — room creation/verification boundary
//! - [`server`] — WebSocket accept loop and per-connection tasks
//! - [`client`] — protocol-level client used by the integration tests

pub mod api;
pub mod client;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use api::{
    ApiError, CreateRoomRequest, CreateRoomResponse, RoomApi, VerifyRoomRequest,
    VerifyRoomResponse, MIN_PASSPHRASE_LEN,
};
pub use client::{ChatClient, ClientEvent, ConnectionState};
pub use liveness::spawn_liveness_monitor;
pub use protocol::{
    ClientEnvelope, ProtocolError, RosterEntry, ServerEnvelope, WireMessage,
};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound, RegistryStats};
pub use server::{ChatServer, ServerConfig, ServerStats};
pub use session::{SessionEngine, SessionError, SessionState};
pub use store::{MembershipStore, MessageLog, Room, RoomStore, StoredMessage, User};
