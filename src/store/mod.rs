//! Process-lifetime in-memory state.
//!
//! ```text
//! ┌──────────────┐   owns rooms    ┌──────────────┐
//! │ RoomStore    │ ──────────────► │ Room         │
//! └──────────────┘                 │  verifier    │  argon2, one-way
//! ┌──────────────┐   gated by room └──────────────┘
//! │ MembershipStore │ ───────────► User (unique name per room)
//! └──────────────┘
//! ┌──────────────┐   purged on rotation / deletion
//! │ MessageLog   │ ───────────► append-only per-room buffer
//! └──────────────┘
//! ```
//!
//! Nothing here touches disk — a restart loses every room. All mutation is
//! driven by the session engine, which serializes operations per room; the
//! stores themselves only guarantee internal consistency of each map.

pub mod members;
pub mod messages;
pub mod rooms;

pub use members::{MembershipStore, User};
pub use messages::{MessageLog, StoredMessage};
pub use rooms::{Room, RoomStore, VerifierError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds. Used for relative ordering only.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
