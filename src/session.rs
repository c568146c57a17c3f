//! Session protocol engine: the state machine behind join, send, rotate
//! and leave.
//!
//! ```text
//!               join_room ok
//! Unauthenticated ────────► Active ────────► Closed (terminal)
//!        │                    │   leave / disconnect / heartbeat timeout
//!        └── fatal error ─────┴──────────────────►
//! ```
//!
//! Every operation that touches the shared stores is serialized per room by
//! an async mutex, so two concurrent joins cannot race the name-uniqueness
//! check and a rotation cannot interleave with an in-flight send. Slow work
//! (argon2) runs outside the critical section. Because all outbound frames
//! for a room are enqueued while its lock is held, per-connection delivery
//! order equals append order, and a joiner's history replay is queued before
//! any broadcast that follows the join.
//!
//! The engine is the only component that mutates the stores. The transport
//! layer funnels explicit leaves, socket closes and heartbeat timeouts into
//! the one idempotent [`SessionEngine::teardown`] path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{RosterEntry, ServerEnvelope};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::store::{rooms, MembershipStore, MessageLog, RoomStore, User};

/// Per-connection protocol state. A reconnecting client never reuses a
/// connection object; it starts over at `Unauthenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Active { user_id: Uuid, room_id: Uuid },
    Closed,
}

/// Errors surfaced to a connection while processing an envelope.
///
/// Fatal variants end the session (the client discards it and returns to the
/// entry screen); the rest are transient notices and the connection stays
/// active.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Invalid passphrase")]
    InvalidPassphrase,
    #[error("Username already taken in this room")]
    NameTaken,
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Protocol(String),
    #[error("Internal server error")]
    Internal,
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound | Self::InvalidPassphrase | Self::NameTaken
        )
    }
}

/// The engine. One instance per server, shared across connections.
pub struct SessionEngine {
    rooms: RoomStore,
    members: MembershipStore,
    messages: MessageLog,
    registry: ConnectionRegistry,
    /// Per-room serialization locks, created on demand and dropped with the
    /// room.
    room_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Pending eviction closes, aborted if the connection dies first.
    deferred_closes: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Delay between `passphrase_changed` and severing an evicted
    /// connection, so the notification can flush.
    grace: Duration,
}

impl SessionEngine {
    pub fn new(
        rooms: RoomStore,
        members: MembershipStore,
        messages: MessageLog,
        registry: ConnectionRegistry,
        grace: Duration,
    ) -> Self {
        Self {
            rooms,
            members,
            messages,
            registry,
            room_locks: Mutex::new(HashMap::new()),
            deferred_closes: Mutex::new(HashMap::new()),
            grace,
        }
    }

    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    pub fn members(&self) -> &MembershipStore {
        &self.members
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    async fn room_lock(&self, room_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.room_locks.lock().await;
            locks
                .entry(room_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Join a room. Valid only from `Unauthenticated`; the caller transitions
    /// to `Active` on success.
    ///
    /// The admin flag is accepted as the client presented it: knowing the
    /// passphrase is the only gate, and admin status is not derived from
    /// room creatorship. Tightening that would change the authorization
    /// model, so it is left to the operator to decide (see DESIGN.md).
    pub async fn join(
        &self,
        outbound: mpsc::Sender<Outbound>,
        room_id: Uuid,
        display_name: String,
        passphrase: &str,
        user_id: Uuid,
        is_admin: bool,
    ) -> Result<User, SessionError> {
        // Cheap rejections first, in the order clients observe them:
        // duplicate name, missing room, then the slow passphrase check —
        // all before the room lock so argon2 never serializes the room.
        if self.members.find_by_name(room_id, &display_name).await.is_some() {
            return Err(SessionError::NameTaken);
        }
        if self.rooms.get(room_id).await.is_none() {
            return Err(SessionError::RoomNotFound);
        }
        if !self.rooms.verify_passphrase(room_id, passphrase).await {
            return Err(SessionError::InvalidPassphrase);
        }

        let _guard = self.room_lock(room_id).await;

        // The room may have emptied and self-destructed while we hashed.
        if self.rooms.get(room_id).await.is_none() {
            return Err(SessionError::RoomNotFound);
        }
        // Re-check the name under the lock: this is what makes
        // check-then-insert atomic against a concurrent join.
        if self.members.find_by_name(room_id, &display_name).await.is_some() {
            return Err(SessionError::NameTaken);
        }

        let user = self
            .members
            .add(user_id, display_name.clone(), room_id, is_admin)
            .await;
        let handle = Arc::new(ConnectionHandle::new(
            user_id,
            room_id,
            display_name.clone(),
            outbound,
        ));
        self.registry.register(handle.clone()).await;

        // Replay full history to the joiner only. Enqueued under the room
        // lock, so it lands ahead of any broadcast that follows this join.
        for msg in self.messages.messages_in_room(room_id).await {
            if let Ok(frame) = ServerEnvelope::MessageBroadcast(msg.to_wire()).encode() {
                handle.send_frame(Arc::new(frame));
            }
        }

        self.registry
            .broadcast_to_room(
                room_id,
                &ServerEnvelope::UserJoined {
                    user_id,
                    display_name: display_name.clone(),
                },
                Some(user_id),
            )
            .await;
        self.broadcast_roster(room_id).await;

        log::info!("{display_name} ({user_id}) joined room {room_id}");
        Ok(user)
    }

    /// Relay a message to the room, sender included (clients rely on the
    /// echo for consistent local ordering).
    pub async fn send_chat(
        &self,
        session_user: Uuid,
        room_id: Uuid,
        user_id: Uuid,
        content: String,
    ) -> Result<(), SessionError> {
        if user_id != session_user {
            // The envelope names a different user than the one this
            // connection authenticated as.
            return Err(SessionError::Unauthorized("Unauthorized"));
        }

        let _guard = self.room_lock(room_id).await;

        let user = match self.members.get(user_id).await {
            Some(u) if u.room_id == room_id => u,
            _ => return Err(SessionError::Unauthorized("Unauthorized")),
        };

        let stored = self
            .messages
            .append(room_id, user_id, &user.display_name, content)
            .await;
        self.registry
            .broadcast_to_room(
                room_id,
                &ServerEnvelope::MessageBroadcast(stored.to_wire()),
                None,
            )
            .await;
        Ok(())
    }

    /// Rotate the room passphrase: swap the verifier and purge history as
    /// one atomic pair, notify everyone, then evict all non-admin members.
    pub async fn rotate_passphrase(
        &self,
        session_user: Uuid,
        room_id: Uuid,
        user_id: Uuid,
        new_passphrase: &str,
    ) -> Result<(), SessionError> {
        if user_id != session_user {
            return Err(SessionError::Unauthorized("Unauthorized - Admin only"));
        }
        match self.members.get(user_id).await {
            Some(u) if u.room_id == room_id && u.is_admin => {}
            _ => return Err(SessionError::Unauthorized("Unauthorized - Admin only")),
        }

        // Derive the new verifier before entering the critical section.
        let verifier = rooms::derive_verifier(new_passphrase).map_err(|e| {
            log::error!("verifier derivation failed for room {room_id}: {e}");
            SessionError::Internal
        })?;

        let _guard = self.room_lock(room_id).await;

        // The admin could have been torn down while we hashed.
        match self.members.get(user_id).await {
            Some(u) if u.room_id == room_id && u.is_admin => {}
            _ => return Err(SessionError::Unauthorized("Unauthorized - Admin only")),
        }
        if !self.rooms.replace_verifier(room_id, verifier).await {
            return Err(SessionError::Internal);
        }
        // Paired with the verifier swap under the same lock: a rotation that
        // updated the verifier but left history behind must be impossible.
        self.messages.clear(room_id).await;

        let members = self.members.users_in_room(room_id).await;

        // History is gone for everyone, the admin's own view included.
        for member in &members {
            self.registry
                .send_to(member.id, &ServerEnvelope::ClearHistory)
                .await;
        }

        for member in &members {
            if member.is_admin {
                continue;
            }
            self.registry
                .send_to(member.id, &ServerEnvelope::PassphraseChanged)
                .await;
            // Authoritative state reflects the eviction immediately; only
            // the socket close itself is deferred.
            self.members.remove(member.id).await;
            if let Some(handle) = self.registry.unregister(member.id).await {
                self.schedule_deferred_close(member.id, handle.sender()).await;
            }
            log::info!(
                "evicted {} ({}) from room {room_id} after rotation",
                member.display_name,
                member.id
            );
        }

        self.broadcast_roster(room_id).await;
        log::info!("room {room_id} passphrase rotated by {user_id}");
        Ok(())
    }

    /// The one shared teardown path for explicit leaves, transport closes
    /// and heartbeat timeouts. Idempotent: a second call for the same user
    /// finds no membership and does nothing further.
    pub async fn teardown(&self, user_id: Uuid) {
        self.abort_deferred_close(user_id).await;

        let Some(user) = self.members.get(user_id).await else {
            // Already evicted or never joined; drop any registry remnant.
            if let Some(handle) = self.registry.unregister(user_id).await {
                handle.close();
            }
            return;
        };
        let room_id = user.room_id;

        let _guard = self.room_lock(room_id).await;

        // Another teardown may have won while we waited for the lock.
        let Some(user) = self.members.remove(user_id).await else {
            if let Some(handle) = self.registry.unregister(user_id).await {
                handle.close();
            }
            return;
        };
        if let Some(handle) = self.registry.unregister(user_id).await {
            handle.close();
        }

        self.registry
            .broadcast_to_room(
                room_id,
                &ServerEnvelope::UserLeft {
                    user_id,
                    display_name: user.display_name.clone(),
                },
                None,
            )
            .await;
        self.broadcast_roster(room_id).await;

        log::info!("{} ({user_id}) left room {room_id}", user.display_name);

        // Last one out closes the door: rooms are self-expiring.
        if self.members.count_in_room(room_id).await == 0 {
            log::info!("room {room_id} is empty, deleting");
            self.rooms.delete(room_id).await;
            self.messages.remove_room(room_id).await;
            self.room_locks.lock().await.remove(&room_id);
        }
    }

    /// Record a heartbeat answer from this user's connection.
    pub async fn mark_alive(&self, user_id: Uuid) {
        if let Some(handle) = self.registry.lookup(user_id).await {
            handle.mark_alive();
        }
    }

    /// One liveness pass: terminate every connection that did not answer the
    /// previous sweep's ping, then ping the rest. Returns the number of
    /// connections terminated.
    pub async fn sweep_connections(&self) -> usize {
        let mut terminated = 0;
        for handle in self.registry.all_handles().await {
            if handle.take_alive() {
                handle.ping();
            } else {
                log::warn!(
                    "connection {} missed heartbeat, terminating",
                    handle.user_id
                );
                handle.close();
                self.teardown(handle.user_id).await;
                terminated += 1;
            }
        }
        terminated
    }

    async fn broadcast_roster(&self, room_id: Uuid) {
        let users = self
            .members
            .users_in_room(room_id)
            .await
            .into_iter()
            .map(|u| RosterEntry {
                user_id: u.id,
                display_name: u.display_name,
                is_admin: u.is_admin,
                joined_at: u.joined_at,
            })
            .collect();
        self.registry
            .broadcast_to_room(room_id, &ServerEnvelope::UserListUpdate { users }, None)
            .await;
    }

    async fn schedule_deferred_close(&self, user_id: Uuid, sender: mpsc::Sender<Outbound>) {
        let grace = self.grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // If the connection already closed on its own the channel is
            // gone and this is a no-op.
            let _ = sender.try_send(Outbound::Close);
        });
        if let Some(old) = self.deferred_closes.lock().await.insert(user_id, task) {
            old.abort();
        }
    }

    async fn abort_deferred_close(&self, user_id: Uuid) {
        if let Some(task) = self.deferred_closes.lock().await.remove(&user_id) {
            task.abort();
        }
    }
}
