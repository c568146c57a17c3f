//! Live connection registry: userId → transport handle.
//!
//! The registry is the single source of truth for "is this user currently
//! reachable". Membership may briefly outlive the handle during teardown (or
//! the reverse, mid-join); callers tolerate the gap instead of assuming the
//! two stores move in lockstep.
//!
//! Each handle wraps a bounded mpsc channel drained by that connection's
//! writer task. Frames are encoded once per broadcast and shared as
//! `Arc<String>` across receivers. A receiver that falls behind drops frames
//! rather than stalling the whole room; drops are counted, lock-free, the
//! way the broadcast stats are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerEnvelope;

/// Frames handed to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Pre-encoded JSON envelope to send as a text frame.
    Frame(Arc<String>),
    /// WebSocket-level ping (liveness sweep).
    Ping,
    /// Reply to a client's WebSocket-level ping.
    Pong(Vec<u8>),
    /// Send a close frame and stop the writer.
    Close,
}

/// One live connection. Owned by the registry while registered; the writer
/// task holds the receiving end of `outbound`.
pub struct ConnectionHandle {
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub display_name: String,
    outbound: mpsc::Sender<Outbound>,
    /// Set on pong, cleared by each liveness sweep.
    alive: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(
        user_id: Uuid,
        room_id: Uuid,
        display_name: impl Into<String>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            user_id,
            room_id,
            display_name: display_name.into(),
            outbound,
            // A fresh connection has not been pinged yet — it survives the
            // first sweep.
            alive: AtomicBool::new(true),
        }
    }

    /// Queue a pre-encoded frame. `false` means the frame was dropped
    /// (buffer full or connection gone).
    pub fn send_frame(&self, frame: Arc<String>) -> bool {
        self.outbound.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Queue a ping for the liveness sweep.
    pub fn ping(&self) -> bool {
        self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Ask the writer to close the socket.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Outbound::Close);
    }

    /// A clone of the outbound sender, for the deferred eviction close.
    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the liveness flag. Returns the value before clearing.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// Registry statistics (lock-free counters).
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub connected: usize,
}

/// The connection registry. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        self.conns.write().await.insert(handle.user_id, handle);
    }

    /// Idempotent. Returns the handle so callers can close it.
    pub async fn unregister(&self, user_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.conns.write().await.remove(&user_id)
    }

    pub async fn lookup(&self, user_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.conns.read().await.get(&user_id).cloned()
    }

    /// Send one envelope to one user. Encodes per call.
    pub async fn send_to(&self, user_id: Uuid, envelope: &ServerEnvelope) -> bool {
        let Some(handle) = self.lookup(user_id).await else {
            return false;
        };
        let Ok(frame) = envelope.encode() else {
            log::error!("failed to encode envelope for {user_id}");
            return false;
        };
        self.count(handle.send_frame(Arc::new(frame)))
    }

    /// Fan an envelope out to every connection in `room_id`, except
    /// `exclude`. Encodes once; returns how many connections accepted it.
    pub async fn broadcast_to_room(
        &self,
        room_id: Uuid,
        envelope: &ServerEnvelope,
        exclude: Option<Uuid>,
    ) -> usize {
        let Ok(frame) = envelope.encode() else {
            log::error!("failed to encode broadcast for room {room_id}");
            return 0;
        };
        let frame = Arc::new(frame);

        let conns = self.conns.read().await;
        let mut delivered = 0;
        for handle in conns.values() {
            if handle.room_id != room_id {
                continue;
            }
            if exclude == Some(handle.user_id) {
                continue;
            }
            if self.count(handle.send_frame(frame.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn handles_in_room(&self, room_id: Uuid) -> Vec<Arc<ConnectionHandle>> {
        self.conns
            .read()
            .await
            .values()
            .filter(|h| h.room_id == room_id)
            .cloned()
            .collect()
    }

    pub async fn all_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.conns.read().await.values().cloned().collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connected: self.connected_count().await,
        }
    }

    fn count(&self, sent: bool) -> bool {
        if sent {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(room: Uuid, name: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(ConnectionHandle::new(Uuid::new_v4(), room, name, tx)),
            rx,
        )
    }

    fn decode(out: Outbound) -> ServerEnvelope {
        match out {
            Outbound::Frame(json) => ServerEnvelope::decode(&json).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let (h, _rx) = handle(room, "Alice");
        let id = h.user_id;

        registry.register(h).await;
        assert!(registry.lookup(id).await.is_some());
        assert_eq!(registry.connected_count().await, 1);

        assert!(registry.unregister(id).await.is_some());
        assert!(registry.lookup(id).await.is_none());
        assert!(registry.unregister(id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_other_rooms() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let other_room = Uuid::new_v4();

        let (alice, mut alice_rx) = handle(room, "Alice");
        let (bob, mut bob_rx) = handle(room, "Bob");
        let (eve, mut eve_rx) = handle(other_room, "Eve");
        let alice_id = alice.user_id;

        registry.register(alice).await;
        registry.register(bob).await;
        registry.register(eve).await;

        let env = ServerEnvelope::UserJoined {
            user_id: alice_id,
            display_name: "Alice".into(),
        };
        let delivered = registry.broadcast_to_room(room, &env, Some(alice_id)).await;
        assert_eq!(delivered, 1);

        assert_eq!(decode(bob_rx.try_recv().unwrap()), env);
        assert!(alice_rx.try_recv().is_err());
        assert!(eve_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_user() {
        let registry = ConnectionRegistry::new();
        let sent = registry
            .send_to(Uuid::new_v4(), &ServerEnvelope::ClearHistory)
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_backpressure_drops_are_counted() {
        let registry = ConnectionRegistry::new();
        let room = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        let h = Arc::new(ConnectionHandle::new(Uuid::new_v4(), room, "Slow", tx));
        let id = h.user_id;
        registry.register(h).await;

        assert!(registry.send_to(id, &ServerEnvelope::ClearHistory).await);
        // Buffer of 1 is now full; the next frame is dropped, not awaited.
        assert!(!registry.send_to(id, &ServerEnvelope::ClearHistory).await);

        let stats = registry.stats().await;
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_liveness_flag() {
        let room = Uuid::new_v4();
        let (h, _rx) = handle(room, "Alice");

        assert!(h.take_alive());
        assert!(!h.take_alive());
        h.mark_alive();
        assert!(h.take_alive());
    }
}
