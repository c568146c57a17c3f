//! Connected users, keyed by their client-generated id.
//!
//! A user's existence is gated by its room: the engine deletes memberships
//! when the room goes away, so the store never holds orphans for long. The
//! store itself only promises map consistency; atomicity of the
//! check-name-then-insert sequence comes from the engine's per-room lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::now_millis;

/// One room membership. Exactly one per live connection.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub room_id: Uuid,
    pub is_admin: bool,
    pub joined_at: u64,
    /// Store-assigned join sequence; gives listings a stable order even when
    /// two joins land on the same millisecond.
    pub seq: u64,
}

/// In-memory membership store. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MembershipStore {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
    join_seq: Arc<AtomicU64>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Name uniqueness must already have been checked by the
    /// caller inside the room's critical section.
    pub async fn add(
        &self,
        id: Uuid,
        display_name: impl Into<String>,
        room_id: Uuid,
        is_admin: bool,
    ) -> User {
        let user = User {
            id,
            display_name: display_name.into(),
            room_id,
            is_admin,
            joined_at: now_millis(),
            seq: self.join_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.users.write().await.insert(id, user.clone());
        user
    }

    pub async fn get(&self, id: Uuid) -> Option<User> {
        self.users.read().await.get(&id).cloned()
    }

    /// Members of a room in join order.
    pub async fn users_in_room(&self, room_id: Uuid) -> Vec<User> {
        let users = self.users.read().await;
        let mut found: Vec<User> = users
            .values()
            .filter(|u| u.room_id == room_id)
            .cloned()
            .collect();
        found.sort_by_key(|u| u.seq);
        found
    }

    /// Case-sensitive exact name lookup within a room.
    pub async fn find_by_name(&self, room_id: Uuid, display_name: &str) -> Option<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.room_id == room_id && u.display_name == display_name)
            .cloned()
    }

    /// Idempotent: removing an absent id is a no-op.
    pub async fn remove(&self, id: Uuid) -> Option<User> {
        self.users.write().await.remove(&id)
    }

    pub async fn count_in_room(&self, room_id: Uuid) -> usize {
        self.users
            .read()
            .await
            .values()
            .filter(|u| u.room_id == room_id)
            .count()
    }
}
