//! Per-room append-only message history.
//!
//! Append order is delivery order, so the buffer is a plain `Vec` per room —
//! no sorting on read. The log only ever holds real user messages: the
//! synthetic join/leave notices the engine broadcasts are ephemeral and are
//! never appended here, so history replay never contains them.
//!
//! `clear` is crate-internal on purpose — only the rotation and room
//! deletion paths may purge history.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::now_millis;
use crate::protocol::WireMessage;

/// A logged message. `content` is opaque ciphertext.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub content: String,
    pub timestamp: u64,
}

impl StoredMessage {
    /// Wire representation. Logged messages are never system notices.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id,
            room_id: self.room_id,
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            is_system: false,
        }
    }
}

/// In-memory message log. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MessageLog {
    messages: Arc<RwLock<HashMap<Uuid, Vec<StoredMessage>>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a user message, assigning id and timestamp.
    pub async fn append(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        display_name: impl Into<String>,
        content: impl Into<String>,
    ) -> StoredMessage {
        let message = StoredMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            display_name: display_name.into(),
            content: content.into(),
            timestamp: now_millis(),
        };
        self.messages
            .write()
            .await
            .entry(room_id)
            .or_default()
            .push(message.clone());
        message
    }

    /// Full history in append order.
    pub async fn messages_in_room(&self, room_id: Uuid) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self, room_id: Uuid) -> usize {
        self.messages
            .read()
            .await
            .get(&room_id)
            .map_or(0, Vec::len)
    }

    /// Purge a room's history in place. Rotation path only.
    pub(crate) async fn clear(&self, room_id: Uuid) {
        if let Some(buf) = self.messages.write().await.get_mut(&room_id) {
            buf.clear();
        }
    }

    /// Drop the room's buffer entirely. Room deletion path only.
    pub(crate) async fn remove_room(&self, room_id: Uuid) {
        self.messages.write().await.remove(&room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let log = MessageLog::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        log.append(room, user, "Alice", "m1").await;
        log.append(room, user, "Alice", "m2").await;
        log.append(room, user, "Alice", "m3").await;

        let contents: Vec<String> = log
            .messages_in_room(room)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let log = MessageLog::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let user = Uuid::new_v4();

        log.append(a, user, "Alice", "for-a").await;
        assert_eq!(log.len(a).await, 1);
        assert_eq!(log.len(b).await, 0);
        assert!(log.messages_in_room(b).await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let log = MessageLog::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        log.append(room, user, "Alice", "m1").await;
        log.clear(room).await;
        assert!(log.messages_in_room(room).await.is_empty());

        log.append(room, user, "Alice", "m2").await;
        log.remove_room(room).await;
        assert_eq!(log.len(room).await, 0);
    }

    #[tokio::test]
    async fn test_wire_conversion() {
        let log = MessageLog::new();
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();

        let stored = log.append(room, user, "Alice", "cipher").await;
        let wire = stored.to_wire();
        assert_eq!(wire.id, stored.id);
        assert_eq!(wire.content, "cipher");
        assert!(!wire.is_system);
    }
}
