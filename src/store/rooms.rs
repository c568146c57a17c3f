//! Room records and the passphrase verifier.
//!
//! The passphrase is never stored: `create` derives a salted argon2id hash
//! and only the hash is kept. Checking a candidate goes through the hash
//! library's verify function — there is no way to compare verifiers for
//! equality or recover the passphrase.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::now_millis;

/// A chat room. The whole record is destroyed when its last member leaves.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    /// PHC-format argon2id hash of the current passphrase.
    verifier: String,
    pub created_by: Uuid,
    pub created_at: u64,
}

/// Passphrase derivation failed. Argon2 errors carry no secret material,
/// but the detail is still kept out of client-facing messages.
#[derive(Debug, thiserror::Error)]
#[error("passphrase derivation failed: {0}")]
pub struct VerifierError(String);

/// Derive a fresh salted verifier for `passphrase`.
///
/// Deliberately a free function: rotation computes the new verifier *before*
/// entering the room's critical section, so the slow hash never serializes
/// other operations on the room.
pub fn derive_verifier(passphrase: &str) -> Result<String, VerifierError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(passphrase.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| VerifierError(e.to_string()))
}

/// In-memory room store. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct RoomStore {
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with a freshly derived verifier.
    pub async fn create(
        &self,
        name: impl Into<String>,
        passphrase: &str,
        created_by: Uuid,
    ) -> Result<Room, VerifierError> {
        let room = Room {
            id: Uuid::new_v4(),
            name: name.into(),
            verifier: derive_verifier(passphrase)?,
            created_by,
            created_at: now_millis(),
        };
        self.rooms.write().await.insert(room.id, room.clone());
        Ok(room)
    }

    pub async fn get(&self, id: Uuid) -> Option<Room> {
        self.rooms.read().await.get(&id).cloned()
    }

    /// Check a candidate passphrase. An absent room verifies as `false`.
    pub async fn verify_passphrase(&self, id: Uuid, candidate: &str) -> bool {
        let verifier = match self.rooms.read().await.get(&id) {
            Some(room) => room.verifier.clone(),
            None => return false,
        };
        // Read lock released before the slow verify.
        match PasswordHash::new(&verifier) {
            Ok(parsed) => Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Swap in a pre-derived verifier. Returns `false` if the room is gone.
    ///
    /// The caller (the rotation path) pairs this with the message-log purge
    /// inside one room critical section.
    pub async fn replace_verifier(&self, id: Uuid, verifier: String) -> bool {
        match self.rooms.write().await.get_mut(&id) {
            Some(room) => {
                room.verifier = verifier;
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        self.rooms.write().await.remove(&id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = RoomStore::new();
        let creator = Uuid::new_v4();
        let room = store.create("R1", "sesame1", creator).await.unwrap();

        let fetched = store.get(room.id).await.unwrap();
        assert_eq!(fetched.name, "R1");
        assert_eq!(fetched.created_by, creator);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_verifier_is_not_the_passphrase() {
        let store = RoomStore::new();
        let room = store.create("R1", "sesame1", Uuid::new_v4()).await.unwrap();
        let stored = store.get(room.id).await.unwrap();
        assert!(!stored.verifier.contains("sesame1"));
        assert!(stored.verifier.starts_with("$argon2"));
    }

    #[tokio::test]
    async fn test_verify_passphrase() {
        let store = RoomStore::new();
        let room = store.create("R1", "sesame1", Uuid::new_v4()).await.unwrap();

        assert!(store.verify_passphrase(room.id, "sesame1").await);
        assert!(!store.verify_passphrase(room.id, "wrong").await);
        assert!(!store.verify_passphrase(Uuid::new_v4(), "sesame1").await);
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_passphrase() {
        let store = RoomStore::new();
        let room = store.create("R1", "sesame1", Uuid::new_v4()).await.unwrap();

        let new_verifier = derive_verifier("opensesame2").unwrap();
        assert!(store.replace_verifier(room.id, new_verifier).await);

        assert!(!store.verify_passphrase(room.id, "sesame1").await);
        assert!(store.verify_passphrase(room.id, "opensesame2").await);
    }

    #[tokio::test]
    async fn test_replace_verifier_absent_room() {
        let store = RoomStore::new();
        let verifier = derive_verifier("whatever").unwrap();
        assert!(!store.replace_verifier(Uuid::new_v4(), verifier).await);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = RoomStore::new();
        let room = store.create("R1", "sesame1", Uuid::new_v4()).await.unwrap();

        assert!(store.delete(room.id).await);
        assert!(store.get(room.id).await.is_none());
        assert!(!store.delete(room.id).await);
    }

    #[test]
    fn test_salts_differ() {
        let a = derive_verifier("same").unwrap();
        let b = derive_verifier("same").unwrap();
        assert_ne!(a, b);
    }
}
