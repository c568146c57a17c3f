//! Room creation and verification boundary.
//!
//! The two request/response operations exposed to whatever outer surface
//! fronts the relay (typically an HTTP facade; that surface lives outside
//! this crate). They share the room store with the session engine and carry
//! no session state of their own.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::RoomStore;

/// Passphrases shorter than this are rejected at creation.
pub const MIN_PASSPHRASE_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_name: String,
    pub passphrase: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: Uuid,
    pub room_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRoomRequest {
    pub room_id: Uuid,
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRoomResponse {
    pub valid: bool,
    pub room_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing required fields")]
    MissingField,
    #[error("Passphrase must be at least {MIN_PASSPHRASE_LEN} characters")]
    PassphraseTooShort,
    #[error("Room not found")]
    RoomNotFound,
    #[error("Failed to create room")]
    Internal,
}

/// The collaborator-facing room API.
#[derive(Clone)]
pub struct RoomApi {
    rooms: RoomStore,
}

impl RoomApi {
    pub fn new(rooms: RoomStore) -> Self {
        Self { rooms }
    }

    /// Create a room. The typed request cannot carry absent fields, so empty
    /// strings count as missing.
    pub async fn create(&self, req: CreateRoomRequest) -> Result<CreateRoomResponse, ApiError> {
        if req.room_name.is_empty() || req.passphrase.is_empty() {
            return Err(ApiError::MissingField);
        }
        if req.passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(ApiError::PassphraseTooShort);
        }

        let room = self
            .rooms
            .create(req.room_name, &req.passphrase, req.created_by)
            .await
            .map_err(|e| {
                log::error!("room creation failed: {e}");
                ApiError::Internal
            })?;

        log::info!("created room {} ({})", room.id, room.name);
        Ok(CreateRoomResponse {
            room_id: room.id,
            room_name: room.name,
        })
    }

    /// Check a candidate passphrase against an existing room.
    pub async fn verify(&self, req: VerifyRoomRequest) -> Result<VerifyRoomResponse, ApiError> {
        if req.passphrase.is_empty() {
            return Err(ApiError::MissingField);
        }
        let room = self
            .rooms
            .get(req.room_id)
            .await
            .ok_or(ApiError::RoomNotFound)?;

        let valid = self.rooms.verify_passphrase(req.room_id, &req.passphrase).await;
        Ok(VerifyRoomResponse {
            valid,
            room_name: room.name,
        })
    }
}
