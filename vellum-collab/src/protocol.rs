//! Binary wire protocol between clients and the relay.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded
//! event:
//! ```text
//! client ──► relay   ClientEvent  (JoinRoom, ServerBroadcast, ServerVolatileBroadcast,
//!                                  UserFollow, Ping)
//! relay  ──► client  ServerEvent  (InitRoom, FirstInRoom, NewUser, RoomUserChange,
//!                                  ClientBroadcast, UserFollowRoomChange,
//!                                  BroadcastUnfollow, Pong)
//! ```
//!
//! Broadcast payloads travel as [`EncryptedPayload`]: ciphertext plus the
//! 96-bit nonce it was sealed with. The relay copies them verbatim.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Length of an AES-GCM nonce in bytes.
pub const IV_LEN: usize = 12;

/// Relay-assigned connection identity.
pub type ConnectionId = Uuid;

pub type RoomId = String;

/// Opaque payload as relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowAction {
    Follow,
    Unfollow,
}

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
    },
    /// Reliable fan-out to the rest of the room.
    ServerBroadcast {
        room_id: RoomId,
        payload: EncryptedPayload,
    },
    /// Best-effort fan-out; may be dropped for congested recipients.
    ServerVolatileBroadcast {
        room_id: RoomId,
        payload: EncryptedPayload,
    },
    UserFollow {
        target: ConnectionId,
        action: FollowAction,
    },
    Ping,
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// First frame on every connection: the id the relay assigned.
    InitRoom { connection_id: ConnectionId },
    FirstInRoom,
    NewUser { connection_id: ConnectionId },
    RoomUserChange { members: Vec<ConnectionId> },
    ClientBroadcast { payload: EncryptedPayload },
    UserFollowRoomChange { followers: Vec<ConnectionId> },
    BroadcastUnfollow,
    Pong,
}

impl ClientEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::DeserializationError(format!(
            "{} trailing bytes after frame",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Payload codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),
}
