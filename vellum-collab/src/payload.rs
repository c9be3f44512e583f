//! Typed plaintext carried inside encrypted broadcasts.

use serde::{Deserialize, Serialize};
use vellum_core::Delta;

use crate::codec::{CodecError, PayloadCipher};
use crate::protocol::EncryptedPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserIdleState {
    Active,
    Away,
    Idle,
}

/// Peer-to-peer messages. Scene updates go reliable; pointer and idle
/// signals are meant for volatile delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenePayload {
    SceneUpdate {
        deltas: Vec<Delta>,
    },
    PointerUpdate {
        x: f32,
        y: f32,
        button: PointerButton,
        username: String,
    },
    IdleStatus {
        status: UserIdleState,
        username: String,
    },
}

impl ScenePayload {
    /// Serialize to JSON and encrypt.
    pub fn seal(&self, cipher: &PayloadCipher) -> Result<EncryptedPayload, CodecError> {
        let json = serde_json::to_vec(self).map_err(|e| CodecError::Malformed(e.to_string()))?;
        cipher.seal(&json)
    }

    /// Decrypt and parse. Authentication is checked before any parsing.
    pub fn open(cipher: &PayloadCipher, payload: &EncryptedPayload) -> Result<Self, CodecError> {
        let json = cipher.open(payload)?;
        serde_json::from_slice(&json).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Whether the payload tolerates best-effort delivery.
    pub fn is_volatile(&self) -> bool {
        !matches!(self, ScenePayload::SceneUpdate { .. })
    }
}
