//! Binary wire protocol for board synchronization.
//!
//! Every frame on the transport is one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ board_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ 8 bytes  │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Document deltas travel opaque in the payload (yrs update v1 bytes); the
//! envelope only routes them. Awareness and peer metadata payloads are
//! themselves bincode-encoded structs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessState;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector from a client requesting a catch-up diff
    SyncStep1 = 1,
    /// Full state or diff response; first message a joining peer receives
    SyncStep2 = 2,
    /// Incremental CRDT delta
    Delta = 3,
    /// Ephemeral presence update (cursor, selection, identity)
    Awareness = 4,
    /// Peer joined the room
    PeerJoined = 5,
    /// Peer left the room
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Identity of one connected peer.
///
/// `peer_id` identifies the connection; `user_id` identifies the account
/// behind it. One user with two tabs open is two peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
    /// CSS color for cursor/selection rendering, derived from `user_id`
    pub color: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with an explicit peer_id (tests pin these).
    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = crate::awareness::color_for_user(&user_id);
        Self {
            peer_id,
            user_id,
            name: name.into(),
            color,
        }
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode; a typical delta frame is ~41 bytes of header
/// plus the yrs update payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub board_id: Uuid,
    /// Per-connection sequence number, for diagnostics only. Merge
    /// correctness never depends on it.
    pub clock: u64,
    /// Payload, interpreted per `msg_type`
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Incremental document delta.
    pub fn delta(peer_id: Uuid, board_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            board_id,
            clock,
            payload: update,
        }
    }

    /// Sync step 1: client presents its state vector.
    pub fn sync_step1(peer_id: Uuid, board_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            board_id,
            clock: 0,
            payload: state_vector,
        }
    }

    /// Sync step 2: full state or diff catch-up.
    pub fn sync_step2(peer_id: Uuid, board_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            board_id,
            clock: 0,
            payload: state_diff,
        }
    }

    /// Presence update carrying the sender's full awareness state.
    pub fn awareness(peer_id: Uuid, board_id: Uuid, clock: u64, state: &AwarenessState) -> Self {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            board_id,
            clock,
            payload,
        }
    }

    /// Peer joined notification carrying the peer's identity.
    pub fn peer_joined(peer_id: Uuid, board_id: Uuid, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::PeerJoined,
            peer_id,
            board_id,
            clock: 0,
            payload,
        }
    }

    /// Peer left notification. Receivers drop the peer's awareness entry.
    pub fn peer_left(peer_id: Uuid, board_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            board_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            board_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            board_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an Awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }

    /// Parse a PeerJoined payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Wire-level protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "invalid message type for payload"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
