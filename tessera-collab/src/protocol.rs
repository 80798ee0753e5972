//! Binary protocol for diagram synchronization.
//!
//! Every WebSocket binary frame is one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Join and bootstrap exchange:
//! ```text
//! client                                   relay
//!   │ ── PeerJoined(JoinRequest{vv?}) ──────▸ │  join room, load document
//!   │ ◂───────────── SyncStep2(state|diff) ── │
//!   │ ◂───────────── SyncStep1(relay vv) ──── │
//!   │ ── Update(diff the relay lacks) ──────▸ │
//!   │ ◂───────────── Ack{clock, durable} ──── │
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{AwarenessMessage, CursorColor};

/// Frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Version vector: "send me what I am missing".
    SyncStep1 = 1,
    /// Full state or diff answering a `SyncStep1` or a join.
    SyncStep2 = 2,
    /// Incremental update.
    Update = 3,
    /// Presence payload, relayed but never persisted.
    Awareness = 4,
    /// Join request from a client, or join notice from the relay.
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Durability report for one `Update`.
    Ack = 9,
    /// Relay refused a frame; payload is a UTF-8 reason.
    Error = 10,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor and selection rendering.
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id).to_array(),
        }
    }
}

/// Payload of `PeerJoined`.
///
/// Sent by a client to join; `version_vector` asks for a diff instead of the
/// full state. The relay forwards it to the room without the vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub peer: PeerInfo,
    pub version_vector: Option<Vec<u8>>,
}

/// Payload of `Ack`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    /// Clock of the acknowledged `Update`.
    pub clock: u64,
    /// Whether the update reached the persistence store.
    pub durable: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Lamport clock of the sender.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.into(),
            clock,
            payload,
        }
    }

    pub fn update(peer_id: Uuid, doc_id: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: impl Into<String>, version_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, version_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: impl Into<String>, state: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, state)
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: impl Into<String>,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, clock, message.encode()?))
    }

    pub fn join(doc_id: impl Into<String>, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PeerJoined,
            request.peer.peer_id,
            doc_id,
            0,
            encode_payload(request)?,
        ))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ack(peer_id: Uuid, doc_id: impl Into<String>, ack: AckPayload) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Ack, peer_id, doc_id, ack.clock, encode_payload(&ack)?))
    }

    pub fn error(peer_id: Uuid, doc_id: impl Into<String>, reason: &str) -> Self {
        Self::new(MessageType::Error, peer_id, doc_id, 0, reason.as_bytes().to_vec())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.ensure_type(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    pub fn ack_payload(&self) -> Result<AckPayload, ProtocolError> {
        self.ensure_type(MessageType::Ack)?;
        decode_payload(&self.payload)
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.ensure_type(MessageType::Awareness)?;
        AwarenessMessage::decode(&self.payload)
    }

    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.ensure_type(MessageType::Error)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn ensure_type(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                actual: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Offline queue full ({0} updates)")]
    QueueFull(usize),

    #[error("Rejected by relay: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Point;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(peer, "orders", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, "orders");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_request_roundtrip() {
        let request = JoinRequest {
            peer: PeerInfo::new("Alice"),
            version_vector: Some(vec![1, 0]),
        };
        let msg = SyncMessage::join("orders", &request).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        assert_eq!(decoded.peer_id, request.peer.peer_id);
        assert_eq!(decoded.join_request().unwrap(), request);
    }

    #[test]
    fn test_ack_roundtrip() {
        let ack = AckPayload { clock: 7, durable: false };
        let msg = SyncMessage::ack(Uuid::nil(), "orders", ack).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.ack_payload().unwrap(), ack);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let user_id = Uuid::new_v4();
        let cursor = AwarenessMessage::Cursor {
            user_id,
            position: Point::new(100.5, 200.25),
            timestamp: 3,
        };
        let msg = SyncMessage::awareness(user_id, "orders", 1, &cursor).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_message().unwrap(), cursor);
    }

    #[test]
    fn test_error_reason() {
        let msg = SyncMessage::error(Uuid::nil(), "orders", "room full");
        assert_eq!(msg.error_reason().unwrap(), "room full");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.join_request(),
            Err(ProtocolError::InvalidMessageType {
                expected: MessageType::PeerJoined,
                actual: MessageType::Ping,
            })
        );
        assert!(msg.ack_payload().is_err());
        assert!(msg.awareness_message().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), "d1", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_peer_info_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PeerInfo::with_id(id, "a").color, PeerInfo::with_id(id, "b").color);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Ack as u8, 9);
        assert_eq!(MessageType::Error as u8, 10);
    }
}
