//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┐
//! │ msg_type │ client_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │
//! └──────────┴───────────┴──────────┘
//! ```
//!
//! The socket is document-scoped (`/documents/{workspace}/{path}`), so
//! messages carry no document id. Sync follows the two-step handshake:
//! the client sends its state vector (`SyncStep1`), the server answers
//! with the missing diff (`SyncStep2`), then incremental `Update`s flow.
//! Awareness piggybacks on the same framing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types of the document protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DocMsgType {
    /// State vector for the sync handshake.
    SyncStep1 = 1,
    /// State diff response.
    SyncStep2 = 2,
    /// Incremental CRDT update.
    Update = 3,
    /// Cursor/selection awareness update.
    Awareness = 4,
    /// A peer joined the document.
    PeerJoined = 5,
    /// A peer left the document.
    PeerLeft = 6,
    /// Heartbeat ping.
    Ping = 7,
    /// Heartbeat pong.
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMessage {
    pub msg_type: DocMsgType,
    pub client_id: Uuid,
    pub payload: Vec<u8>,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum DocProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for DocProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for DocProtocolError {}

impl DocMessage {
    pub fn new(msg_type: DocMsgType, client_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            payload,
        }
    }

    pub fn sync_step1(client_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(DocMsgType::SyncStep1, client_id, state_vector)
    }

    pub fn sync_step2(client_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(DocMsgType::SyncStep2, client_id, diff)
    }

    pub fn update(client_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(DocMsgType::Update, client_id, update)
    }

    pub fn awareness(client_id: Uuid, state: &AwarenessState) -> Self {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .unwrap_or_default();
        Self::new(DocMsgType::Awareness, client_id, payload)
    }

    pub fn peer_joined(client_id: Uuid) -> Self {
        Self::new(DocMsgType::PeerJoined, client_id, Vec::new())
    }

    pub fn peer_left(client_id: Uuid) -> Self {
        Self::new(DocMsgType::PeerLeft, client_id, Vec::new())
    }

    pub fn pong(client_id: Uuid) -> Self {
        Self::new(DocMsgType::Pong, client_id, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DocProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DocProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, DocProtocolError> {
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| DocProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// Cursor position in a text document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

/// Per-client presence: cursor, selection and identity metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub cursor: Option<CursorPos>,
    /// Selection as (anchor, head); equal endpoints mean no selection.
    pub selection: Option<(CursorPos, CursorPos)>,
    pub user_name: Option<String>,
}

/// Frame published on `awareness:{doc_id}`.
///
/// `origin_node` is the echo-suppression marker: a node ignores frames
/// whose origin matches its own id, so locally applied updates are never
/// applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessFrame {
    pub origin_node: String,
    pub client_id: Uuid,
    /// `None` announces the client's departure.
    pub state: Option<AwarenessState>,
}

impl AwarenessFrame {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DocProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let client = Uuid::new_v4();
        let msg = DocMessage::update(client, vec![1, 2, 3]);
        let encoded = msg.encode().unwrap();
        let back = DocMessage::decode(&encoded).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let client = Uuid::new_v4();
        let state = AwarenessState {
            cursor: Some(CursorPos { line: 3, column: 14 }),
            selection: Some((
                CursorPos { line: 3, column: 10 },
                CursorPos { line: 3, column: 14 },
            )),
            user_name: Some("ada".to_string()),
        };
        let msg = DocMessage::awareness(client, &state);
        let decoded = DocMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_state().unwrap(), state);
    }

    #[test]
    fn test_awareness_frame_roundtrip() {
        let frame = AwarenessFrame {
            origin_node: "node-a".to_string(),
            client_id: Uuid::new_v4(),
            state: None,
        };
        let back = AwarenessFrame::decode(&frame.encode()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DocMessage::decode(&[0xFF, 0xFE]).is_err());
        assert!(AwarenessFrame::decode(&[0x01]).is_err());
    }
}
