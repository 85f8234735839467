//! Frame wire format and stream items.
//!
//! A rendered frame travels as one binary payload:
//!
//! ```text
//! ┌───────┬──────────────┬─────────────┬─────────────┐
//! │ "F1"  │ frame_index  │ sim_time    │ image bytes │
//! │ 2 B   │ u64 LE       │ f64 LE      │ variable    │
//! └───────┴──────────────┴─────────────┴─────────────┘
//! ```
//!
//! Execution results ride the same per-session channel with an `"E1"`
//! magic and a JSON body, so subscribers observe them strictly after the
//! frames produced during that execution (per-channel FIFO).

use serde::{Deserialize, Serialize};

use crate::script::ExecOutcome;

pub const FRAME_MAGIC: [u8; 2] = *b"F1";
pub const EXEC_MAGIC: [u8; 2] = *b"E1";
const HEADER_LEN: usize = 2 + 8 + 8;

/// A rendered frame. Monotonic `frame_index` per session.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_index: u64,
    pub sim_time: f64,
    pub image: Vec<u8>,
}

/// Frame decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    BadMagic,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame payload truncated"),
            Self::BadMagic => write!(f, "frame payload has wrong magic"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.image.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&self.frame_index.to_le_bytes());
        out.extend_from_slice(&self.sim_time.to_le_bytes());
        out.extend_from_slice(&self.image);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        if bytes[..2] != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let frame_index = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        let sim_time = f64::from_le_bytes(bytes[10..18].try_into().unwrap());
        Ok(Self {
            frame_index,
            sim_time,
            image: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Events a session status subscriber sees as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecResult { result: ExecOutcome },
    Status { status: String, frame_index: u64 },
}

/// One item observed on a frame stream subscription.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Frame(Frame),
    /// Execution finished; ordered after the execution's frames.
    Exec(ExecOutcome),
    /// The subscriber lagged and `n` payloads were dropped (oldest first).
    Dropped(u64),
}

/// Encode an execution outcome for the per-session channel.
pub fn encode_exec(outcome: &ExecOutcome) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&EXEC_MAGIC);
    out.extend_from_slice(&serde_json::to_vec(outcome).unwrap_or_default());
    out
}

/// Classify a channel payload into a stream item.
pub fn decode_channel_payload(bytes: &[u8]) -> Option<StreamItem> {
    if bytes.len() >= 2 && bytes[..2] == EXEC_MAGIC {
        return serde_json::from_slice(&bytes[2..]).ok().map(StreamItem::Exec);
    }
    Frame::decode(bytes).ok().map(StreamItem::Frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ExecStatus;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            frame_index: 42,
            sim_time: 0.7,
            image: vec![1, 2, 3, 4],
        };
        let wire = frame.encode();
        assert_eq!(&wire[..2], b"F1");
        let back = Frame::decode(&wire).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Frame::decode(b"F1").unwrap_err(), FrameError::Truncated);
        let mut wire = Frame {
            frame_index: 0,
            sim_time: 0.0,
            image: vec![],
        }
        .encode();
        wire[0] = b'X';
        assert_eq!(Frame::decode(&wire).unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn test_channel_payload_classification() {
        let frame = Frame {
            frame_index: 1,
            sim_time: 0.1,
            image: vec![9],
        };
        assert!(matches!(
            decode_channel_payload(&frame.encode()),
            Some(StreamItem::Frame(f)) if f.frame_index == 1
        ));

        let outcome = ExecOutcome {
            status: ExecStatus::Success,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            finished_at: 0,
        };
        assert!(matches!(
            decode_channel_payload(&encode_exec(&outcome)),
            Some(StreamItem::Exec(o)) if o.status == ExecStatus::Success
        ));

        assert!(decode_channel_payload(b"??").is_none());
    }
}
