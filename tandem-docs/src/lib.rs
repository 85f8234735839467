//! # tandem-docs — collaborative document service
//!
//! Hosts CRDT documents keyed by `(workspace, path)`, persists their
//! encoded state in the substrate, and relays awareness (cursor/selection
//! presence) across nodes with origin-marker echo suppression.
//!
//! ## Modules
//!
//! - [`protocol`] — bincode wire messages and awareness frames
//! - [`service`] — document rooms, persistence, relay

pub mod protocol;
pub mod service;

pub use protocol::{AwarenessFrame, AwarenessState, CursorPos, DocMessage, DocMsgType};
pub use service::{doc_id, DocConfig, DocConn, DocService};
