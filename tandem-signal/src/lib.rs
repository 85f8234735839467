//! # tandem-signal — signaling relay fabric
//!
//! Forwards session-scoped control messages (offers, answers, ICE
//! candidates) between clients even when sender and receiver terminate on
//! different nodes. Client-to-node routing lives in the substrate; every
//! hub subscribes to one shared relay channel.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelopes, roles, relay frames, key layout
//! - [`hub`] — per-node hub: rooms, routing, heartbeats
//! - [`client`] — reconnecting WebSocket client

pub mod client;
pub mod hub;
pub mod protocol;

pub use client::{ClientEvent, SignalClient};
pub use hub::{ClientConn, HubStats, SignalConfig, SignalHub};
pub use protocol::{Envelope, Participant, RelayFrame, Role};
