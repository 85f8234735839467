//! # tandem-substrate — the shared state substrate
//!
//! A single logical store shared by every node in the cluster. All
//! cross-node coordination flows through it:
//!
//! ```text
//! ┌───────────┐   leases, descriptors   ┌────────────┐
//! │ Sim node  │ ◄──────────────────────► │            │
//! └───────────┘                          │            │
//! ┌───────────┐   rooms, client index    │  Substrate │
//! │ Signaling │ ◄──────────────────────► │  (KV, set, │
//! └───────────┘                          │  hash, ctr,│
//! ┌───────────┐   encoded doc state      │  ring,     │
//! │ Docs      │ ◄──────────────────────► │  pub/sub)  │
//! └───────────┘                          │            │
//! ┌───────────┐   caches, rate limits    │            │
//! │ Gateway   │ ◄──────────────────────► │            │
//! └───────────┘                          └────────────┘
//! ```
//!
//! Backends are selected by URL scheme in [`Substrate::connect`]. The
//! `mem://<name>` backend attaches to a named process-wide store: every
//! handle with the same URL observes the same data, which is how a
//! single-process deployment and the multi-node integration tests share
//! state. Every key either carries a TTL or is deleted by its owning
//! component.
//!
//! ## Modules
//!
//! - [`store`] — the public [`Substrate`] handle, batches, retry helper
//! - [`memory`] — the in-process backend (KV/hash/set/counter/ring + TTL)
//! - [`pubsub`] — per-channel FIFO fan-out built on `tokio::sync::broadcast`

pub mod memory;
pub mod pubsub;
pub mod store;

pub use pubsub::{SubEvent, Subscription};
pub use store::{retrying, Batch, Substrate, SubstrateError};
