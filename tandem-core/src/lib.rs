//! # tandem-core — shared foundations for the Tandem coordination plane
//!
//! Everything here is transport- and component-agnostic:
//!
//! - [`fault`] — the error taxonomy every component speaks
//! - [`config`] — runtime configuration read from the environment
//! - [`reconnect`] — backoff policy + connection lifecycle state machine

pub mod config;
pub mod fault;
pub mod reconnect;

pub use config::{NodeConfig, ConfigError, EXIT_CONFIG, EXIT_OK, EXIT_SUBSTRATE};
pub use fault::{Fault, FaultKind};
pub use reconnect::{BackoffPolicy, ReconnectState, Reconnector};
