//! # tandem-sim — simulation lifecycle and frame streaming
//!
//! Owns per-session physics instances, runs user control code in a sandbox,
//! steps the engine, and fans rendered frames out to subscribers on any
//! node.
//!
//! ```text
//! create/execute/control            frames:{sid} (substrate channel)
//!        │                                   ▲
//!        ▼                                   │ publish
//! ┌─────────────┐   ControlMsg   ┌───────────┴─────────┐
//! │ SimService  │ ─────────────► │ ControlLoop (task)   │
//! │ (per node)  │                │  owns DriverWorker   │
//! └──────┬──────┘                │  owns frame counter  │
//!        │ relay (per node,      └───────────┬─────────┘
//!        │  ref-counted)                     │ driver cmds
//!        ▼                                   ▼
//! ┌─────────────┐                ┌─────────────────────┐
//! │ FrameStream │                │ engine worker thread │
//! │ subscribers │                │ (exclusive handle)   │
//! └─────────────┘                └─────────────────────┘
//! ```
//!
//! At most one node runs a session's loop at a time, enforced by the
//! `sim:lease:{sid}` TTL lease in the substrate.
//!
//! ## Modules
//!
//! - [`driver`] — the engine capability seam and its worker thread
//! - [`cartpole`] — deterministic in-tree driver
//! - [`descriptor`] — session descriptors, status machine, key layout
//! - [`control`] — the per-session control loop
//! - [`facade`] — control messages and the sandbox capability façade
//! - [`script`] — the control-script sandbox
//! - [`frame`] — frame wire format and stream items
//! - [`service`] — the public service surface

pub mod cartpole;
pub mod control;
pub mod descriptor;
pub mod driver;
pub mod facade;
pub mod frame;
pub mod script;
pub mod service;

pub use cartpole::CartpoleDriver;
pub use descriptor::{ControlVerb, SessionDescriptor, SessionStatus, Snapshot};
pub use driver::{DriverError, DriverWorker, EngineDriver, EngineKind, EngineState};
pub use facade::SimFacade;
pub use frame::{Frame, StreamEvent, StreamItem};
pub use script::{ExecOutcome, ExecStatus};
pub use service::{
    kinematic_factory, CreateSession, DeleteOutcome, DriverFactory, ExecRequest, FrameStream,
    SimConfig, SimService,
};
