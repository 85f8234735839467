//! Message surface of the control loop and the sandbox capability façade.
//!
//! The engine handle is exclusively owned by the control-loop task; every
//! external request is a [`ControlMsg`] with a oneshot reply. [`SimFacade`]
//! is the sole ambient capability handed to user code: `reset`, `step`,
//! `state` — each call enqueues a message and waits for the loop's answer,
//! so user code can never block or bypass the loop.

use std::time::Duration;

use tandem_core::Fault;
use tokio::sync::{mpsc, oneshot};

use crate::descriptor::ControlVerb;
use crate::driver::EngineState;
use crate::script::ExecOutcome;

/// Default deadline for a façade call waiting on the loop.
const FACADE_DEADLINE: Duration = Duration::from_secs(10);

/// Messages handled by a session's control loop.
pub enum ControlMsg {
    /// A stream/control verb; replied with the transition result.
    Verb(ControlVerb, oneshot::Sender<Result<(), Fault>>),
    /// Façade `reset`.
    FacadeReset(oneshot::Sender<Result<EngineState, Fault>>),
    /// Façade `step` with an actuator command.
    FacadeStep(Vec<f64>, oneshot::Sender<Result<EngineState, Fault>>),
    /// Façade `state` (no physics advance).
    FacadeState(oneshot::Sender<Result<EngineState, Fault>>),
    /// Publish an execution outcome after all frames it produced.
    PublishExec(ExecOutcome),
    /// Terminate the loop; replied once the driver is disposed.
    Shutdown(oneshot::Sender<()>),
}

/// The capability façade user code receives.
#[derive(Clone)]
pub struct SimFacade {
    tx: mpsc::Sender<ControlMsg>,
}

impl SimFacade {
    pub fn new(tx: mpsc::Sender<ControlMsg>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        msg: ControlMsg,
        rx: oneshot::Receiver<Result<T, Fault>>,
    ) -> Result<T, Fault> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Fault::unavailable("control loop stopped"))?;
        match tokio::time::timeout(FACADE_DEADLINE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Fault::unavailable("control loop stopped")),
            Err(_) => Err(Fault::deadline("simulation call timed out")),
        }
    }

    /// Reset the simulation; frame numbering restarts at 0.
    pub async fn reset(&self) -> Result<EngineState, Fault> {
        let (reply, rx) = oneshot::channel();
        self.call(ControlMsg::FacadeReset(reply), rx).await
    }

    /// Advance one physics step with the given actuator command.
    pub async fn step(&self, action: Vec<f64>) -> Result<EngineState, Fault> {
        let (reply, rx) = oneshot::channel();
        self.call(ControlMsg::FacadeStep(action, reply), rx).await
    }

    /// Read the current physics state without stepping.
    pub async fn state(&self) -> Result<EngineState, Fault> {
        let (reply, rx) = oneshot::channel();
        self.call(ControlMsg::FacadeState(reply), rx).await
    }
}
