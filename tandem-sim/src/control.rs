//! Per-session control loop.
//!
//! Exactly one task advances a session's physics; it owns the
//! [`DriverWorker`], the frame counter, and the execution publishing. All
//! other tasks talk to it through [`ControlMsg`]. Phases per tick: drain
//! control messages, step the engine with the latest actuator command,
//! render when the FPS interval has elapsed, publish.
//!
//! The loop runs only while it holds the session lease; a failed renewal
//! stops stepping and drops the in-memory instance so another node can take
//! over after expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_core::{Fault, FaultKind};
use tandem_substrate::Substrate;
use tokio::sync::mpsc;

use crate::descriptor::{keys, ControlVerb, SessionDescriptor, SessionStatus};
use crate::driver::{DriverError, DriverWorker, EngineDriver, EngineState};
use crate::facade::ControlMsg;
use crate::frame::{encode_exec, Frame};

/// Frames retained in the substrate ring for restartable subscriptions.
const RING_CAP: usize = 32;

/// Control message queue depth per session.
const CONTROL_QUEUE: usize = 64;

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct ControlLoop {
    session_id: String,
    descriptor: SessionDescriptor,
    substrate: Substrate,
    worker: DriverWorker,
    rx: mpsc::Receiver<ControlMsg>,
    lease_token: String,
    lease_ttl: Duration,
    status: SessionStatus,
    degraded: bool,
    frame_index: u64,
    fps: u32,
    last_action: Vec<f64>,
    cached_state: EngineState,
    last_render: Option<Instant>,
    timestep: Duration,
}

impl ControlLoop {
    /// Load the engine, seed persisted state and spawn the loop task.
    ///
    /// `resume_from` carries the persisted frame counter when an instance is
    /// being rebuilt after a takeover.
    pub(crate) async fn start(
        descriptor: SessionDescriptor,
        driver: Box<dyn EngineDriver>,
        substrate: Substrate,
        lease_token: String,
        lease_ttl: Duration,
        resume_from: u64,
    ) -> Result<mpsc::Sender<ControlMsg>, Fault> {
        let worker = DriverWorker::spawn(driver, Duration::from_secs(5));
        worker
            .load(
                &descriptor.model_ref,
                descriptor.width,
                descriptor.height,
                descriptor.headless,
            )
            .await
            .map_err(|e| match e {
                DriverError::BadModel(m) => Fault::invalid(m),
                other => Fault::unavailable(other.to_string()),
            })?;
        let cached_state = worker
            .reset()
            .await
            .map_err(|e| Fault::unavailable(e.to_string()))?;
        let timestep = worker.timestep().await;

        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        let mut this = Self {
            session_id: descriptor.session_id.clone(),
            fps: descriptor.fps,
            descriptor,
            substrate,
            worker,
            rx,
            lease_token,
            lease_ttl,
            status: SessionStatus::Created,
            degraded: false,
            frame_index: resume_from,
            last_action: Vec::new(),
            cached_state,
            last_render: None,
            timestep,
        };
        this.persist_state().await;
        tokio::spawn(async move { this.run().await });
        Ok(tx)
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.timestep);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut lease_tick = tokio::time::interval(self.lease_ttl / 3);
        lease_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; renewing a fresh lease
        // is harmless.
        loop {
            tokio::select! {
                biased;

                msg = self.rx.recv() => match msg {
                    None => {
                        // Service dropped the handle without delete; release
                        // the lease so another node can adopt the session.
                        self.release_lease().await;
                        break;
                    }
                    Some(msg) => {
                        if let Flow::Stop = self.handle(msg).await {
                            break;
                        }
                    }
                },

                _ = lease_tick.tick() => {
                    if !self.renew_lease().await {
                        log::warn!(
                            "session {}: lease renewal failed, stopping control loop",
                            self.session_id
                        );
                        break;
                    }
                }

                _ = tick.tick(), if self.status == SessionStatus::Running => {
                    let _ = self.advance(None).await;
                }
            }
        }
        log::info!("session {}: control loop stopped", self.session_id);
    }

    async fn handle(&mut self, msg: ControlMsg) -> Flow {
        match msg {
            ControlMsg::Verb(verb, reply) => {
                let result = self.apply_verb(verb).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            ControlMsg::FacadeReset(reply) => {
                let _ = reply.send(self.do_reset().await);
                Flow::Continue
            }
            ControlMsg::FacadeStep(action, reply) => {
                let _ = reply.send(self.advance(Some(action)).await);
                Flow::Continue
            }
            ControlMsg::FacadeState(reply) => {
                let _ = reply.send(Ok(self.cached_state.clone()));
                Flow::Continue
            }
            ControlMsg::PublishExec(outcome) => {
                let payload = encode_exec(&outcome);
                let _ = self
                    .substrate
                    .publish(&keys::frames_channel(&self.session_id), payload)
                    .await;
                let _ = self
                    .substrate
                    .publish(
                        &keys::exec_channel(&self.session_id),
                        serde_json::to_vec(&outcome).unwrap_or_default(),
                    )
                    .await;
                Flow::Continue
            }
            ControlMsg::Shutdown(reply) => {
                self.status = SessionStatus::Terminated;
                self.persist_state().await;
                self.release_lease().await;
                let _ = reply.send(());
                Flow::Stop
            }
        }
    }

    async fn apply_verb(&mut self, verb: ControlVerb) -> Result<(), Fault> {
        match verb {
            ControlVerb::Play => match self.status {
                SessionStatus::Created | SessionStatus::Paused => {
                    self.status = SessionStatus::Running;
                    self.persist_state().await;
                    Ok(())
                }
                SessionStatus::Running => Ok(()),
                SessionStatus::Terminated => {
                    Err(Fault::transition("cannot play a terminated session"))
                }
            },
            ControlVerb::Pause => match self.status {
                SessionStatus::Running | SessionStatus::Paused => {
                    self.status = SessionStatus::Paused;
                    self.persist_state().await;
                    Ok(())
                }
                other => Err(Fault::transition(format!(
                    "cannot pause a session in state {}",
                    other.as_str()
                ))),
            },
            ControlVerb::Reset => self.do_reset().await.map(|_| ()),
            ControlVerb::Step => self.advance(None).await.map(|_| ()),
            ControlVerb::SetFps(fps) => {
                self.fps = fps;
                self.persist_state().await;
                Ok(())
            }
        }
    }

    /// Reset physics and restart frame numbering at 0. Legal in every
    /// non-terminal state; clears a sticky degradation.
    async fn do_reset(&mut self) -> Result<EngineState, Fault> {
        let state = match self.worker.reset().await {
            Ok(state) => state,
            Err(e) => {
                self.recover(&e).await?;
                self.worker
                    .reset()
                    .await
                    .map_err(|e| self.degraded_fault(&e))?
            }
        };
        self.degraded = false;
        self.cached_state = state.clone();
        self.frame_index = 0;
        self.last_action.clear();
        self.last_render = None;
        self.render_and_publish().await;
        self.persist_state().await;
        Ok(state)
    }

    /// One physics step. `action` of `None` re-applies the most recent
    /// actuator command (held-input semantics).
    async fn advance(&mut self, action: Option<Vec<f64>>) -> Result<EngineState, Fault> {
        let action = action.unwrap_or_else(|| self.last_action.clone());
        let state = match self.worker.step(action.clone()).await {
            Ok(state) => state,
            Err(e) => {
                self.recover(&e).await?;
                self.worker
                    .step(action.clone())
                    .await
                    .map_err(|e| self.degraded_fault(&e))?
            }
        };
        self.degraded = false;
        self.last_action = action;
        self.cached_state = state.clone();
        self.maybe_render().await;
        self.persist_state().await;
        Ok(state)
    }

    /// One re-initialization attempt after a failed driver call.
    ///
    /// Taxonomy: call failures and deadlines are recoverable (reload +
    /// reset); a failed reload is fatal and leaves the instance `Degraded`
    /// until `reset` or `delete`.
    async fn recover(&mut self, cause: &DriverError) -> Result<(), Fault> {
        log::error!(
            "session {}: driver call failed ({cause}), attempting re-initialization",
            self.session_id
        );
        self.degraded = true;
        self.persist_state().await;

        let reload = self
            .worker
            .load(
                &self.descriptor.model_ref,
                self.descriptor.width,
                self.descriptor.height,
                self.descriptor.headless,
            )
            .await;
        match reload {
            Ok(()) => {
                log::info!("session {}: driver re-initialized", self.session_id);
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "session {}: re-initialization failed ({e}), instance stays degraded",
                    self.session_id
                );
                Err(self.degraded_fault(&e))
            }
        }
    }

    fn degraded_fault(&self, cause: &DriverError) -> Fault {
        Fault::new(
            FaultKind::Degraded,
            format!("engine degraded: {cause}; cached state remains readable"),
        )
    }

    async fn maybe_render(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)));
        let due = self.frame_index == 0
            || self.last_render.map_or(true, |at| at.elapsed() >= interval);
        if due {
            self.render_and_publish().await;
        }
    }

    async fn render_and_publish(&mut self) {
        let image = match self.worker.render().await {
            Ok(image) => image,
            Err(e) => {
                // A dropped frame, not a degradation: physics is intact.
                log::warn!("session {}: render failed ({e}), frame skipped", self.session_id);
                return;
            }
        };
        if image.is_empty() {
            log::warn!("session {}: empty render output suppressed", self.session_id);
            return;
        }

        let frame = Frame {
            frame_index: self.frame_index,
            sim_time: self.cached_state.sim_time,
            image,
        };
        let wire = frame.encode();
        let _ = self
            .substrate
            .ring_push(
                &keys::ring(&self.session_id),
                frame.frame_index,
                Arc::new(wire.clone()),
                RING_CAP,
            )
            .await;
        let _ = self
            .substrate
            .publish(&keys::frames_channel(&self.session_id), wire)
            .await;
        self.frame_index += 1;
        self.last_render = Some(Instant::now());
    }

    async fn persist_state(&self) {
        // "frame" is the latest rendered index (0 before the first render);
        // the internal counter tracks the next index to assign.
        let fields: Vec<(&str, String)> = vec![
            ("status", self.status.as_str().to_string()),
            ("degraded", self.degraded.to_string()),
            ("frame", self.frame_index.saturating_sub(1).to_string()),
            ("time", self.cached_state.sim_time.to_string()),
            (
                "positions",
                serde_json::to_string(&self.cached_state.positions).unwrap_or_default(),
            ),
            (
                "velocities",
                serde_json::to_string(&self.cached_state.velocities).unwrap_or_default(),
            ),
        ];
        if let Err(e) = self
            .substrate
            .hset(&keys::state(&self.session_id), &fields, None)
            .await
        {
            log::warn!("session {}: state persist failed: {e}", self.session_id);
        }
    }

    async fn renew_lease(&self) -> bool {
        match self
            .substrate
            .expire_if(
                &keys::lease(&self.session_id),
                &self.lease_token,
                self.lease_ttl,
            )
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                log::warn!("session {}: lease renewal errored: {e}", self.session_id);
                false
            }
        }
    }

    async fn release_lease(&self) {
        let _ = self
            .substrate
            .del_if(&keys::lease(&self.session_id), &self.lease_token)
            .await;
    }
}
