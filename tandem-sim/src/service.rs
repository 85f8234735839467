//! Simulation service: session lifecycle, execution slot, frame fan-out.
//!
//! One [`SimService`] per node. Sessions are owned cluster-wide through the
//! substrate lease `sim:lease:{sid}`; the holder runs the control loop.
//! Frames reach subscribers through a per-node relay: a single substrate
//! subscription per session feeds a local broadcast channel, reference
//! counted so the node unsubscribes when the last local subscriber detaches.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::{Fault, NodeConfig};
use tandem_substrate::{Batch, SubEvent, Substrate};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::control::ControlLoop;
use crate::descriptor::{keys, ControlVerb, SessionDescriptor, SessionStatus, Snapshot};
use crate::driver::{EngineDriver, EngineKind};
use crate::facade::{ControlMsg, SimFacade};
use crate::frame::{decode_channel_payload, StreamItem};
use crate::script::{self, ExecOutcome};

/// Builds a driver for an engine kind. Injected so tests can supply failing
/// or instrumented drivers.
pub type DriverFactory = Arc<dyn Fn(EngineKind) -> Box<dyn EngineDriver> + Send + Sync>;

/// The in-tree default: the deterministic cart-pole driver for both kinds.
pub fn kinematic_factory() -> DriverFactory {
    Arc::new(|_| Box::new(crate::cartpole::CartpoleDriver::new()))
}

/// Service knobs, derived from the node configuration.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub node_id: String,
    pub lease_ttl: Duration,
    pub frame_backpressure: usize,
    pub exec_wall_clock: Duration,
}

impl SimConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            lease_ttl: config.lease_ttl,
            frame_backpressure: config.frame_backpressure,
            exec_wall_clock: config.exec_wall_clock,
        }
    }
}

/// `POST /simulations/create` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    pub session_id: String,
    pub engine: EngineKind,
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_headless")]
    pub headless: bool,
}

fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    60
}
fn default_headless() -> bool {
    true
}

/// `POST /simulations/{sid}/execute` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub code: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Result of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Absent,
}

impl DeleteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Absent => "absent",
        }
    }
}

struct LocalSession {
    tx: mpsc::Sender<ControlMsg>,
    exec_busy: Arc<AtomicBool>,
}

/// A relay item: a channel payload or a drop marker from relay-side lag.
#[derive(Clone)]
enum RelayItem {
    Payload(Arc<Vec<u8>>),
    Dropped(u64),
}

struct Relay {
    tx: broadcast::Sender<RelayItem>,
    refs: usize,
    task: tokio::task::JoinHandle<()>,
}

type RelayMap = Arc<Mutex<HashMap<String, Relay>>>;

/// The simulation service of one node.
pub struct SimService {
    substrate: Substrate,
    config: SimConfig,
    factory: DriverFactory,
    sessions: RwLock<HashMap<String, LocalSession>>,
    relays: RelayMap,
}

impl SimService {
    pub fn new(substrate: Substrate, config: SimConfig, factory: DriverFactory) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            relays: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a session and start its control loop.
    ///
    /// Succeeds when this node can acquire the ownership lease — which also
    /// covers reviving a session whose previous holder crashed and whose
    /// lease expired; the persisted descriptor is then overwritten in place.
    pub async fn create(&self, req: CreateSession) -> Result<(), Fault> {
        let descriptor = SessionDescriptor {
            session_id: req.session_id.clone(),
            engine: req.engine,
            model_ref: req.model_path,
            width: req.width,
            height: req.height,
            fps: req.fps,
            headless: req.headless,
            created_at: script::now_ms(),
        };
        descriptor.validate()?;

        let token = self.lease_token();
        let acquired = self
            .substrate
            .set_nx(
                &keys::lease(&descriptor.session_id),
                &token,
                Some(self.config.lease_ttl),
            )
            .await
            .map_err(Fault::from)?;
        if !acquired {
            return Err(Fault::already_exists(format!(
                "session {}",
                descriptor.session_id
            )));
        }

        let resume_from = self.resume_point(&descriptor.session_id).await;
        match self
            .start_instance(descriptor.clone(), token.clone(), resume_from)
            .await
        {
            Ok(()) => {
                log::info!(
                    "created {} session {} ({}x{} @ {} fps)",
                    descriptor.engine.as_str(),
                    descriptor.session_id,
                    descriptor.width,
                    descriptor.height,
                    descriptor.fps
                );
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .substrate
                    .del_if(&keys::lease(&descriptor.session_id), &token)
                    .await;
                Err(e)
            }
        }
    }

    /// Idempotent delete: stops the local loop (if any), removes every
    /// persisted key for the session, and reports whether anything existed.
    pub async fn delete(&self, session_id: &str) -> Result<DeleteOutcome, Fault> {
        let local = self.sessions.write().await.remove(session_id);
        let had_local = local.is_some();
        if let Some(session) = local {
            let (reply, rx) = oneshot::channel();
            if session.tx.send(ControlMsg::Shutdown(reply)).await.is_ok() {
                let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
            }
        }

        let had_config = self
            .substrate
            .exists(&keys::config(session_id))
            .await
            .map_err(Fault::from)?;

        self.substrate
            .exec(
                Batch::new()
                    .srem(keys::INDEX, session_id)
                    .del(keys::config(session_id))
                    .del(keys::state(session_id))
                    .del(keys::lease(session_id))
                    .del(keys::ring(session_id)),
            )
            .await
            .map_err(Fault::from)?;

        if had_local || had_config {
            log::info!("deleted session {session_id}");
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::Absent)
        }
    }

    /// Run user code in the session's execution slot.
    pub async fn execute(&self, session_id: &str, req: ExecRequest) -> Result<ExecOutcome, Fault> {
        if req.model_path.is_some() || req.working_dir.is_some() {
            // Accepted for contract compatibility; the in-tree driver has no
            // filesystem model store to point them at.
            log::debug!("execute on {session_id}: ignoring model/cwd overrides");
        }

        let (tx, exec_busy) = self.ensure_local(session_id).await?;
        if exec_busy.swap(true, Ordering::SeqCst) {
            return Err(Fault::busy(format!(
                "session {session_id} already has an execution in flight"
            )));
        }

        let facade = SimFacade::new(tx.clone());
        let outcome =
            match tokio::time::timeout(self.config.exec_wall_clock, script::run(&req.code, &facade))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => ExecOutcome::timeout(),
            };
        exec_busy.store(false, Ordering::SeqCst);

        // Published through the loop so subscribers see it after every frame
        // the execution produced.
        let _ = tx.send(ControlMsg::PublishExec(outcome.clone())).await;
        Ok(outcome)
    }

    /// Snapshot from the persisted state hash; works from any node and
    /// serves the cached values while an instance is degraded.
    pub async fn get_state(&self, session_id: &str) -> Result<Snapshot, Fault> {
        if !self
            .substrate
            .exists(&keys::config(session_id))
            .await
            .map_err(Fault::from)?
        {
            return Err(Fault::not_found(format!("session {session_id}")));
        }
        let hash = self
            .substrate
            .hgetall(&keys::state(session_id))
            .await
            .map_err(Fault::from)?;
        Ok(Snapshot {
            session_id: session_id.to_string(),
            status: hash
                .get("status")
                .and_then(|s| SessionStatus::parse(s))
                .unwrap_or(SessionStatus::Created),
            degraded: hash.get("degraded").is_some_and(|v| v == "true"),
            frame_index: hash
                .get("frame")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sim_time: hash.get("time").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            positions: hash
                .get("positions")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            velocities: hash
                .get("velocities")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
        })
    }

    /// Apply a control verb to the session's loop.
    pub async fn send_control(&self, session_id: &str, verb: ControlVerb) -> Result<(), Fault> {
        let (tx, _) = self.ensure_local(session_id).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(ControlMsg::Verb(verb, reply))
            .await
            .map_err(|_| Fault::unavailable("control loop stopped"))?;
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .map_err(|_| Fault::deadline("control verb timed out"))?
            .map_err(|_| Fault::unavailable("control loop stopped"))?
    }

    /// Subscribe to the session's frame stream, optionally replaying the
    /// buffered ring from `from_frame`.
    pub async fn subscribe_stream(
        &self,
        session_id: &str,
        from_frame: Option<u64>,
    ) -> Result<FrameStream, Fault> {
        if !self
            .substrate
            .exists(&keys::config(session_id))
            .await
            .map_err(Fault::from)?
        {
            return Err(Fault::not_found(format!("session {session_id}")));
        }

        // Attach before reading the ring so no frame falls between them.
        let rx = self.attach_relay(session_id).await?;

        let mut replay = VecDeque::new();
        let mut dedup_until = None;
        if let Some(from) = from_frame {
            for (seq, payload) in self
                .substrate
                .ring_range(&keys::ring(session_id), from)
                .await
                .map_err(Fault::from)?
            {
                if let Some(StreamItem::Frame(frame)) = decode_channel_payload(&payload) {
                    dedup_until = Some(seq);
                    replay.push_back(StreamItem::Frame(frame));
                }
            }
        }

        Ok(FrameStream {
            session_id: session_id.to_string(),
            replay,
            rx,
            dedup_until,
            relays: Arc::clone(&self.relays),
            detached: false,
        })
    }

    /// Local subscriber count for a session (diagnostics and tests).
    pub fn local_subscribers(&self, session_id: &str) -> usize {
        let relays = self.relays.lock().expect("relay table poisoned");
        relays.get(session_id).map_or(0, |r| r.refs)
    }

    /// Number of sessions whose control loop runs on this node.
    pub async fn local_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn lease_token(&self) -> String {
        format!("{}:{}", self.config.node_id, Uuid::new_v4())
    }

    /// Frame index to continue from when rebuilding an instance: one past
    /// the latest persisted frame, or 0 for a session with no history.
    async fn resume_point(&self, session_id: &str) -> u64 {
        match self.substrate.hget(&keys::state(session_id), "frame").await {
            Ok(Some(raw)) => raw.parse::<u64>().map(|f| f + 1).unwrap_or(0),
            _ => 0,
        }
    }

    async fn start_instance(
        &self,
        descriptor: SessionDescriptor,
        token: String,
        resume_from: u64,
    ) -> Result<(), Fault> {
        let driver = (self.factory)(descriptor.engine);
        let session_id = descriptor.session_id.clone();
        let tx = ControlLoop::start(
            descriptor.clone(),
            driver,
            self.substrate.clone(),
            token,
            self.config.lease_ttl,
            resume_from,
        )
        .await?;

        self.substrate
            .exec(
                Batch::new()
                    .sadd(keys::INDEX, session_id.clone())
                    .set(
                        keys::config(&session_id),
                        serde_json::to_string(&descriptor)
                            .map_err(|e| Fault::internal(e.to_string()))?,
                    ),
            )
            .await
            .map_err(Fault::from)?;

        self.sessions.write().await.insert(
            session_id,
            LocalSession {
                tx,
                exec_busy: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Resolve the session to a local control loop, rebuilding the instance
    /// from the persisted descriptor when this node can take the lease.
    async fn ensure_local(
        &self,
        session_id: &str,
    ) -> Result<(mpsc::Sender<ControlMsg>, Arc<AtomicBool>), Fault> {
        {
            let sessions = self.sessions.read().await;
            if let Some(s) = sessions.get(session_id) {
                if !s.tx.is_closed() {
                    return Ok((s.tx.clone(), Arc::clone(&s.exec_busy)));
                }
            }
        }
        // Stale or missing: drop any dead entry, then try to adopt.
        self.sessions.write().await.retain(|_, s| !s.tx.is_closed());

        let config_json = self
            .substrate
            .get(&keys::config(session_id))
            .await
            .map_err(Fault::from)?
            .ok_or_else(|| Fault::not_found(format!("session {session_id}")))?;
        let descriptor: SessionDescriptor = serde_json::from_str(&config_json)
            .map_err(|e| Fault::internal(format!("corrupt descriptor: {e}")))?;

        let token = self.lease_token();
        let acquired = self
            .substrate
            .set_nx(
                &keys::lease(session_id),
                &token,
                Some(self.config.lease_ttl),
            )
            .await
            .map_err(Fault::from)?;
        if !acquired {
            return Err(Fault::unavailable(format!(
                "session {session_id} is owned by another node"
            )));
        }

        let resume_from = self.resume_point(session_id).await;
        log::info!("adopting session {session_id} (resume from frame {resume_from})");
        self.start_instance(descriptor, token, resume_from).await?;

        let sessions = self.sessions.read().await;
        let s = sessions
            .get(session_id)
            .ok_or_else(|| Fault::internal("instance vanished during adoption"))?;
        Ok((s.tx.clone(), Arc::clone(&s.exec_busy)))
    }

    async fn attach_relay(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<RelayItem>, Fault> {
        // Subscribe outside the lock; discarded when a relay already runs.
        let mut sub = self
            .substrate
            .subscribe(&keys::frames_channel(session_id))
            .await
            .map_err(Fault::from)?;

        let mut relays = self.relays.lock().expect("relay table poisoned");
        if let Some(relay) = relays.get_mut(session_id) {
            relay.refs += 1;
            return Ok(relay.tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(self.config.frame_backpressure.max(1));
        let forward = tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                let item = match event {
                    SubEvent::Message(payload) => RelayItem::Payload(payload),
                    SubEvent::Lagged(n) => RelayItem::Dropped(n),
                };
                if forward.send(item).is_err() {
                    break;
                }
            }
        });
        relays.insert(
            session_id.to_string(),
            Relay { tx, refs: 1, task },
        );
        Ok(rx)
    }
}

/// A live frame stream subscription.
///
/// Yields frames in strictly increasing `frame_index` order with explicit
/// [`StreamItem::Dropped`] markers where backpressure discarded payloads.
pub struct FrameStream {
    session_id: String,
    replay: VecDeque<StreamItem>,
    rx: broadcast::Receiver<RelayItem>,
    /// Frames at or below this index were already served from the ring
    /// replay; live duplicates of them are skipped. Cleared at the first
    /// newer frame so a later `reset` (which restarts numbering at 0) is
    /// not mistaken for a duplicate.
    dedup_until: Option<u64>,
    relays: RelayMap,
    detached: bool,
}

impl FrameStream {
    /// Next item, or `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if let Some(item) = self.replay.pop_front() {
            return Some(item);
        }
        loop {
            match self.rx.recv().await {
                Ok(RelayItem::Payload(payload)) => match decode_channel_payload(&payload) {
                    Some(StreamItem::Frame(frame)) => {
                        if let Some(limit) = self.dedup_until {
                            if frame.frame_index <= limit {
                                continue;
                            }
                            self.dedup_until = None;
                        }
                        return Some(StreamItem::Frame(frame));
                    }
                    Some(item) => return Some(item),
                    None => continue,
                },
                Ok(RelayItem::Dropped(n)) => return Some(StreamItem::Dropped(n)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(StreamItem::Dropped(n))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Detach from the node's relay; the node unsubscribes from the
    /// substrate channel when the last subscriber is gone.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let mut relays = self.relays.lock().expect("relay table poisoned");
        if let Some(relay) = relays.get_mut(&self.session_id) {
            relay.refs = relay.refs.saturating_sub(1);
            if relay.refs == 0 {
                relay.task.abort();
                relays.remove(&self.session_id);
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.release();
    }
}
