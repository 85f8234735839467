//! Engine driver seam.
//!
//! The service never links a physics engine; it consumes the small
//! [`EngineDriver`] capability set and treats every call as blocking. Each
//! simulation instance owns a [`DriverWorker`]: a dedicated OS thread that
//! holds the engine handle exclusively, fed through a command channel with
//! oneshot replies and a per-call deadline. No other task ever touches the
//! handle.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::Fault;
use tokio::sync::oneshot;

/// Supported engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    MuJoCo,
    PyBullet,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MuJoCo => "mujoco",
            Self::PyBullet => "pybullet",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mujoco" => Ok(Self::MuJoCo),
            "pybullet" => Ok(Self::PyBullet),
            other => Err(Fault::invalid(format!("unknown engine: {other}"))),
        }
    }
}

/// Physics state snapshot returned by driver calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub sim_time: f64,
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
}

/// Driver-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The model reference cannot be loaded.
    BadModel(String),
    /// A call failed inside the engine.
    Call(String),
    /// A call exceeded its deadline.
    Deadline,
    /// The worker thread is gone.
    Disposed,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadModel(m) => write!(f, "model cannot be loaded: {m}"),
            Self::Call(m) => write!(f, "engine call failed: {m}"),
            Self::Deadline => write!(f, "engine call exceeded its deadline"),
            Self::Disposed => write!(f, "engine driver disposed"),
        }
    }
}

impl std::error::Error for DriverError {}

/// The minimal capability set the service consumes.
///
/// Calls are synchronous and may block; they only ever run on the worker
/// thread. `load` is called once at startup and once more for the single
/// recovery attempt after a failure.
pub trait EngineDriver: Send + 'static {
    fn load(
        &mut self,
        model_ref: &str,
        width: u32,
        height: u32,
        headless: bool,
    ) -> Result<(), DriverError>;

    fn reset(&mut self) -> Result<EngineState, DriverError>;

    fn step(&mut self, action: &[f64]) -> Result<EngineState, DriverError>;

    fn render(&mut self) -> Result<Vec<u8>, DriverError>;

    fn dispose(&mut self);

    /// Physics timestep the control loop ticks at.
    fn timestep(&self) -> Duration {
        Duration::from_millis(1000 / 60)
    }
}

enum DriverCmd {
    Load {
        model_ref: String,
        width: u32,
        height: u32,
        headless: bool,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<EngineState, DriverError>>,
    },
    Step {
        action: Vec<f64>,
        reply: oneshot::Sender<Result<EngineState, DriverError>>,
    },
    Render {
        reply: oneshot::Sender<Result<Vec<u8>, DriverError>>,
    },
    Timestep {
        reply: oneshot::Sender<Duration>,
    },
}

/// Async handle onto the driver-owned worker thread.
pub struct DriverWorker {
    tx: std::sync::mpsc::Sender<DriverCmd>,
    call_deadline: Duration,
}

impl DriverWorker {
    /// Move `driver` onto its own thread and return the async handle.
    pub fn spawn(mut driver: Box<dyn EngineDriver>, call_deadline: Duration) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<DriverCmd>();
        std::thread::Builder::new()
            .name("engine-driver".to_string())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        DriverCmd::Load {
                            model_ref,
                            width,
                            height,
                            headless,
                            reply,
                        } => {
                            let _ = reply.send(driver.load(&model_ref, width, height, headless));
                        }
                        DriverCmd::Reset { reply } => {
                            let _ = reply.send(driver.reset());
                        }
                        DriverCmd::Step { action, reply } => {
                            let _ = reply.send(driver.step(&action));
                        }
                        DriverCmd::Render { reply } => {
                            let _ = reply.send(driver.render());
                        }
                        DriverCmd::Timestep { reply } => {
                            let _ = reply.send(driver.timestep());
                        }
                    }
                }
                // Channel closed: the owning control loop is gone.
                driver.dispose();
            })
            .expect("failed to spawn engine driver thread");
        Self { tx, call_deadline }
    }

    async fn call<T>(
        &self,
        cmd: DriverCmd,
        rx: oneshot::Receiver<Result<T, DriverError>>,
    ) -> Result<T, DriverError> {
        self.tx.send(cmd).map_err(|_| DriverError::Disposed)?;
        match tokio::time::timeout(self.call_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::Disposed),
            Err(_) => Err(DriverError::Deadline),
        }
    }

    pub async fn load(
        &self,
        model_ref: &str,
        width: u32,
        height: u32,
        headless: bool,
    ) -> Result<(), DriverError> {
        let (reply, rx) = oneshot::channel();
        self.call(
            DriverCmd::Load {
                model_ref: model_ref.to_string(),
                width,
                height,
                headless,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn reset(&self) -> Result<EngineState, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.call(DriverCmd::Reset { reply }, rx).await
    }

    pub async fn step(&self, action: Vec<f64>) -> Result<EngineState, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.call(DriverCmd::Step { action, reply }, rx).await
    }

    pub async fn render(&self) -> Result<Vec<u8>, DriverError> {
        let (reply, rx) = oneshot::channel();
        self.call(DriverCmd::Render { reply }, rx).await
    }

    pub async fn timestep(&self) -> Duration {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DriverCmd::Timestep { reply }).is_err() {
            return Duration::from_millis(1000 / 60);
        }
        rx.await.unwrap_or(Duration::from_millis(1000 / 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowDriver;

    impl EngineDriver for SlowDriver {
        fn load(&mut self, _: &str, _: u32, _: u32, _: bool) -> Result<(), DriverError> {
            Ok(())
        }
        fn reset(&mut self) -> Result<EngineState, DriverError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(EngineState::default())
        }
        fn step(&mut self, _: &[f64]) -> Result<EngineState, DriverError> {
            Ok(EngineState::default())
        }
        fn render(&mut self) -> Result<Vec<u8>, DriverError> {
            Ok(vec![0])
        }
        fn dispose(&mut self) {}
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!("mujoco".parse::<EngineKind>().unwrap(), EngineKind::MuJoCo);
        assert_eq!(
            "pybullet".parse::<EngineKind>().unwrap(),
            EngineKind::PyBullet
        );
        assert!("gazebo".parse::<EngineKind>().is_err());
    }

    #[tokio::test]
    async fn test_worker_call_roundtrip() {
        let worker = DriverWorker::spawn(Box::new(SlowDriver), Duration::from_secs(1));
        worker.load("m", 64, 48, true).await.unwrap();
        let state = worker.step(vec![0.0]).await.unwrap();
        assert_eq!(state.sim_time, 0.0);
    }

    #[tokio::test]
    async fn test_worker_call_deadline() {
        let worker = DriverWorker::spawn(Box::new(SlowDriver), Duration::from_millis(20));
        let err = worker.reset().await.unwrap_err();
        assert_eq!(err, DriverError::Deadline);
    }
}
