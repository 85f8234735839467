//! Session descriptors, status machine, and substrate key layout.

use serde::{Deserialize, Serialize};
use tandem_core::Fault;

use crate::driver::EngineKind;

/// Substrate keys owned by the simulation service.
pub(crate) mod keys {
    pub const INDEX: &str = "sim:index";

    pub fn config(session_id: &str) -> String {
        format!("sim:config:{session_id}")
    }

    pub fn state(session_id: &str) -> String {
        format!("sim:state:{session_id}")
    }

    pub fn lease(session_id: &str) -> String {
        format!("sim:lease:{session_id}")
    }

    pub fn ring(session_id: &str) -> String {
        format!("sim:ring:{session_id}")
    }

    pub fn frames_channel(session_id: &str) -> String {
        format!("frames:{session_id}")
    }

    pub fn exec_channel(session_id: &str) -> String {
        format!("exec:{session_id}")
    }
}

/// Persisted description of a session; enough to rebuild the instance on
/// another node after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub engine: EngineKind,
    pub model_ref: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub headless: bool,
    /// Unix milliseconds.
    pub created_at: u64,
}

impl SessionDescriptor {
    /// Validate the user-facing fields.
    pub fn validate(&self) -> Result<(), Fault> {
        if self.session_id.trim().is_empty() {
            return Err(Fault::invalid("session_id must not be empty"));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(Fault::invalid(format!(
                "fps must be within 1..=240, got {}",
                self.fps
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Fault::invalid(format!(
                "render dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.model_ref.trim().is_empty() {
            return Err(Fault::invalid("model reference must not be empty"));
        }
        Ok(())
    }
}

/// Lifecycle of a session.
///
/// ```text
/// Created ──play──▶ Running ◀──play/pause──▶ Paused
///    │                 │                        │
///    └────────────── delete ────────────────────┘
///                      ▼
///                 Terminated (absorbing)
/// ```
///
/// `Degraded` is an orthogonal flag carried next to the status, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

/// Control verbs accepted by the stream endpoint and `send_control`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlVerb {
    Play,
    Pause,
    Reset,
    Step,
    SetFps(u32),
}

impl ControlVerb {
    /// Parse the text form used on the stream WebSocket:
    /// `play | pause | reset | step | set_fps <n>`.
    pub fn parse(input: &str) -> Result<Self, Fault> {
        let mut parts = input.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let parsed = match verb {
            "play" => Self::Play,
            "pause" => Self::Pause,
            "reset" => Self::Reset,
            "step" => Self::Step,
            "set_fps" => {
                let raw = parts
                    .next()
                    .ok_or_else(|| Fault::invalid("set_fps requires a value"))?;
                let fps: u32 = raw
                    .parse()
                    .map_err(|_| Fault::invalid(format!("set_fps value {raw:?} is not a number")))?;
                if fps == 0 || fps > 240 {
                    return Err(Fault::invalid("set_fps must be within 1..=240"));
                }
                Self::SetFps(fps)
            }
            other => return Err(Fault::invalid(format!("unknown control verb: {other:?}"))),
        };
        if parts.next().is_some() {
            return Err(Fault::invalid(format!("trailing input after {verb:?}")));
        }
        Ok(parsed)
    }
}

/// Client-visible snapshot assembled from the persisted state hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub degraded: bool,
    pub frame_index: u64,
    pub sim_time: f64,
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            session_id: "s1".to_string(),
            engine: EngineKind::MuJoCo,
            model_ref: "cartpole.xml".to_string(),
            width: 64,
            height: 48,
            fps: 30,
            headless: true,
            created_at: 0,
        }
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(descriptor().validate().is_ok());

        let mut bad_fps = descriptor();
        bad_fps.fps = 0;
        assert!(bad_fps.validate().is_err());

        let mut bad_dims = descriptor();
        bad_dims.width = 0;
        assert!(bad_dims.validate().is_err());

        let mut bad_model = descriptor();
        bad_model.model_ref = "  ".to_string();
        assert!(bad_model.validate().is_err());
    }

    #[test]
    fn test_descriptor_json_roundtrip() {
        let desc = descriptor();
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"mujoco\""));
        let back: SessionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            SessionStatus::Created,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Terminated,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("degraded"), None);
        assert!(SessionStatus::Terminated.is_terminal());
    }

    #[test]
    fn test_control_verb_parse() {
        assert_eq!(ControlVerb::parse("play").unwrap(), ControlVerb::Play);
        assert_eq!(ControlVerb::parse("  pause ").unwrap(), ControlVerb::Pause);
        assert_eq!(
            ControlVerb::parse("set_fps 30").unwrap(),
            ControlVerb::SetFps(30)
        );
        assert!(ControlVerb::parse("set_fps").is_err());
        assert!(ControlVerb::parse("set_fps 0").is_err());
        assert!(ControlVerb::parse("set_fps abc").is_err());
        assert!(ControlVerb::parse("warp 9").is_err());
        assert!(ControlVerb::parse("play now").is_err());
    }

    #[test]
    fn test_keys_layout() {
        assert_eq!(keys::config("s1"), "sim:config:s1");
        assert_eq!(keys::lease("s1"), "sim:lease:s1");
        assert_eq!(keys::frames_channel("s1"), "frames:s1");
        assert_eq!(keys::exec_channel("s1"), "exec:s1");
    }
}
