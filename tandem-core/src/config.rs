//! Runtime configuration for a Tandem node.
//!
//! Every knob comes from the environment so nodes are configured the same
//! way in containers and in integration tests. `SUBSTRATE_URL` is the only
//! required variable; everything else has a production default.

use std::time::Duration;

/// Normal shutdown.
pub const EXIT_OK: i32 = 0;
/// Fatal configuration problem (missing/invalid environment).
pub const EXIT_CONFIG: i32 = 1;
/// Substrate unreachable at startup.
pub const EXIT_SUBSTRATE: i32 = 2;

/// Configuration error raised while reading the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(var) => write!(f, "required environment variable {var} is not set"),
            Self::Invalid(var, value) => write!(f, "environment variable {var} has invalid value {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Node-wide configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Substrate endpoint, e.g. `mem://local`.
    pub substrate_url: String,
    /// Stable identity of this node in the cluster.
    pub node_id: String,
    /// Address the gateway binds to.
    pub bind_addr: String,
    /// Interval between server heartbeats and client TTL refreshes.
    pub heartbeat_interval: Duration,
    /// TTL of the per-session ownership lease.
    pub lease_ttl: Duration,
    /// Frames buffered per stream subscriber before the oldest are dropped.
    pub frame_backpressure: usize,
    /// Wall-clock cap on a single user-code execution.
    pub exec_wall_clock: Duration,
    /// Secret used to verify bearer tokens at the edge.
    pub auth_secret: String,
}

impl NodeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let substrate_url =
            std::env::var("SUBSTRATE_URL").map_err(|_| ConfigError::Missing("SUBSTRATE_URL"))?;

        let node_id = match std::env::var("NODE_ID") {
            Ok(id) if !id.is_empty() => id,
            _ => generated_node_id(),
        };

        Ok(Self {
            substrate_url,
            node_id,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            heartbeat_interval: duration_ms("HEARTBEAT_INTERVAL_MS", 5_000)?,
            lease_ttl: duration_ms("LEASE_TTL_MS", 15_000)?,
            frame_backpressure: parse_var("FRAME_BACKPRESSURE", 4)?,
            exec_wall_clock: duration_ms("EXEC_WALL_CLOCK_MS", 60_000)?,
            auth_secret: std::env::var("AUTH_SECRET")
                .unwrap_or_else(|_| "tandem-dev-secret".to_string()),
        })
    }

    /// A config suitable for tests: memory substrate, short timers.
    pub fn for_tests(substrate_url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            substrate_url: substrate_url.into(),
            node_id: node_id.into(),
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_millis(400),
            frame_backpressure: 4,
            exec_wall_clock: Duration::from_secs(5),
            auth_secret: "test-secret".to_string(),
        }
    }
}

fn generated_node_id() -> String {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen_range(0x1000..0xFFFF_FFFF);
    format!("node-{suffix:08x}")
}

fn duration_ms(var: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_var(var, default_ms)?))
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(var, raw.clone())),
        Err(_) => Ok(default),
    }
}
