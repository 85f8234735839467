//! Connection lifecycle state machine with bounded exponential backoff.
//!
//! Lifecycle:
//! ```text
//! Idle ──start()──▶ Connecting ──on_open()──▶ Open
//!   ▲                    │                      │
//!   │               on_failure()           on_closed()
//!   │                    ▼                      │
//! close()           Backoff(n) ◀────────────────┘
//!   │                    │ delay elapsed, retry
//!   └── Closed ◀─────────┘ attempts exhausted
//! ```
//!
//! The machine is deliberately passive: callers drive it with events and ask
//! it how long to sleep. That keeps it testable without a socket in sight.

use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter {
            // 50%..100% of the nominal delay, so herds of clients spread out.
            use rand::Rng;
            let factor = 0.5 + rand::thread_rng().gen_range(0.0..0.5);
            exp.mul_f64(factor)
        } else {
            exp
        }
    }

    /// Whether the given attempt number is still within bounds.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Observable connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Connecting,
    Open,
    /// Waiting to retry; carries the 0-based attempt number.
    Backoff(u32),
    /// Attempts exhausted or explicitly closed.
    Closed,
}

/// The reconnect state machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: BackoffPolicy,
    state: ReconnectState,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::Idle,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Begin a connection attempt.
    pub fn start(&mut self) {
        if self.state != ReconnectState::Closed {
            self.state = ReconnectState::Connecting;
        }
    }

    /// The transport reported an established connection.
    pub fn on_open(&mut self) {
        self.state = ReconnectState::Open;
        self.attempt = 0;
    }

    /// The transport failed to connect or an open connection dropped.
    ///
    /// Returns the delay to sleep before the next attempt, or `None` when
    /// the policy is exhausted (the machine moves to `Closed`).
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.state == ReconnectState::Closed {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        if self.policy.should_retry(self.attempt) {
            self.state = ReconnectState::Backoff(self.attempt);
            self.attempt += 1;
            Some(delay)
        } else {
            self.state = ReconnectState::Closed;
            None
        }
    }

    /// Deliberate shutdown; no further retries.
    pub fn close(&mut self) {
        self.state = ReconnectState::Closed;
    }

    /// Reset to a fresh machine (e.g. after a user-requested reconnect).
    pub fn reset(&mut self) {
        self.state = ReconnectState::Idle;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = no_jitter(10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(7), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = BackoffPolicy {
            jitter: true,
            ..no_jitter(10)
        };
        for attempt in 0..4 {
            let nominal = no_jitter(10).delay_for(attempt);
            let jittered = policy.delay_for(attempt);
            assert!(jittered >= nominal.mul_f64(0.5));
            assert!(jittered <= nominal);
        }
    }

    #[test]
    fn test_lifecycle_open_resets_attempts() {
        let mut machine = Reconnector::new(no_jitter(5));
        assert_eq!(machine.state(), ReconnectState::Idle);

        machine.start();
        assert_eq!(machine.state(), ReconnectState::Connecting);
        assert!(machine.on_failure().is_some());
        assert_eq!(machine.state(), ReconnectState::Backoff(0));
        machine.start();
        machine.on_open();
        assert_eq!(machine.state(), ReconnectState::Open);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn test_exhaustion_closes() {
        let mut machine = Reconnector::new(no_jitter(2));
        machine.start();
        assert!(machine.on_failure().is_some());
        assert!(machine.on_failure().is_some());
        assert!(machine.on_failure().is_none());
        assert_eq!(machine.state(), ReconnectState::Closed);
        // Closed is sticky against further events.
        machine.start();
        assert_eq!(machine.state(), ReconnectState::Closed);
        assert!(machine.on_failure().is_none());
    }

    #[test]
    fn test_reset_after_close() {
        let mut machine = Reconnector::new(no_jitter(1));
        machine.close();
        machine.reset();
        assert_eq!(machine.state(), ReconnectState::Idle);
        assert_eq!(machine.attempt(), 0);
    }
}
