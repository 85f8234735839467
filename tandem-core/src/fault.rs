//! Error taxonomy shared by every component.
//!
//! A [`Fault`] is the only error type that crosses crate boundaries. Each
//! carries a [`FaultKind`] so the gateway can map it to a status code and the
//! client can decide whether a retry is worthwhile.

use serde::{Deserialize, Serialize};

/// Language-neutral failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Addressed entity absent (session, client, document).
    NotFound,
    /// Uniqueness violation (second create for the same session).
    AlreadyExists,
    /// Rejected because of an in-flight operation (execute while executing).
    Busy,
    /// Malformed request, bad model reference, unknown control verb.
    InvalidInput,
    /// Control verb not legal in the current session state.
    InvalidTransition,
    /// Missing or rejected credentials.
    Unauthorized,
    /// Rate limit exceeded.
    TooManyRequests,
    /// Operation exceeded its deadline.
    DeadlineExceeded,
    /// Engine or node reports partial failure; reads may be stale.
    Degraded,
    /// Substrate or dependency unreachable.
    Unavailable,
    /// Unexpected defect.
    Internal,
}

impl FaultKind {
    /// Whether a caller is encouraged to retry with backoff.
    pub fn retriable(self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::Unavailable | Self::Busy
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Busy => "busy",
            Self::InvalidInput => "invalid_input",
            Self::InvalidTransition => "invalid_transition",
            Self::Unauthorized => "unauthorized",
            Self::TooManyRequests => "too_many_requests",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

/// A classified failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(FaultKind::NotFound, format!("{what} not found"))
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Self::new(FaultKind::AlreadyExists, format!("{what} already exists"))
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Busy, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidInput, message)
    }

    pub fn transition(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidTransition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Unavailable, message)
    }

    pub fn deadline(message: impl Into<String>) -> Self {
        Self::new(FaultKind::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }

    /// Whether the caller may retry.
    pub fn retriable(&self) -> bool {
        self.kind.retriable()
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for Fault {}
