//! Error types for render dispatch
//!
//! Every failure a caller can observe maps onto one of these variants so
//! clients can tell "try again later" apart from "fix your input" apart
//! from "this specific job failed".

use std::time::Duration;
use thiserror::Error;

/// Result type alias for render operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Error types surfaced by the pool, router and gateway
///
/// `Clone` because a call's failure also resolves the shared futures of its
/// dependents during pipelined dispatch.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// No engine instance became available before the acquisition deadline
    #[error("render capacity exceeded, retry after {}ms", retry_after.as_millis())]
    CapacityExceeded {
        /// Suggested client backoff before the next attempt
        retry_after: Duration,
    },

    /// The engine process died or became unresponsive mid-render
    #[error("engine instance crashed during render: {0}")]
    InstanceCrash(String),

    /// The render itself failed; the engine stayed healthy
    #[error("render failed: {0}")]
    RenderFailed(String),

    /// A new engine process failed to initialize
    #[error("engine instance failed to start: {0}")]
    CreationFailure(String),

    /// Input rejected before it ever reached the pool
    #[error("invalid render request: {0}")]
    Validation(String),

    /// A call's dependency failed, so the call was never dispatched
    #[error("dependency '{dependency}' failed, call not dispatched")]
    DependencyFailed {
        /// Identifier of the failed upstream call
        dependency: String,
    },

    /// The client connection went away while calls were still pending
    #[error("connection lost before call was dispatched")]
    ConnectionLost,

    /// The shard's mailbox is closed (shutdown or worker death)
    #[error("render pool unavailable: {0}")]
    PoolUnavailable(String),
}

impl RenderError {
    /// Check if the error is transient and worth retrying with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::CapacityExceeded { .. } | RenderError::PoolUnavailable(_)
        )
    }

    /// Suggested backoff for retryable errors
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RenderError::CapacityExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable machine-readable tag used in wire responses
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::CapacityExceeded { .. } => "capacity_exceeded",
            RenderError::InstanceCrash(_) => "instance_crash",
            RenderError::RenderFailed(_) => "render_failed",
            RenderError::CreationFailure(_) => "creation_failure",
            RenderError::Validation(_) => "validation",
            RenderError::DependencyFailed { .. } => "dependency_failed",
            RenderError::ConnectionLost => "connection_lost",
            RenderError::PoolUnavailable(_) => "pool_unavailable",
        }
    }
}

impl From<anyhow::Error> for RenderError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        RenderError::PoolUnavailable(format!("{err:#}"))
    }
}
