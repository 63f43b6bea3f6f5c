//! Structured error types for Kairos.
//!
//! All fallible public APIs return `Result<T, KernelError>`. Scheduling
//! errors (`PastSchedule`, `InvalidTime`, `AlreadyRunning`) are returned
//! synchronously and leave the session usable. Execution errors
//! (`ActionFailure`, `InvalidAdvance`) abort the current run.

use thiserror::Error;

use crate::time::SimTime;

/// The top-level error type for the Kairos simulation kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    // ── Scheduling errors ─────────────────────────────────

    /// Attempted to schedule (or run to) an absolute time before `now`.
    #[error("cannot schedule at t={requested} when current time is t={now}")]
    PastSchedule { requested: SimTime, now: SimTime },

    /// A time or duration was negative, NaN or infinite.
    #[error("invalid time value {0}")]
    InvalidTime(f64),

    /// `run`, `step` or `reset` was called while a run is in progress.
    #[error("simulation is already running")]
    AlreadyRunning,

    // ── Execution errors ──────────────────────────────────

    /// The clock was asked to move backward. Indicates a kernel bug.
    #[error("clock cannot move backward from t={from} to t={to}")]
    InvalidAdvance { from: SimTime, to: SimTime },

    /// An action or process body returned an error.
    #[error("action failed at t={at}: {source}")]
    ActionFailure {
        at: SimTime,
        #[source]
        source: anyhow::Error,
    },

    /// A previous run failed; only `reset` is accepted until then.
    #[error("simulation failed at t={failed_at}; reset it before running again")]
    NeedsReset { failed_at: SimTime },

    // ── Process errors ────────────────────────────────────

    /// A process handle was used after its session was dropped.
    #[error("simulation session is closed")]
    SessionClosed,
}

impl KernelError {
    /// Wraps a collaborator failure observed at simulated time `at`.
    pub fn action(at: SimTime, source: anyhow::Error) -> Self {
        Self::ActionFailure { at, source }
    }

    /// Whether the session can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PastSchedule { .. } | Self::InvalidTime(_) | Self::AlreadyRunning
        )
    }
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;
