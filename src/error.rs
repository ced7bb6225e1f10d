#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use thiserror::Error;

use crate::domain::RunState;

#[derive(Debug, Error)]
pub enum SqueezeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("allocation of {requested} bytes refused by the system")]
    ResourceExhaustion { requested: u64 },

    #[error("system memory metrics unavailable: {0}")]
    MetricsUnavailable(String),

    #[error("worker process {index} failed to start: {source}")]
    WorkerSpawnFailure {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("start requires explicit confirmation")]
    NotConfirmed,

    #[error("only {available_mb} MB available; low-memory start must be acknowledged")]
    LowMemoryUnacknowledged { available_mb: u64 },

    #[error("a run is already active ({0})")]
    AlreadyActive(RunState),

    #[error("no run is active ({0})")]
    NotRunning(RunState),

    #[error("invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl SqueezeError {
    /// Gate failures and lifecycle misuse are the caller's fault, not the system's.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotConfirmed
                | Self::LowMemoryUnacknowledged { .. }
                | Self::AlreadyActive(_)
                | Self::NotRunning(_)
                | Self::InvalidTransition { .. }
        )
    }
}
