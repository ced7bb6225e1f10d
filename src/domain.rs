#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SqueezeError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
    EmergencyStopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => f.write_str("IDLE"),
            RunState::Running => f.write_str("RUNNING"),
            RunState::Stopping => f.write_str("STOPPING"),
            RunState::Stopped => f.write_str("STOPPED"),
            RunState::EmergencyStopped => f.write_str("EMERGENCY_STOPPED"),
        }
    }
}

impl RunState {
    #[must_use]
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::{EmergencyStopped, Idle, Running, Stopped, Stopping};
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Running | Stopping, EmergencyStopped)
                | (Stopped | EmergencyStopped, Idle)
        )
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Stopping)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::EmergencyStopped)
    }
}

/// Lock-free tallies shared between the allocation side and readers.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub retained_bytes: AtomicU64,
    pub allocations: AtomicU64,
    pub workers_active: AtomicU64,
}

impl RunCounters {
    #[must_use]
    pub fn retained(&self) -> u64 {
        self.retained_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn workers(&self) -> u64 {
        self.workers_active.load(Ordering::Acquire)
    }
}

/// The counters of the current run. Every start installs fresh counters, so
/// a loop still unwinding from an abandoned run writes only into its own.
#[derive(Clone, Default)]
pub struct CurrentCounters {
    cell: Arc<Mutex<Arc<RunCounters>>>,
}

impl CurrentCounters {
    #[must_use]
    pub fn get(&self) -> Arc<RunCounters> {
        self.cell.lock().clone()
    }

    pub fn renew(&self) -> Arc<RunCounters> {
        let fresh = Arc::new(RunCounters::default());
        *self.cell.lock() = fresh.clone();
        fresh
    }
}

/// Start command as sent by the display layer once the operator has
/// confirmed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub confirmed: bool,
    #[serde(default)]
    pub acknowledge_low_memory: bool,
}

impl StartRequest {
    #[must_use]
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            acknowledge_low_memory: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub started_ts_seconds: Option<i64>,
    pub ended_ts_seconds: Option<i64>,
    pub target_bytes: u64,
    pub retained_bytes: u64,
    pub allocations: u64,
    pub workers: u64,
    /// Set once a ceiling is hit; the run keeps its memory until stopped.
    pub holding: bool,
    pub halt_reason: Option<String>,
}

/// Owner of the run state machine. Cloned into every task that needs to
/// observe or advance the state.
#[derive(Clone, Default)]
pub struct RunController {
    pub state: Arc<Mutex<RunStatus>>,
}

impl RunController {
    #[must_use]
    pub fn current(&self) -> RunState {
        self.state.lock().state
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.state.lock().clone()
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, next: RunState, now_ts: i64) -> Result<RunState, SqueezeError> {
        step(&mut self.state.lock(), next, now_ts)
    }

    /// Moves to `next` only if the machine is currently in `expected`.
    pub fn transition_from(&self, expected: RunState, next: RunState, now_ts: i64) -> bool {
        let mut st = self.state.lock();
        st.state == expected && step(&mut st, next, now_ts).is_ok()
    }

    /// Enters `Running`. A finished run is first reset through `Idle`; both
    /// steps happen under one lock so no reader sees the intermediate state.
    pub fn begin(&self, target_bytes: u64, now_ts: i64) -> Result<(), SqueezeError> {
        let mut st = self.state.lock();
        if st.state.is_active() {
            return Err(SqueezeError::AlreadyActive(st.state));
        }
        if st.state.is_terminal() {
            let from = step(&mut st, RunState::Idle, now_ts)?;
            tracing::debug!(from=%from, "reset run to IDLE");
            *st = RunStatus::default();
        }
        step(&mut st, RunState::Running, now_ts)?;
        st.started_ts_seconds = Some(now_ts);
        st.target_bytes = target_bytes;
        Ok(())
    }

    pub fn mark_halted(&self, reason: String, holding: bool) {
        let mut st = self.state.lock();
        st.holding = holding;
        st.halt_reason = Some(reason);
    }
}

fn step(st: &mut RunStatus, next: RunState, now_ts: i64) -> Result<RunState, SqueezeError> {
    let from = st.state;
    if !from.can_transition_to(next) {
        return Err(SqueezeError::InvalidTransition { from, to: next });
    }
    st.state = next;
    if next.is_terminal() {
        st.ended_ts_seconds = Some(now_ts);
    }
    Ok(from)
}
