#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Status reporter. Reads system memory and the run counters on its own
//! cadence; the allocation loop never waits on it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MIB;
use crate::domain::{CurrentCounters, RunController, RunState};
use crate::error::SqueezeError;
use crate::guard::{MemoryProbe, SystemMemory};
use crate::metrics::Metrics;

pub const REFRESH_PERIOD: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub ts_seconds: i64,
    pub state: RunState,
    pub system: SystemMemory,
    pub used_percent: f64,
    pub retained_bytes: u64,
    pub allocations: u64,
    pub workers: u64,
    pub target_bytes: u64,
    pub progress_percent: f64,
}

pub struct StatusReporter {
    probe: Mutex<Box<dyn MemoryProbe>>,
    ctrl: RunController,
    counters: CurrentCounters,
}

impl StatusReporter {
    pub fn new(
        probe: Box<dyn MemoryProbe>,
        ctrl: RunController,
        counters: CurrentCounters,
    ) -> Self {
        Self {
            probe: Mutex::new(probe),
            ctrl,
            counters,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> Result<MetricsSnapshot, SqueezeError> {
        let system = self.probe.lock().sample()?;
        let status = self.ctrl.status();
        let counters = self.counters.get();
        let retained_bytes = counters.retained();
        let progress_percent = if status.target_bytes == 0 {
            0.0
        } else {
            (retained_bytes as f64 * 100.0 / status.target_bytes as f64).min(100.0)
        };
        Ok(MetricsSnapshot {
            ts_seconds: chrono::Utc::now().timestamp(),
            state: status.state,
            used_percent: system.used_percent(),
            system,
            retained_bytes,
            allocations: counters.allocation_count(),
            workers: counters.workers(),
            target_bytes: status.target_bytes,
            progress_percent,
        })
    }

    /// Periodically pushes snapshots into the Prometheus gauges.
    pub fn spawn_refresh(
        self: Arc<Self>,
        metrics: Metrics,
        period: Duration,
        show_progress: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.snapshot() {
                    Ok(snap) => {
                        metrics.observe(&snap);
                        if show_progress && snap.state == RunState::Running {
                            info!(
                                retained_mb = snap.retained_bytes / MIB,
                                available_mb = snap.system.available_bytes / MIB,
                                progress = format!("{:.1}", snap.progress_percent),
                                "progress"
                            );
                        }
                    }
                    Err(e) => warn!(error=%e, "status refresh failed"),
                }
            }
        })
    }
}
