#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! The run context: owns one squeeze run at a time and drives it through
//! the run state machine.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{RunConfig, MIB};
use crate::controller::{
    run_session, LoopExit, RateController, SessionOutcome, StopMode, StopSignal,
};
use crate::domain::{
    CurrentCounters, RunController, RunCounters, RunState, RunStatus, StartRequest,
};
use crate::error::SqueezeError;
use crate::guard::{MemoryProbe, SysinfoProbe, SystemMemory};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::reporter::StatusReporter;
use crate::validation::validate_start;

pub type ProbeFactory = Arc<dyn Fn() -> Box<dyn MemoryProbe> + Send + Sync>;

enum ActiveRun {
    Local(std::thread::JoinHandle<SessionOutcome>),
    Pool(WorkerPool),
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone)]
pub struct SqueezeRunner {
    config: RunConfig,
    ctrl: RunController,
    counters: CurrentCounters,
    metrics: Metrics,
    probe: ProbeFactory,
    worker_program: Option<PathBuf>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    signal: Arc<Mutex<Option<Arc<StopSignal>>>>,
}

impl SqueezeRunner {
    pub fn new(config: RunConfig, metrics: Metrics) -> Self {
        Self {
            config,
            ctrl: RunController::default(),
            counters: CurrentCounters::default(),
            metrics,
            probe: Arc::new(|| Box::new(SysinfoProbe::new()) as Box<dyn MemoryProbe>),
            worker_program: None,
            active: Arc::new(Mutex::new(None)),
            signal: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the source of system memory readings.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeFactory) -> Self {
        self.probe = probe;
        self
    }

    /// Executable started for each worker; defaults to the current one.
    #[must_use]
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[must_use]
    pub fn controller(&self) -> RunController {
        self.ctrl.clone()
    }

    #[must_use]
    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.get()
    }

    #[must_use]
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new((self.probe)(), self.ctrl.clone(), self.counters.clone())
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn target_bytes(&self, mem: &SystemMemory) -> u64 {
        let workers = self.config.workers.unwrap_or(1) as u64;
        let ceiling = self.config.memory_limit.saturating_mul(workers);
        let headroom =
            (mem.available_bytes as f64 * (1.0 - self.config.reserve_percent / 100.0)) as u64;
        ceiling.min(headroom)
    }

    /// Starts a run once the confirmation gate passes.
    pub fn start(&self, req: &StartRequest) -> Result<RunStatus, SqueezeError> {
        let mem = (self.probe)().sample()?;
        validate_start(req, &mem)?;
        let target = self.target_bytes(&mem);

        let mut active = self.active.lock();
        self.ctrl.begin(target, now_ts())?;
        let counters = self.counters.renew();
        self.metrics.runs_total.inc();
        info!(
            target_mb = target / MIB,
            block_size = self.config.block_size,
            rate = self.config.allocations_per_second,
            reserve_percent = self.config.reserve_percent,
            limit_mb = self.config.memory_limit / MIB,
            workers = self.config.workers,
            "squeeze started"
        );

        let launched = match self.config.workers {
            None => self.launch_local(counters).map(ActiveRun::Local),
            Some(count) => self.launch_pool(count, counters).map(ActiveRun::Pool),
        };
        match launched {
            Ok(run) => {
                *active = Some(run);
                Ok(self.status())
            }
            Err(e) => {
                error!(error=%e, "squeeze could not start");
                self.ctrl.mark_halted(e.to_string(), false);
                let now = now_ts();
                self.ctrl.transition_from(RunState::Running, RunState::Stopping, now);
                self.ctrl.transition_from(RunState::Stopping, RunState::Stopped, now);
                Err(e)
            }
        }
    }

    fn launch_local(
        &self,
        counters: Arc<RunCounters>,
    ) -> Result<std::thread::JoinHandle<SessionOutcome>, SqueezeError> {
        let stop = StopSignal::new();
        *self.signal.lock() = Some(stop.clone());
        let controller = RateController::new(&self.config, (self.probe)(), counters);
        let ctrl = self.ctrl.clone();
        let metrics = self.metrics.clone();
        std::thread::Builder::new()
            .name("squeeze-loop".into())
            .spawn(move || {
                let outcome = run_session(controller, &stop, |exit| {
                    on_loop_exit(&ctrl, &metrics, exit);
                });
                if outcome.exit.stops_automatically() {
                    ctrl.transition_from(RunState::Stopping, RunState::Stopped, now_ts());
                    info!(peak = outcome.peak_retained, "squeeze stopped automatically");
                }
                outcome
            })
            .map_err(|source| SqueezeError::WorkerSpawnFailure { index: 0, source })
    }

    fn launch_pool(
        &self,
        count: usize,
        counters: Arc<RunCounters>,
    ) -> Result<WorkerPool, SqueezeError> {
        *self.signal.lock() = None;
        let program = match &self.worker_program {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .map_err(|source| SqueezeError::WorkerSpawnFailure { index: 0, source })?,
        };
        let pool = WorkerPool::spawn(
            &program,
            &self.config,
            count,
            counters,
            self.ctrl.clone(),
        )?;
        if pool.len() < count {
            warn!(requested = count, started = pool.len(), "running with fewer workers");
        }
        Ok(pool)
    }

    /// Graceful stop: halts allocation, releases everything, waits for it.
    pub async fn stop(&self) -> Result<RunStatus, SqueezeError> {
        if !self
            .ctrl
            .transition_from(RunState::Running, RunState::Stopping, now_ts())
        {
            return Err(SqueezeError::NotRunning(self.ctrl.current()));
        }
        info!("graceful stop requested");
        if let Some(signal) = self.signal.lock().as_ref() {
            signal.request(StopMode::Graceful);
        }
        let active = self.active.lock().take();
        match active {
            Some(ActiveRun::Local(thread)) => {
                match tokio::task::spawn_blocking(move || thread.join()).await {
                    Ok(Ok(outcome)) => info!(
                        peak = outcome.peak_retained,
                        allocations = outcome.allocations,
                        "allocation loop joined"
                    ),
                    Ok(Err(_)) => error!("allocation loop panicked"),
                    Err(e) => error!(error=%e, "join allocation loop failed"),
                }
            }
            Some(ActiveRun::Pool(pool)) => pool.shutdown().await,
            None => {}
        }
        if self
            .ctrl
            .transition_from(RunState::Stopping, RunState::Stopped, now_ts())
        {
            info!("squeeze stopped");
        }
        Ok(self.status())
    }

    /// Emergency stop: abandons retained memory and does not wait.
    pub fn emergency_stop(&self) -> Result<RunStatus, SqueezeError> {
        let from = self
            .ctrl
            .transition(RunState::EmergencyStopped, now_ts())
            .map_err(|_| SqueezeError::NotRunning(self.ctrl.current()))?;
        warn!(from=%from, "emergency stop");
        if let Some(signal) = self.signal.lock().take() {
            signal.request(StopMode::Emergency);
        }
        match self.active.lock().take() {
            Some(ActiveRun::Local(thread)) => drop(thread),
            Some(ActiveRun::Pool(pool)) => pool.kill(),
            None => {}
        }
        Ok(self.status())
    }

    /// Returns a finished run to `Idle`.
    pub fn reset(&self) -> Result<RunStatus, SqueezeError> {
        self.ctrl.transition(RunState::Idle, now_ts())?;
        self.counters.renew();
        Ok(self.status())
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        let mut st = self.ctrl.status();
        let counters = self.counters.get();
        st.retained_bytes = counters.retained();
        st.allocations = counters.allocation_count();
        st.workers = counters.workers();
        st
    }

    /// Tears the run context down, stopping an active run gracefully.
    pub async fn shutdown(self) {
        match self.ctrl.current() {
            RunState::Running => {
                if let Err(e) = self.stop().await {
                    warn!(error=%e, "stop during shutdown failed");
                }
            }
            RunState::Stopping => warn!("shutdown while a stop is in progress"),
            _ => {}
        }
    }

    pub fn encode_metrics(&self) -> anyhow::Result<Vec<u8>> {
        self.metrics.encode_text()
    }

    pub fn health(&self) -> HealthReport {
        let st = self.status();
        let workers = self.config.workers.unwrap_or(1) as u64;
        let per_process = self.config.memory_limit.saturating_add(self.config.block_size);
        let within_limits = st.state == RunState::EmergencyStopped
            || st.retained_bytes <= per_process.saturating_mul(workers);
        let timestamps_ok = match (st.started_ts_seconds, st.ended_ts_seconds) {
            (Some(start), Some(end)) => end >= start,
            _ => true,
        };
        let invariants_ok = within_limits && timestamps_ok;
        let metrics_ok = self.metrics.encode_text().is_ok();
        let registry_metrics = self.metrics.registry.gather().len();
        let status = if metrics_ok && invariants_ok {
            "ok"
        } else {
            "degraded"
        };
        HealthReport {
            status: status.to_string(),
            state: st.state,
            metrics_ok,
            registry_metrics,
            invariants_ok,
        }
    }
}

fn on_loop_exit(ctrl: &RunController, metrics: &Metrics, exit: &LoopExit) {
    let Some(reason) = exit.reason() else {
        return;
    };
    if let LoopExit::Halted(_) = exit {
        metrics.guard_breaches_total.inc();
    }
    if exit.stops_automatically() {
        ctrl.mark_halted(reason, false);
        ctrl.transition_from(RunState::Running, RunState::Stopping, now_ts());
    } else {
        ctrl.mark_halted(reason, true);
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub state: RunState,
    pub metrics_ok: bool,
    pub registry_metrics: usize,
    pub invariants_ok: bool,
}
