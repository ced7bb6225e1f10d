#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Worker process side of multiprocess mode.
//!
//! stdin carries commands from the parent (`stop`, or EOF). stdout carries
//! one JSON [`WorkerReport`] per line; nothing else may be written there.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::controller::{run_session, LoopExit, RateController, SessionEnd, StopMode, StopSignal};
use crate::domain::RunCounters;
use crate::guard::SysinfoProbe;

pub const REPORT_INTERVAL: Duration = Duration::from_millis(200);
pub const STOP_COMMAND: &str = "stop";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Allocating,
    Holding,
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub index: usize,
    pub retained_bytes: u64,
    pub allocations: u64,
    pub phase: WorkerPhase,
    pub breach: Option<String>,
}

impl WorkerReport {
    pub fn parse(line: &str) -> AnyResult<Self> {
        serde_json::from_str(line.trim()).context("parse worker report")
    }

    pub fn to_line(&self) -> AnyResult<String> {
        serde_json::to_string(self).context("encode worker report")
    }
}

struct ReportState {
    phase: WorkerPhase,
    breach: Option<String>,
}

fn emit(index: usize, counters: &RunCounters, state: &Mutex<ReportState>) -> AnyResult<()> {
    let report = {
        let st = state.lock();
        WorkerReport {
            index,
            retained_bytes: counters.retained(),
            allocations: counters.allocation_count(),
            phase: st.phase,
            breach: st.breach.clone(),
        }
    };
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", report.to_line()?).context("write report")?;
    out.flush().context("flush report")
}

/// Runs one worker to completion. Blocks the calling thread.
pub fn run_worker(index: usize, config: &RunConfig) -> AnyResult<()> {
    let stop = StopSignal::new();
    let counters = Arc::new(RunCounters::default());
    let state = Arc::new(Mutex::new(ReportState {
        phase: WorkerPhase::Allocating,
        breach: None,
    }));
    let done = Arc::new(AtomicBool::new(false));

    {
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("worker-stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(cmd) if cmd.trim() == STOP_COMMAND => break,
                        Ok(other) => warn!(command = other.trim(), "ignoring unknown command"),
                        Err(_) => break,
                    }
                }
                stop.request(StopMode::Graceful);
            })
            .context("spawn stdin listener")?;
    }

    let reporter = {
        let counters = counters.clone();
        let state = state.clone();
        let done = done.clone();
        std::thread::Builder::new()
            .name("worker-report".into())
            .spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if let Err(e) = emit(index, &counters, &state) {
                        warn!(error=%format!("{e:#}"), "report channel closed");
                        return;
                    }
                    std::thread::sleep(REPORT_INTERVAL);
                }
            })
            .context("spawn reporter")?
    };

    info!(index, block_size = config.block_size, limit = config.memory_limit, "worker started");
    let controller = RateController::new(config, SysinfoProbe::new(), counters.clone());
    let outcome = run_session(controller, &stop, |exit| {
        let mut st = state.lock();
        st.breach = exit.reason();
        if let LoopExit::Halted(breach) = exit {
            if breach.is_ceiling() {
                st.phase = WorkerPhase::Holding;
            }
        }
    });

    done.store(true, Ordering::Release);
    let _ = reporter.join();
    if outcome.end == SessionEnd::Released {
        state.lock().phase = WorkerPhase::Released;
        emit(index, &counters, &state)?;
    }
    info!(
        index,
        peak = outcome.peak_retained,
        allocations = outcome.allocations,
        "worker finished"
    );
    Ok(())
}
