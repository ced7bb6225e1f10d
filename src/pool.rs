#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Worker process pool for multiprocess mode.
//!
//! Each child runs its own rate controller and guard. The parent only reads
//! their report lines: one reader task per child forwards reports over a
//! channel to a collector task, which owns the per-worker table and publishes
//! the aggregate into the run counters.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::domain::{RunController, RunCounters, RunState};
use crate::error::SqueezeError;
use crate::worker::{WorkerPhase, WorkerReport, STOP_COMMAND};

#[derive(Debug)]
enum PoolEvent {
    Report(WorkerReport),
    Exited { index: usize },
}

struct WorkerHandle {
    index: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    collector: JoinHandle<()>,
    counters: Arc<RunCounters>,
}

/// Command line for worker `index`, with the run config passed as JSON.
#[must_use]
pub fn worker_command(program: &Path, index: usize, config_json: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("worker")
        .arg("--index")
        .arg(index.to_string())
        .arg("--config-json")
        .arg(config_json)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

impl WorkerPool {
    /// Starts `count` workers running `program worker ...`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(
        program: &Path,
        config: &RunConfig,
        count: usize,
        counters: Arc<RunCounters>,
        ctrl: RunController,
    ) -> Result<Self, SqueezeError> {
        let payload = serde_json::to_string(config)
            .map_err(|e| SqueezeError::Configuration(format!("encode run config: {e}")))?;
        Self::spawn_with(count, counters, ctrl, |index| {
            worker_command(program, index, &payload).spawn()
        })
    }

    /// Starts `count` workers through `launch`, which must hand back a child
    /// with piped stdin and stdout.
    ///
    /// A worker that fails to start is logged and skipped. Fails only when
    /// none could be started.
    pub fn spawn_with<F>(
        count: usize,
        counters: Arc<RunCounters>,
        ctrl: RunController,
        mut launch: F,
    ) -> Result<Self, SqueezeError>
    where
        F: FnMut(usize) -> std::io::Result<Child>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(count);
        let mut last_err = None;

        for index in 0..count {
            let mut child = match launch(index) {
                Ok(child) => child,
                Err(source) => {
                    let err = SqueezeError::WorkerSpawnFailure { index, source };
                    warn!(error=%err, "worker not started, continuing with fewer");
                    last_err = Some(err);
                    continue;
                }
            };
            let stdin = child.stdin.take();
            let reader = match child.stdout.take() {
                Some(stdout) => tokio::spawn(read_reports(index, stdout, tx.clone())),
                None => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(PoolEvent::Exited { index });
                    })
                }
            };
            info!(index, pid = child.id(), "worker started");
            workers.push(WorkerHandle {
                index,
                child,
                stdin,
                reader,
            });
        }
        drop(tx);

        if workers.is_empty() {
            return Err(last_err.unwrap_or_else(|| SqueezeError::WorkerSpawnFailure {
                index: 0,
                source: std::io::Error::other("worker count is zero"),
            }));
        }
        counters
            .workers_active
            .store(workers.len() as u64, Ordering::Release);
        let collector = tokio::spawn(collect(rx, counters.clone(), ctrl, workers.len()));
        Ok(Self {
            workers,
            collector,
            counters,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Asks every worker to stop and waits for all of them to exit.
    pub async fn shutdown(mut self) {
        for w in &mut self.workers {
            if let Some(mut stdin) = w.stdin.take() {
                let line = format!("{STOP_COMMAND}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(index = w.index, error=%e, "stop command not delivered");
                }
            }
        }
        for w in &mut self.workers {
            match w.child.wait().await {
                Ok(status) => info!(index = w.index, %status, "worker exited"),
                Err(e) => warn!(index = w.index, error=%e, "wait for worker failed"),
            }
        }
        for w in self.workers {
            let _ = w.reader.await;
        }
        let _ = self.collector.await;
        self.counters.retained_bytes.store(0, Ordering::Release);
        self.counters.workers_active.store(0, Ordering::Release);
    }

    /// Kills every worker without waiting.
    pub fn kill(self) {
        for mut w in self.workers {
            if let Err(e) = w.child.start_kill() {
                warn!(index = w.index, error=%e, "kill worker failed");
            }
            w.reader.abort();
        }
        self.collector.abort();
        self.counters.workers_active.store(0, Ordering::Release);
    }
}

async fn read_reports(index: usize, stdout: ChildStdout, tx: mpsc::UnboundedSender<PoolEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match WorkerReport::parse(&line) {
                Ok(report) if report.index == index => {
                    let _ = tx.send(PoolEvent::Report(report));
                }
                Ok(report) => warn!(index, claimed = report.index, "report index mismatch"),
                Err(e) => debug!(index, error=%format!("{e:#}"), "unparseable worker line"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(index, error=%e, "worker stdout read failed");
                break;
            }
        }
    }
    let _ = tx.send(PoolEvent::Exited { index });
}

async fn collect(
    mut rx: mpsc::UnboundedReceiver<PoolEvent>,
    counters: Arc<RunCounters>,
    ctrl: RunController,
    spawned: usize,
) {
    let mut table: HashMap<usize, WorkerReport> = HashMap::new();
    let mut exited: HashSet<usize> = HashSet::new();
    let mut all_holding_seen = false;

    while let Some(event) = rx.recv().await {
        match event {
            PoolEvent::Report(report) => {
                let newly_halted = report.breach.is_some()
                    && table.get(&report.index).map_or(true, |r| r.breach.is_none());
                if newly_halted {
                    let breach = report.breach.as_deref();
                    if report.phase == WorkerPhase::Released {
                        warn!(index = report.index, breach, "worker stopped itself");
                    } else {
                        info!(index = report.index, breach, "worker halted");
                    }
                }
                table.insert(report.index, report);
            }
            PoolEvent::Exited { index } => {
                exited.insert(index);
                if let Some(r) = table.get_mut(&index) {
                    r.retained_bytes = 0;
                }
            }
        }

        let retained: u64 = table.values().map(|r| r.retained_bytes).sum();
        let allocations: u64 = table.values().map(|r| r.allocations).sum();
        counters.retained_bytes.store(retained, Ordering::Release);
        counters.allocations.store(allocations, Ordering::Release);
        counters
            .workers_active
            .store(spawned.saturating_sub(exited.len()) as u64, Ordering::Release);

        let live: Vec<&WorkerReport> = table
            .values()
            .filter(|r| !exited.contains(&r.index))
            .collect();
        let all_holding = live.len() == spawned.saturating_sub(exited.len())
            && !live.is_empty()
            && live.iter().all(|r| r.phase == WorkerPhase::Holding);
        if all_holding && !all_holding_seen {
            all_holding_seen = true;
            let reason = first_breach(live.iter().copied()).unwrap_or("limit reached");
            info!(workers = live.len(), retained, "all workers holding");
            ctrl.mark_halted(format!("all workers holding: {reason}"), true);
        }

        if exited.len() == spawned && ctrl.current() == RunState::Running {
            let reason = first_breach(table.values()).unwrap_or("all workers exited");
            warn!(reason, "every worker exited on its own, stopping");
            ctrl.mark_halted(reason.to_string(), false);
            let now = chrono::Utc::now().timestamp();
            ctrl.transition_from(RunState::Running, RunState::Stopping, now);
            ctrl.transition_from(RunState::Stopping, RunState::Stopped, now);
        }
    }
}

fn first_breach<'a>(reports: impl Iterator<Item = &'a WorkerReport>) -> Option<&'a str> {
    let mut reports: Vec<&WorkerReport> = reports.collect();
    reports.sort_by_key(|r| r.index);
    reports.into_iter().find_map(|r| r.breach.as_deref())
}
