#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Rate controller: the allocation loop and the session around it.
//!
//! One iteration checks the stop signal, asks the guard, writes one block and
//! then waits out whatever remains of the per-allocation budget. The wait is
//! on the stop signal itself, so a stop is observed within one iteration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::domain::RunCounters;
use crate::error::SqueezeError;
use crate::guard::{Breach, LimitGuard, MemoryProbe};
use crate::lib_mem::{AllocationUnit, RetentionList};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    Running,
    Graceful,
    Emergency,
}

/// Stop flag with an interruptible wait. Emergency overrides graceful,
/// never the other way round.
#[derive(Debug)]
pub struct StopSignal {
    mode: Mutex<StopMode>,
    cv: Condvar,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            mode: Mutex::new(StopMode::Running),
            cv: Condvar::new(),
        }
    }
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn mode(&self) -> StopMode {
        *self.mode.lock()
    }

    pub fn request(&self, mode: StopMode) {
        let mut cur = self.mode.lock();
        if mode == StopMode::Emergency || *cur == StopMode::Running {
            *cur = mode;
        }
        self.cv.notify_all();
    }

    /// Sleeps up to `timeout`, returning early once a stop is requested.
    pub fn wait_timeout(&self, timeout: Duration) -> StopMode {
        let deadline = Instant::now() + timeout;
        let mut cur = self.mode.lock();
        while *cur == StopMode::Running {
            if self.cv.wait_until(&mut cur, deadline).timed_out() {
                break;
            }
        }
        *cur
    }

    /// Blocks until a stop is requested.
    pub fn wait(&self) -> StopMode {
        let mut cur = self.mode.lock();
        while *cur == StopMode::Running {
            self.cv.wait(&mut cur);
        }
        *cur
    }
}

#[derive(Debug)]
pub enum LoopExit {
    Stopped,
    Emergency,
    Halted(Breach),
    Exhausted(SqueezeError),
}

impl LoopExit {
    /// Exits after which the run releases its memory without being asked.
    #[must_use]
    pub fn stops_automatically(&self) -> bool {
        match self {
            LoopExit::Exhausted(_) => true,
            LoopExit::Halted(breach) => !breach.is_ceiling(),
            LoopExit::Stopped | LoopExit::Emergency => false,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        match self {
            LoopExit::Halted(breach) => Some(breach.to_string()),
            LoopExit::Exhausted(e) => Some(e.to_string()),
            LoopExit::Stopped | LoopExit::Emergency => None,
        }
    }
}

pub struct RateController<P> {
    block_size: u64,
    interval: Option<Duration>,
    guard: LimitGuard<P>,
    retention: RetentionList,
    rng: SmallRng,
}

impl<P: MemoryProbe> RateController<P> {
    pub fn new(config: &RunConfig, probe: P, counters: Arc<RunCounters>) -> Self {
        Self {
            block_size: config.block_size,
            interval: config.interval(),
            guard: LimitGuard::new(probe, config),
            retention: RetentionList::new(counters),
            rng: SmallRng::from_entropy(),
        }
    }

    #[must_use]
    pub fn retention(&self) -> &RetentionList {
        &self.retention
    }

    /// Allocates until stopped, halted by the guard or refused by the system.
    pub fn run(&mut self, stop: &StopSignal) -> LoopExit {
        loop {
            match stop.mode() {
                StopMode::Graceful => return LoopExit::Stopped,
                StopMode::Emergency => return LoopExit::Emergency,
                StopMode::Running => {}
            }
            if let Err(breach) = self.guard.check(self.retention.retained_bytes()) {
                return LoopExit::Halted(breach);
            }
            let started = Instant::now();
            match AllocationUnit::write(self.block_size, &mut self.rng) {
                Ok(unit) => self.retention.push(unit),
                Err(e) => return LoopExit::Exhausted(e),
            }
            debug!(
                allocations = self.retention.len(),
                retained = self.retention.retained_bytes(),
                "block retained"
            );
            if let Some(interval) = self.interval {
                let pause = interval.saturating_sub(started.elapsed());
                if !pause.is_zero() {
                    stop.wait_timeout(pause);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Released,
    Abandoned,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub exit: LoopExit,
    pub end: SessionEnd,
    /// Bytes held when the session ended, before release.
    pub peak_retained: u64,
    pub allocations: usize,
}

/// Runs one fill-and-hold session to its end.
///
/// After a ceiling breach the memory is held until `stop` fires. Allocation
/// and metrics failures release at once. `on_halt` sees the loop exit before
/// any holding or release happens.
pub fn run_session<P, F>(
    mut controller: RateController<P>,
    stop: &StopSignal,
    on_halt: F,
) -> SessionOutcome
where
    P: MemoryProbe,
    F: FnOnce(&LoopExit),
{
    let exit = controller.run(stop);
    match &exit {
        LoopExit::Halted(breach) if breach.is_ceiling() => {
            info!(
                reason=%breach,
                retained = controller.retention.retained_bytes(),
                "ceiling reached, holding"
            );
        }
        LoopExit::Halted(breach) => warn!(reason=%breach, "guard failed closed, stopping"),
        LoopExit::Exhausted(e) => warn!(error=%e, "allocation refused, stopping"),
        LoopExit::Stopped | LoopExit::Emergency => {}
    }
    on_halt(&exit);

    let mode = match &exit {
        LoopExit::Emergency => StopMode::Emergency,
        LoopExit::Stopped => StopMode::Graceful,
        other if other.stops_automatically() => StopMode::Graceful,
        _ => stop.wait(),
    };
    let peak_retained = controller.retention.retained_bytes();
    let allocations = controller.retention.len();
    let end = if mode == StopMode::Emergency {
        controller.retention.abandon();
        SessionEnd::Abandoned
    } else {
        let freed = controller.retention.release();
        info!(freed, allocations, "retained memory released");
        SessionEnd::Released
    };
    SessionOutcome {
        exit,
        end,
        peak_retained,
        allocations,
    }
}
