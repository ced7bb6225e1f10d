#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use memory_squeezer::config::MIB;
use memory_squeezer::service::ProbeFactory;
use memory_squeezer::{MemoryProbe, RunConfig, SqueezeError, SystemMemory};
use parking_lot::Mutex;

pub const GIB: u64 = 1024 * MIB;

/// Probe whose reading can be changed (or broken) while a run is live.
#[derive(Clone)]
pub struct SharedProbe {
    mem: Arc<Mutex<Option<SystemMemory>>>,
}

impl SharedProbe {
    pub fn healthy() -> Self {
        Self {
            mem: Arc::new(Mutex::new(Some(SystemMemory {
                total_bytes: 64 * GIB,
                used_bytes: 4 * GIB,
                available_bytes: 60 * GIB,
                used_swap_bytes: 0,
            }))),
        }
    }

    pub fn with_available(available: u64) -> Self {
        let p = Self::healthy();
        p.update(|m| m.available_bytes = available);
        p
    }

    pub fn update(&self, f: impl FnOnce(&mut SystemMemory)) {
        if let Some(m) = self.mem.lock().as_mut() {
            f(m);
        }
    }

    pub fn set_used_percent(&self, percent: u64) {
        self.update(|m| m.used_bytes = (m.total_bytes * percent + 99) / 100);
    }

    pub fn fail(&self) {
        *self.mem.lock() = None;
    }

    pub fn factory(&self) -> ProbeFactory {
        let p = self.clone();
        Arc::new(move || Box::new(p.clone()) as Box<dyn MemoryProbe>)
    }
}

impl MemoryProbe for SharedProbe {
    fn sample(&mut self) -> Result<SystemMemory, SqueezeError> {
        (*self.mem.lock()).ok_or_else(|| SqueezeError::MetricsUnavailable("probe offline".into()))
    }
}

pub fn run_config(block_size: u64, rate: u32, memory_limit: u64) -> RunConfig {
    RunConfig {
        block_size,
        allocations_per_second: rate,
        reserve_percent: 2.0,
        memory_limit,
        virtual_memory_limit: None,
        workers: None,
        show_progress: false,
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
