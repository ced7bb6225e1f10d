#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Limit guard: decides before every allocation whether the run may grow.
//!
//! The guard only ever blocks growth. Memory already retained stays where it
//! is until the run is explicitly stopped.

use serde::Serialize;
use sysinfo::System;
use thiserror::Error;

use crate::config::RunConfig;
use crate::error::SqueezeError;

/// One reading of system-wide memory, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_swap_bytes: u64,
}

impl SystemMemory {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

pub trait MemoryProbe: Send {
    fn sample(&mut self) -> Result<SystemMemory, SqueezeError>;
}

impl MemoryProbe for Box<dyn MemoryProbe> {
    fn sample(&mut self) -> Result<SystemMemory, SqueezeError> {
        (**self).sample()
    }
}

pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    #[must_use]
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&mut self) -> Result<SystemMemory, SqueezeError> {
        self.sys.refresh_memory();
        let total_bytes = self.sys.total_memory();
        if total_bytes == 0 {
            return Err(SqueezeError::MetricsUnavailable(
                "total memory reported as zero".into(),
            ));
        }
        Ok(SystemMemory {
            total_bytes,
            used_bytes: self.sys.used_memory(),
            available_bytes: self.sys.available_memory(),
            used_swap_bytes: self.sys.used_swap(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Breach {
    #[error("memory limit reached: {retained} of {limit} bytes retained")]
    MemoryLimit { retained: u64, limit: u64 },

    #[error("system reserve reached: {used_percent:.1}% used, ceiling {ceiling:.1}%")]
    Reserve { used_percent: f64, ceiling: f64 },

    #[error("virtual memory limit reached: {swapped} of {limit} swap bytes consumed")]
    VirtualMemory { swapped: u64, limit: u64 },

    #[error("metrics unavailable: {reason}")]
    MetricsUnavailable { reason: String },
}

impl Breach {
    /// A configured ceiling was hit, as opposed to the guard failing closed.
    #[must_use]
    pub fn is_ceiling(&self) -> bool {
        !matches!(self, Self::MetricsUnavailable { .. })
    }
}

pub struct LimitGuard<P> {
    probe: P,
    memory_limit: u64,
    used_percent_ceiling: f64,
    virtual_memory_limit: Option<u64>,
    swap_baseline: Option<u64>,
}

impl<P: MemoryProbe> LimitGuard<P> {
    pub fn new(probe: P, config: &RunConfig) -> Self {
        Self {
            probe,
            memory_limit: config.memory_limit,
            used_percent_ceiling: config.used_percent_ceiling(),
            virtual_memory_limit: config.virtual_memory_limit,
            swap_baseline: None,
        }
    }

    /// `Ok(())` when another block may be allocated on top of `retained` bytes.
    ///
    /// Every ceiling is independent; the first one reached wins. A failed
    /// metrics read counts as a breach.
    pub fn check(&mut self, retained: u64) -> Result<(), Breach> {
        if retained >= self.memory_limit {
            return Err(Breach::MemoryLimit {
                retained,
                limit: self.memory_limit,
            });
        }
        let mem = self
            .probe
            .sample()
            .map_err(|e| Breach::MetricsUnavailable {
                reason: e.to_string(),
            })?;
        let used_percent = mem.used_percent();
        if used_percent >= self.used_percent_ceiling {
            return Err(Breach::Reserve {
                used_percent,
                ceiling: self.used_percent_ceiling,
            });
        }
        if let Some(limit) = self.virtual_memory_limit {
            let baseline = *self.swap_baseline.get_or_insert(mem.used_swap_bytes);
            let swapped = mem.used_swap_bytes.saturating_sub(baseline);
            if swapped >= limit {
                return Err(Breach::VirtualMemory { swapped, limit });
            }
        }
        Ok(())
    }
}
