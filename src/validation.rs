#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use crate::config::{Settings, MIB};
use crate::domain::StartRequest;
use crate::error::SqueezeError;
use crate::guard::SystemMemory;

pub const MAX_WORKER_PROCESSES: i64 = 64;
/// Below this much available memory a start needs an extra acknowledgement.
pub const LOW_MEMORY_THRESHOLD: u64 = 2 * 1024 * MIB;

fn invalid(msg: String) -> SqueezeError {
    SqueezeError::Configuration(msg)
}

pub fn validate_settings(s: &Settings) -> Result<(), SqueezeError> {
    if s.block_size <= 0 {
        return Err(invalid(format!("BlockSize must be > 0 (got {})", s.block_size)));
    }
    if s.memory_limit <= 0 {
        return Err(invalid(format!("MemoryLimit must be > 0 (got {})", s.memory_limit)));
    }
    if !(0.0..100.0).contains(&s.reserve_percent) {
        return Err(invalid(format!(
            "ReservePercent must be in [0, 100) (got {})",
            s.reserve_percent
        )));
    }
    if s.squeeze_virtual_memory && s.virtual_memory_limit <= 0 {
        return Err(invalid(format!(
            "VirtualMemoryLimit must be > 0 when SqueezeVirtualMemory is on (got {})",
            s.virtual_memory_limit
        )));
    }
    if s.use_multiprocessing && !(1..=MAX_WORKER_PROCESSES).contains(&s.worker_processes) {
        return Err(invalid(format!(
            "WorkerProcesses must be 1..={MAX_WORKER_PROCESSES} (got {})",
            s.worker_processes
        )));
    }
    Ok(())
}

/// Confirmation gate for the start command.
pub fn validate_start(req: &StartRequest, mem: &SystemMemory) -> Result<(), SqueezeError> {
    if !req.confirmed {
        return Err(SqueezeError::NotConfirmed);
    }
    if mem.available_bytes < LOW_MEMORY_THRESHOLD && !req.acknowledge_low_memory {
        return Err(SqueezeError::LowMemoryUnacknowledged {
            available_mb: mem.available_bytes / MIB,
        });
    }
    Ok(())
}
