#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

mod common;

use common::GIB;
use memory_squeezer::config::Settings;
use memory_squeezer::validation::{validate_settings, validate_start};
use memory_squeezer::{SqueezeError, StartRequest, SystemMemory};

fn mem(available: u64) -> SystemMemory {
    SystemMemory {
        total_bytes: 16 * GIB,
        used_bytes: 16 * GIB - available,
        available_bytes: available,
        used_swap_bytes: 0,
    }
}

#[test]
fn ok_defaults() {
    assert!(validate_settings(&Settings::default()).is_ok());
}

#[test]
fn err_block_size() {
    for bad in [0, -10] {
        let s = Settings { block_size: bad, ..Settings::default() };
        assert!(matches!(validate_settings(&s), Err(SqueezeError::Configuration(_))));
    }
}

#[test]
fn err_memory_limit() {
    let s = Settings { memory_limit: 0, ..Settings::default() };
    assert!(validate_settings(&s).is_err());
}

#[test]
fn err_reserve_percent_range() {
    for bad in [-1.0, 100.0, 150.0, f64::NAN] {
        let s = Settings { reserve_percent: bad, ..Settings::default() };
        assert!(validate_settings(&s).is_err(), "{bad} accepted");
    }
    let s = Settings { reserve_percent: 0.0, ..Settings::default() };
    assert!(validate_settings(&s).is_ok());
}

#[test]
fn rate_may_be_non_positive() {
    let s = Settings { allocations_per_second: -5, ..Settings::default() };
    let cfg = s.run_config().expect("valid");
    assert_eq!(cfg.allocations_per_second, 0);
    assert!(cfg.interval().is_none());
}

#[test]
fn worker_count_checked_only_in_multiprocess_mode() {
    let s = Settings { worker_processes: 0, ..Settings::default() };
    assert!(validate_settings(&s).is_ok());
    let s = Settings { worker_processes: 0, use_multiprocessing: true, ..Settings::default() };
    assert!(validate_settings(&s).is_err());
    let s = Settings { worker_processes: 65, use_multiprocessing: true, ..Settings::default() };
    assert!(validate_settings(&s).is_err());
}

#[test]
fn virtual_limit_checked_only_when_squeezing() {
    let s = Settings { virtual_memory_limit: 0, ..Settings::default() };
    assert!(validate_settings(&s).is_ok());
    let s = Settings {
        virtual_memory_limit: 0,
        squeeze_virtual_memory: true,
        ..Settings::default()
    };
    assert!(validate_settings(&s).is_err());
}

#[test]
fn start_requires_confirmation() {
    let req = StartRequest::default();
    assert!(matches!(validate_start(&req, &mem(8 * GIB)), Err(SqueezeError::NotConfirmed)));
    assert!(validate_start(&StartRequest::confirmed(), &mem(8 * GIB)).is_ok());
}

#[test]
fn low_memory_needs_acknowledgement() {
    let low = mem(GIB);
    assert!(matches!(
        validate_start(&StartRequest::confirmed(), &low),
        Err(SqueezeError::LowMemoryUnacknowledged { available_mb: 1024 })
    ));
    let req = StartRequest { confirmed: true, acknowledge_low_memory: true };
    assert!(validate_start(&req, &low).is_ok());
}
