#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use memory_squeezer::domain::RunState;
use memory_squeezer::metrics::Metrics;
use memory_squeezer::{MetricsSnapshot, SystemMemory};

#[test]
fn create_and_encode() {
    let m = Metrics::new().expect("metrics");
    let buf = m.encode_text().expect("encode");
    assert!(!buf.is_empty());
}

#[test]
fn observe_sets_gauges() {
    let m = Metrics::new().expect("metrics");
    let snap = MetricsSnapshot {
        ts_seconds: 0,
        state: RunState::Running,
        system: SystemMemory {
            total_bytes: 1000,
            used_bytes: 400,
            available_bytes: 600,
            used_swap_bytes: 0,
        },
        used_percent: 40.0,
        retained_bytes: 123,
        allocations: 7,
        workers: 2,
        target_bytes: 1000,
        progress_percent: 12.3,
    };
    m.observe(&snap);
    assert_eq!(m.run_active.get(), 1);
    assert_eq!(m.retained_bytes.get(), 123);
    assert_eq!(m.allocations.get(), 7);
    assert_eq!(m.workers_active.get(), 2);
    assert_eq!(m.system_used_bytes.get(), 400);
    let text = String::from_utf8(m.encode_text().expect("encode")).expect("utf8");
    assert!(text.contains("squeezer_retained_bytes 123"));
}
