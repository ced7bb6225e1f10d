#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod guard;
pub mod http;
pub mod lib_mem;
pub mod metrics;
pub mod pool;
pub mod reporter;
pub mod service;
pub mod telemetry;
pub mod validation;
pub mod worker;

pub use config::{RunConfig, Settings, SqueezerConfig};
pub use controller::{run_session, LoopExit, RateController, StopMode, StopSignal};
pub use domain::{CurrentCounters, RunController, RunCounters, RunState, RunStatus, StartRequest};
pub use error::SqueezeError;
pub use guard::{Breach, LimitGuard, MemoryProbe, SysinfoProbe, SystemMemory};
pub use http::{routes, serve, AppState};
pub use http::{display, emergency_stop, healthz, scrape_metrics, snapshot, start, status, stop};
pub use metrics::Metrics;
pub use reporter::{MetricsSnapshot, StatusReporter};
pub use service::SqueezeRunner;
pub use validation::{validate_settings, validate_start};
