#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use anyhow::{Context, Result as AnyResult};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Logging;

fn filter(logging: &Logging) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()))
}

/// JSON lines to the configured log file (truncated on start), plain text to
/// stderr. `RUST_LOG` overrides the configured level.
pub fn init_tracing(logging: &Logging) -> AnyResult<()> {
    let file = std::fs::File::create(&logging.log_file)
        .with_context(|| format!("create log file {}", logging.log_file.display()))?;
    tracing_subscriber::registry()
        .with(filter(logging))
        .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("install tracing subscriber")
}

/// Worker processes own stdout for reports, so they log to stderr only.
pub fn init_worker_tracing() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(&Logging::default()))
        .with_writer(std::io::stderr)
        .json()
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("install worker tracing subscriber")
}
