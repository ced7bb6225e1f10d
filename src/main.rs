#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result as AnyResult};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use memory_squeezer::config::{DEFAULT_CONFIG_FILE, MIB};
use memory_squeezer::reporter::REFRESH_PERIOD;
use memory_squeezer::{
    serve, telemetry, worker, AppState, Metrics, RunConfig, SqueezeRunner, SqueezerConfig,
    StartRequest,
};

/// Consume memory at a controlled rate to watch a machine under pressure.
#[derive(Parser)]
#[command(name = "memory-squeezer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; written with defaults when missing
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control API for a display layer
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:50051")]
        bind: String,
    },

    /// Run headless: Ctrl-C stops gracefully, a second Ctrl-C stops at once
    Run {
        /// Confirm that memory will be consumed
        #[arg(long)]
        yes: bool,

        /// Proceed even when less than 2 GiB is available
        #[arg(long)]
        acknowledge_low_memory: bool,
    },

    /// Write the default configuration file
    InitConfig {
        #[arg(long)]
        force: bool,
    },

    #[command(hide = true)]
    Worker {
        #[arg(long)]
        index: usize,

        #[arg(long)]
        config_json: String,
    },
}

struct Session {
    file: SqueezerConfig,
    runner: SqueezeRunner,
    reporter: Arc<memory_squeezer::StatusReporter>,
    metrics: Metrics,
}

fn prepare(path: &Path) -> AnyResult<Session> {
    let file = SqueezerConfig::load_or_create(path)?;
    telemetry::init_tracing(&file.logging)?;
    info!(config=%path.display(), "memory squeezer started");
    let run_config = file.settings.run_config()?;
    let metrics = Metrics::new()?;
    let runner = SqueezeRunner::new(run_config, metrics.clone());
    let reporter = Arc::new(runner.reporter());
    Ok(Session {
        file,
        runner,
        reporter,
        metrics,
    })
}

async fn worker_main(index: usize, config_json: &str) -> AnyResult<()> {
    telemetry::init_worker_tracing()?;
    let config: RunConfig = serde_json::from_str(config_json).context("decode worker config")?;
    tokio::task::spawn_blocking(move || worker::run_worker(index, &config))
        .await
        .context("worker thread")?
}

fn init_config(path: &Path, force: bool) -> AnyResult<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SqueezerConfig::default().write(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn serve_main(session: Session, bind: &str) -> AnyResult<()> {
    let refresh = session.reporter.clone().spawn_refresh(
        session.metrics.clone(),
        REFRESH_PERIOD,
        session.runner.config().show_progress,
    );
    let state = AppState {
        runner: session.runner.clone(),
        reporter: session.reporter.clone(),
        display: session.file.display(),
    };
    info!(bind, "serving control api");
    serve(bind, state).await.context("http server")?;
    session.runner.shutdown().await;
    refresh.abort();
    Ok(())
}

async fn run_main(session: Session, req: StartRequest) -> AnyResult<()> {
    let refresh = session.reporter.clone().spawn_refresh(
        session.metrics.clone(),
        REFRESH_PERIOD,
        session.runner.config().show_progress,
    );
    let started = session.runner.start(&req)?;
    info!(target_mb = started.target_bytes / MIB, "headless run started, Ctrl-C to stop");

    let mut stopping = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if stopping.is_none() {
                    warn!("interrupt: stopping gracefully, interrupt again to stop immediately");
                    let runner = session.runner.clone();
                    stopping = Some(tokio::spawn(async move { runner.stop().await }));
                } else {
                    if let Err(e) = session.runner.emergency_stop() {
                        error!(error=%e, "emergency stop failed");
                    }
                    error!("emergency stop, exiting without cleanup");
                    std::process::exit(130);
                }
            }
            () = tokio::time::sleep(Duration::from_millis(200)) => {
                if session.runner.controller().current().is_terminal() {
                    break;
                }
            }
        }
    }
    if let Some(task) = stopping {
        if let Ok(Err(e)) = task.await {
            warn!(error=%e, "stop reported an error");
        }
    }
    refresh.abort();
    let st = session.runner.status();
    info!(state=%st.state, halt_reason = st.halt_reason.as_deref(), "run finished");
    Ok(())
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Worker { index, config_json } => worker_main(index, &config_json).await,
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::Serve { bind } => serve_main(prepare(&cli.config)?, &bind).await,
        Commands::Run {
            yes,
            acknowledge_low_memory,
        } => {
            let req = StartRequest {
                confirmed: yes,
                acknowledge_low_memory,
            };
            run_main(prepare(&cli.config)?, req).await
        }
    }
}
