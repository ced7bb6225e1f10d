#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use anyhow::{Context, Result as AnyResult};
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::reporter::MetricsSnapshot;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    pub run_active: IntGauge,
    pub retained_bytes: IntGauge,
    pub allocations: IntGauge,
    pub workers_active: IntGauge,
    pub system_used_bytes: IntGauge,
    pub system_used_percent: Gauge,
    pub guard_breaches_total: IntCounter,
    pub runs_total: IntCounter,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> AnyResult<IntGauge> {
    let g = IntGauge::with_opts(Opts::new(name, help)).with_context(|| format!("create {name}"))?;
    registry
        .register(Box::new(g.clone()))
        .with_context(|| format!("register {name}"))?;
    Ok(g)
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> AnyResult<IntCounter> {
    let c =
        IntCounter::with_opts(Opts::new(name, help)).with_context(|| format!("create {name}"))?;
    registry
        .register(Box::new(c.clone()))
        .with_context(|| format!("register {name}"))?;
    Ok(c)
}

impl Metrics {
    pub fn new() -> AnyResult<Self> {
        let registry = Registry::new();
        let run_active = int_gauge(&registry, "squeezer_run_active", "1 while a run is active")?;
        let retained_bytes =
            int_gauge(&registry, "squeezer_retained_bytes", "bytes retained by the run")?;
        let allocations = int_gauge(
            &registry,
            "squeezer_allocations",
            "allocation units issued in the current run",
        )?;
        let workers_active =
            int_gauge(&registry, "squeezer_workers_active", "worker processes alive")?;
        let system_used_bytes =
            int_gauge(&registry, "squeezer_system_used_bytes", "system used memory")?;
        let system_used_percent = Gauge::with_opts(Opts::new(
            "squeezer_system_used_percent",
            "system used memory percent",
        ))
        .context("create squeezer_system_used_percent")?;
        registry
            .register(Box::new(system_used_percent.clone()))
            .context("register squeezer_system_used_percent")?;
        let guard_breaches_total = int_counter(
            &registry,
            "squeezer_guard_breaches_total",
            "runs halted by a limit guard",
        )?;
        let runs_total = int_counter(&registry, "squeezer_runs_total", "runs started")?;
        Ok(Self {
            registry,
            run_active,
            retained_bytes,
            allocations,
            workers_active,
            system_used_bytes,
            system_used_percent,
            guard_breaches_total,
            runs_total,
        })
    }

    pub fn observe(&self, snap: &MetricsSnapshot) {
        self.run_active.set(i64::from(snap.state.is_active()));
        self.retained_bytes
            .set(i64::try_from(snap.retained_bytes).unwrap_or(i64::MAX));
        self.allocations
            .set(i64::try_from(snap.allocations).unwrap_or(i64::MAX));
        self.workers_active
            .set(i64::try_from(snap.workers).unwrap_or(i64::MAX));
        self.system_used_bytes
            .set(i64::try_from(snap.system.used_bytes).unwrap_or(i64::MAX));
        self.system_used_percent.set(snap.used_percent);
    }

    pub fn encode_text(&self) -> AnyResult<Vec<u8>> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf).context("encode metrics")?;
        Ok(buf)
    }
}
