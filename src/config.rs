#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

//! Configuration file handling.
//!
//! The file is TOML with four sections (`Settings`, `Window`, `Theme`,
//! `Logging`). Sizes in `Settings` are MiB. A missing file is replaced with
//! the defaults, a missing key falls back to its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SqueezeError;
use crate::validation::validate_settings;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqueezerConfig {
    #[serde(rename = "Settings")]
    pub settings: Settings,
    #[serde(rename = "Window")]
    pub window: Window,
    #[serde(rename = "Theme")]
    pub theme: Theme,
    #[serde(rename = "Logging")]
    pub logging: Logging,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    /// MiB per allocation unit.
    pub block_size: i64,
    pub show_progress: bool,
    /// Zero or negative means unthrottled.
    pub allocations_per_second: i64,
    pub reserve_percent: f64,
    /// MiB this run (or each worker) may retain.
    pub memory_limit: i64,
    /// MiB of swap growth tolerated when `squeeze_virtual_memory` is on.
    pub virtual_memory_limit: i64,
    pub squeeze_virtual_memory: bool,
    pub use_multiprocessing: bool,
    pub worker_processes: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            block_size: 10,
            show_progress: true,
            allocations_per_second: 500,
            reserve_percent: 2.0,
            memory_limit: 256,
            virtual_memory_limit: 1024,
            squeeze_virtual_memory: false,
            use_multiprocessing: false,
            worker_processes: 4,
        }
    }
}

impl Settings {
    /// Validate and freeze into the per-run snapshot.
    pub fn run_config(&self) -> Result<RunConfig, SqueezeError> {
        validate_settings(self)?;
        let mib = |v: i64| u64::try_from(v).unwrap_or(0).saturating_mul(MIB);
        Ok(RunConfig {
            block_size: mib(self.block_size),
            allocations_per_second: u32::try_from(self.allocations_per_second.max(0))
                .unwrap_or(u32::MAX),
            reserve_percent: self.reserve_percent,
            memory_limit: mib(self.memory_limit),
            virtual_memory_limit: self
                .squeeze_virtual_memory
                .then(|| mib(self.virtual_memory_limit)),
            workers: self
                .use_multiprocessing
                .then(|| usize::try_from(self.worker_processes).unwrap_or(1)),
            show_progress: self.show_progress,
        })
    }
}

/// Immutable per-run configuration, all sizes in bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub block_size: u64,
    /// 0 = as fast as the write path allows.
    pub allocations_per_second: u32,
    pub reserve_percent: f64,
    pub memory_limit: u64,
    pub virtual_memory_limit: Option<u64>,
    /// `Some(n)` in multiprocess mode.
    pub workers: Option<usize>,
    pub show_progress: bool,
}

impl RunConfig {
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        (self.allocations_per_second > 0)
            .then(|| Duration::from_secs_f64(1.0 / f64::from(self.allocations_per_second)))
    }

    /// Highest used-memory percent at which allocation may still proceed.
    #[must_use]
    pub fn used_percent_ceiling(&self) -> f64 {
        100.0 - self.reserve_percent
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Window {
    pub width: u32,
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 600,
            height: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThemeName {
    #[default]
    #[serde(alias = "light")]
    Light,
    #[serde(alias = "dark")]
    Dark,
    #[serde(alias = "blue")]
    Blue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Theme {
    pub theme: ThemeName,
    pub progress_bar_color: String,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            theme: ThemeName::Light,
            progress_bar_color: "0,128,255".to_string(),
        }
    }
}

impl Theme {
    pub const DEFAULT_RGB: (u8, u8, u8) = (0, 128, 255);

    /// `"r,g,b"`; anything else yields the default colour.
    #[must_use]
    pub fn progress_bar_rgb(&self) -> (u8, u8, u8) {
        let parts: Vec<Option<u8>> = self
            .progress_bar_color
            .split(',')
            .map(|p| p.trim().parse().ok())
            .collect();
        match parts.as_slice() {
            [Some(r), Some(g), Some(b)] => (*r, *g, *b),
            _ => Self::DEFAULT_RGB,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Logging {
    pub log_file: PathBuf,
    pub log_level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("memory_squeezer.log"),
            log_level: "INFO".to_string(),
        }
    }
}

impl Logging {
    /// Map the configured level (Python-style names accepted) to a filter directive.
    #[must_use]
    pub fn filter_directive(&self) -> &'static str {
        match self.log_level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" | "FATAL" => "error",
            _ => "info",
        }
    }
}

/// Display-layer view of the window and theme sections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub theme: ThemeName,
    pub progress_bar_rgb: (u8, u8, u8),
}

impl SqueezerConfig {
    pub fn load(path: &Path) -> AnyResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Load `path`, writing the defaults there first when it does not exist.
    pub fn load_or_create(path: &Path) -> AnyResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.write(path)?;
        info!(path=%path.display(), "wrote default configuration");
        Ok(config)
    }

    pub fn write(&self, path: &Path) -> AnyResult<()> {
        let text = toml::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, text).with_context(|| format!("write config {}", path.display()))
    }

    #[must_use]
    pub fn display(&self) -> DisplaySettings {
        DisplaySettings {
            width: self.window.width,
            height: self.window.height,
            theme: self.theme.theme,
            progress_bar_rgb: self.theme.progress_bar_rgb(),
        }
    }
}
