// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine.  The global section
// holds the engine-wide defaults; per-chart sections override shape and
// naming for individual charts, and per-dimension sections nest inside
// them.  Producer-supplied values are used only where the config is silent,
// so an operator's override always wins.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Algorithm, ChartType, MemoryMode};

// =============================================================================
// Engine-wide limits and defaults
// =============================================================================

pub const HISTORY_MIN: usize = 5;
pub const HISTORY_MAX: usize = 86_400 * 365;
pub const UPDATE_EVERY_MAX: u32 = 3600;

/// Collection gaps spanning at least this many cycles are stored as
/// NOT_EXISTS instead of being interpolated across.
pub const DEFAULT_GAP_ITERATIONS: u64 = 5;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_update_every() -> u32 {
    1
}

fn default_history() -> usize {
    3600
}

fn default_bind_address() -> String {
    "0.0.0.0:19999".to_string()
}

fn default_database_directory() -> PathBuf {
    PathBuf::from("cache")
}

fn default_web_files_directory() -> PathBuf {
    PathBuf::from("web")
}

fn default_plugins_directory() -> PathBuf {
    PathBuf::from("plugins.d")
}

fn default_plugins_check_every() -> u64 {
    60
}

fn default_save_every() -> u64 {
    900
}

fn default_gap_iterations() -> u64 {
    DEFAULT_GAP_ITERATIONS
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Per-dimension overrides
// =============================================================================

/// Operator overrides for a single dimension, keyed by dimension id inside
/// the owning chart's section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub multiplier: Option<i64>,
    #[serde(default)]
    pub divisor: Option<i64>,
    #[serde(default)]
    pub hidden: Option<bool>,
}

// =============================================================================
// Per-chart overrides
// =============================================================================

/// Operator overrides for a single chart, keyed by the chart's full
/// `type.id` in the `charts` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub history: Option<usize>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub chart_type: Option<ChartType>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub gap_when_lost_iterations_above: Option<u64>,
    #[serde(default)]
    pub dimensions: HashMap<String, DimensionOverride>,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Global section ------------------------------------------------------
    /// Hostname reported by the HTTP API.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Default collection cadence in seconds, clamped to `[1, 3600]`.
    #[serde(default = "default_update_every")]
    pub update_every: u32,

    /// Default ring capacity (slots per dimension).
    #[serde(default = "default_history")]
    pub history: usize,

    /// Default persistence mode for new charts.
    #[serde(default)]
    pub memory_mode: MemoryMode,

    /// HTTP listen address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Root directory for persisted chart databases.
    #[serde(default = "default_database_directory")]
    pub database_directory: PathBuf,

    /// Directory served by the (external) static file layer.
    #[serde(default = "default_web_files_directory")]
    pub web_files_directory: PathBuf,

    /// Directory scanned for external producer executables.
    #[serde(default = "default_plugins_directory")]
    pub plugins_directory: PathBuf,

    /// How often (seconds) the plugins directory is rescanned.
    #[serde(default = "default_plugins_check_every")]
    pub plugins_check_every: u64,

    /// Seconds between periodic `save_all` runs; 0 disables the loop.
    #[serde(default = "default_save_every")]
    pub save_every: u64,

    /// Drop privileges to this user after binding, when started as root.
    #[serde(default)]
    pub run_as_user: Option<String>,

    /// Enables the built-in /proc collector.
    #[serde(default = "default_true")]
    pub proc_collector: bool,

    /// Default gap policy for new charts.
    #[serde(default = "default_gap_iterations")]
    pub gap_when_lost_iterations_above: u64,

    // --- Per-chart sections --------------------------------------------------
    #[serde(default)]
    pub charts: HashMap<String, ChartOverride>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            update_every: default_update_every(),
            history: default_history(),
            memory_mode: MemoryMode::default(),
            bind_address: default_bind_address(),
            database_directory: default_database_directory(),
            web_files_directory: default_web_files_directory(),
            plugins_directory: default_plugins_directory(),
            plugins_check_every: default_plugins_check_every(),
            save_every: default_save_every(),
            run_as_user: None,
            proc_collector: true,
            gap_when_lost_iterations_above: default_gap_iterations(),
            charts: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.clamp();

        info!(
            path = %path.display(),
            update_every = config.update_every,
            history = config.history,
            memory_mode = %config.memory_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Force out-of-range globals back into their legal windows.
    pub fn clamp(&mut self) {
        self.update_every = self.update_every.clamp(1, UPDATE_EVERY_MAX);
        self.history = self.history.clamp(HISTORY_MIN, HISTORY_MAX);
        if self.gap_when_lost_iterations_above < 1 {
            self.gap_when_lost_iterations_above = 1;
        }
    }

    /// Overrides for a chart, by full `type.id`.
    pub fn chart(&self, full_id: &str) -> Option<&ChartOverride> {
        self.charts.get(full_id)
    }

    /// Overrides for a dimension inside a chart.
    pub fn dimension(&self, full_id: &str, dim_id: &str) -> Option<&DimensionOverride> {
        self.chart(full_id).and_then(|c| c.dimensions.get(dim_id))
    }
}

// =============================================================================
// Tests
// =============================================================================
