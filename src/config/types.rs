//! Configuration structures.
//!
//! Two layers, the same way the rest of the agent separates file format from
//! runtime logic:
//! - raw TOML mirrors (`MasterConfig` and its sections), every field
//!   optional with a default so a partial file is valid;
//! - the typed runtime `Config` built by `loader::convert`, with durations
//!   parsed and values validated.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Executables the detection loop watches for by default.
pub const DEFAULT_EXECUTABLES: &[&str] = &["PathOfExile.exe", "PathOfExile_x64.exe"];

// ───── raw TOML mirrors ─────────────────────────────────────────────────────

/// Mirror of the `[logging]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]                   pub enable: bool,
    #[serde(default)]                   pub file:   Option<String>,
    #[serde(default = "default_level")] pub level:  String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[detection]` table. Durations are humantime strings.
#[derive(Debug, Default, Deserialize)]
pub struct DetectionStub {
    #[serde(default)] pub executables: Option<Vec<String>>,
    #[serde(default)] pub idle_poll:   Option<String>,
    #[serde(default)] pub active_poll: Option<String>,
}

/// Mirror of the `[scanner]` table.
#[derive(Debug, Default, Deserialize)]
pub struct ScannerStub {
    #[serde(default)] pub workers:           Option<usize>,
    #[serde(default)] pub min_region_bytes:  Option<usize>,
    #[serde(default)] pub max_region_bytes:  Option<usize>,
    #[serde(default)] pub query_backoff:     Option<String>,
    #[serde(default)] pub queue_wait:        Option<String>,
    #[serde(default)] pub empty_queue_sleep: Option<String>,
}

/// Mirror of the `[store]` table.
#[derive(Debug, Default, Deserialize)]
pub struct StoreStub {
    #[serde(default)] pub lock_timeout:   Option<String>,
    #[serde(default)] pub max_candidates: Option<usize>,
}

/// Top-level config as deserialized from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct MasterConfig {
    #[serde(default)] pub logging:   LoggingConfig,
    #[serde(default)] pub detection: DetectionStub,
    #[serde(default)] pub scanner:   ScannerStub,
    #[serde(default)] pub store:     StoreStub,
}

// ───── runtime config ───────────────────────────────────────────────────────

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub logging:   LoggingConfig,
    pub detection: DetectionConfig,
    pub scanner:   ScannerConfig,
    pub store:     StoreConfig,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Substrings matched against running executable names.
    pub executables: Vec<String>,
    /// Poll interval while no client is running.
    pub idle_poll:   Duration,
    /// Poll interval while at least one client is known.
    pub active_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Scan threads per monitored process.
    pub workers:           usize,
    /// Regions must be strictly larger than this.
    pub min_region_bytes:  usize,
    /// Regions must be at most this large.
    pub max_region_bytes:  usize,
    /// Pause after a failed region query before restarting from address 0.
    pub query_backoff:     Duration,
    /// Bounded wait on the region queue.
    pub queue_wait:        Duration,
    /// Sleep after finding the region queue empty.
    pub empty_queue_sleep: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bounded wait on the candidate pool lock in `search`.
    pub lock_timeout:   Duration,
    /// `None` keeps the pool unbounded.
    pub max_candidates: Option<usize>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            executables: DEFAULT_EXECUTABLES.iter().map(|s| s.to_string()).collect(),
            idle_poll:   Duration::from_millis(500),
            active_poll: Duration::from_millis(1_000),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers:           2,
            min_region_bytes:  1024,
            max_region_bytes:  20 * 1024 * 1024,
            query_backoff:     Duration::from_millis(1_250),
            queue_wait:        Duration::from_millis(2_000),
            empty_queue_sleep: Duration::from_millis(100),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { lock_timeout: Duration::from_millis(200), max_candidates: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging:   LoggingConfig::default(),
            detection: DetectionConfig::default(),
            scanner:   ScannerConfig::default(),
            store:     StoreConfig::default(),
        }
    }
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for '{0}': {1}")]
    InvalidDuration(&'static str, #[source] humantime::DurationError),

    #[error("invalid value for '{0}': {1}")]
    InvalidValue(&'static str, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
