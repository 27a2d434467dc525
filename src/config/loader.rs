// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads `keygrab.toml`, deserializes into `MasterConfig`, and converts the
//! raw sections into a validated runtime `Config`.

use crate::config::types::{
    Config, ConfigError, DetectionConfig, MasterConfig, ScannerConfig, StoreConfig,
};
use crate::keygrab_log;
use log::Level;
use std::{fs, io::ErrorKind, path::Path, time::Duration};

/// Load the configuration at `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    keygrab_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = match fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            keygrab_log!(Level::Info, "config", "No config at {:?}, using defaults", path);
            return Ok(Config::default());
        }
        Err(e) => return Err(e.into()),
    };
    let cfg = parse(&txt)?;
    keygrab_log!(Level::Info, "config", "Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse TOML text into a runtime `Config`.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let master: MasterConfig = toml::from_str(txt)?;
    convert(master)
}

/// Convert the raw TOML mirror into the runtime config, filling defaults.
pub fn convert(master: MasterConfig) -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let detection = DetectionConfig {
        executables: master.detection.executables.unwrap_or(defaults.detection.executables),
        idle_poll: duration_or("detection.idle_poll", master.detection.idle_poll, defaults.detection.idle_poll)?,
        active_poll: duration_or("detection.active_poll", master.detection.active_poll, defaults.detection.active_poll)?,
    };
    if detection.executables.iter().all(|e| e.trim().is_empty()) {
        return Err(ConfigError::InvalidValue("detection.executables", "no executable names".into()));
    }

    let s = master.scanner;
    let scanner = ScannerConfig {
        workers: s.workers.unwrap_or(defaults.scanner.workers),
        min_region_bytes: s.min_region_bytes.unwrap_or(defaults.scanner.min_region_bytes),
        max_region_bytes: s.max_region_bytes.unwrap_or(defaults.scanner.max_region_bytes),
        query_backoff: duration_or("scanner.query_backoff", s.query_backoff, defaults.scanner.query_backoff)?,
        queue_wait: duration_or("scanner.queue_wait", s.queue_wait, defaults.scanner.queue_wait)?,
        empty_queue_sleep: duration_or("scanner.empty_queue_sleep", s.empty_queue_sleep, defaults.scanner.empty_queue_sleep)?,
    };
    if scanner.workers == 0 {
        return Err(ConfigError::InvalidValue("scanner.workers", "must be at least 1".into()));
    }
    if scanner.min_region_bytes >= scanner.max_region_bytes {
        return Err(ConfigError::InvalidValue(
            "scanner.min_region_bytes",
            format!("{} is not below max_region_bytes {}", scanner.min_region_bytes, scanner.max_region_bytes),
        ));
    }

    let store = StoreConfig {
        lock_timeout: duration_or("store.lock_timeout", master.store.lock_timeout, defaults.store.lock_timeout)?,
        max_candidates: master.store.max_candidates,
    };
    if store.max_candidates == Some(0) {
        return Err(ConfigError::InvalidValue("store.max_candidates", "must be at least 1".into()));
    }

    keygrab_log!(
        Level::Debug,
        "config",
        "Watching {:?} with {} worker(s) per client",
        detection.executables,
        scanner.workers
    );

    Ok(Config { logging: master.logging, detection, scanner, store })
}

fn duration_or(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        Some(txt) => humantime::parse_duration(&txt).map_err(|e| ConfigError::InvalidDuration(field, e)),
        None => Ok(default),
    }
}
