//! Application configuration.
//!
//! Settings load in layers: built-in defaults, then an optional TOML file,
//! then `LABRIG_`-prefixed environment variables (`LABRIG_LOG_LEVEL=debug`,
//! `LABRIG_TIMING__POLL_INTERVAL=250ms`). Durations are humantime strings
//! (`"1ms"`, `"2s"`). Validation runs after the merge so a value that parses
//! but makes no sense still fails loudly at startup.

use crate::error::{RigError, RigResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings for the rig.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default tracing filter (`trace`..`error`); `RUST_LOG` overrides it.
    pub log_level: String,
    /// Write a timestamped session log file into the data directory.
    pub session_log: bool,
    /// Storage locations.
    pub storage: StorageSettings,
    /// Pacing defaults for exchanges and waits.
    pub timing: TimingSettings,
    /// Named instrument endpoints (`[instruments.lockin]` tables).
    pub instruments: HashMap<String, InstrumentSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            session_log: true,
            storage: StorageSettings::default(),
            timing: TimingSettings::default(),
            instruments: HashMap::new(),
        }
    }
}

/// Where recordings and session logs land.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for CSV recordings and session logs.
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Pacing defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Minimum spacing between I/O operations on one connection.
    #[serde(with = "humantime_serde")]
    pub io_holdoff: Duration,
    /// Default wait poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Default wait timeout.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            io_holdoff: Duration::from_millis(1),
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

/// One configured instrument endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSettings {
    /// Resource string, e.g. `"ASRL3::INSTR"`.
    pub address: String,
    /// Device kind, matched against the tables in
    /// [`instruments`](crate::instruments).
    pub kind: String,
}

impl Settings {
    /// Load settings: defaults, optional file, environment overrides.
    ///
    /// With `path` given the file must exist; without it, `labrig.toml` in
    /// the working directory is used when present.
    pub fn new(path: Option<&str>) -> RigResult<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("labrig").required(false)),
        };
        let settings: Settings = builder
            .add_source(Environment::with_prefix("LABRIG").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> RigResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(RigError::Configuration(format!(
                "log_level must be one of {LEVELS:?}, got '{}'",
                self.log_level
            )));
        }
        if self.timing.poll_interval.is_zero() {
            return Err(RigError::Configuration(
                "timing.poll_interval must be non-zero (a zero interval busy-spins)".to_string(),
            ));
        }
        for (name, instrument) in &self.instruments {
            if instrument.address.trim().is_empty() {
                return Err(RigError::Configuration(format!(
                    "instrument '{name}' has an empty address"
                )));
            }
        }
        Ok(())
    }
}
