//! Bridge configuration
//!
//! Stored as JSON. Every field has a default, so a partial file (or no file
//! at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::DEFAULT_BAUD_RATE;

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub link: LinkConfig,
    pub fuel: FuelConfig,
    pub storage: StorageConfig,
}

impl BridgeConfig {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

/// Serial link and scheduling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device; empty to auto-detect
    pub port_name: String,
    pub baud_rate: u32,
    /// Per-call read/write timeout on the channel
    pub read_timeout_ms: u64,
    /// Delay between reconnect attempts
    pub retry_interval_ms: u64,
    /// Consecutive I/O errors tolerated before forcing a reconnect
    pub error_threshold: u32,
    /// Minimum spacing between navigation commands
    pub navigation_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    /// Send tire frames with every Nth telemetry frame
    pub tire_frame_every: u32,
    pub idle_sleep_ms: u64,
    /// Upper bound on waiting for the worker in `stop()`
    pub join_timeout_ms: u64,
    pub max_queued_commands: usize,
    /// Push all local settings to the display after every connect
    pub resync_settings_on_connect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 50,
            retry_interval_ms: 2000,
            error_threshold: 5,
            navigation_interval_ms: 100,
            telemetry_interval_ms: 100,
            tire_frame_every: 10,
            idle_sleep_ms: 5,
            join_timeout_ms: 2000,
            max_queued_commands: 64,
            resync_settings_on_connect: true,
        }
    }
}

/// Fuel accounting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConfig {
    pub tank_capacity_gal: f64,
    /// EMA weight given to each new raw sample
    pub smoothing_alpha: f64,
    /// Below this speed the car is treated as parked/idling
    pub min_driving_speed_mph: f64,
    /// Longest gap between samples credited to distance
    pub max_tick_secs: f64,
    pub min_trip_distance_mi: f64,
    pub min_trip_fuel_gal: f64,
    /// Number of recent trips kept for the fallback average
    pub trip_window: usize,
    /// Lifetime totals are trusted once this much fuel has been logged
    pub min_lifetime_fuel_gal: f64,
    pub default_mpg: f64,
    /// Cap applied to the average before computing range
    pub max_range_mpg: f64,
    pub plausible_mpg_min: f64,
    pub plausible_mpg_max: f64,
    pub save_interval_secs: u64,
    pub update_interval_ms: u64,
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            tank_capacity_gal: 12.7,
            smoothing_alpha: 0.1,
            min_driving_speed_mph: 2.0,
            max_tick_secs: 5.0,
            min_trip_distance_mi: 0.5,
            min_trip_fuel_gal: 0.01,
            trip_window: 10,
            min_lifetime_fuel_gal: 1.0,
            default_mpg: 25.0,
            max_range_mpg: 60.0,
            plausible_mpg_min: 5.0,
            plausible_mpg_max: 60.0,
            save_interval_secs: 60,
            update_interval_ms: 500,
        }
    }
}

/// Where persisted documents live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dashlink"),
        }
    }
}

impl StorageConfig {
    pub fn tpms_cache_path(&self) -> PathBuf {
        self.data_dir.join("tpms_cache.json")
    }

    pub fn fuel_stats_path(&self) -> PathBuf {
        self.data_dir.join("fuel_stats.json")
    }
}
