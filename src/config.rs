//! Station configuration using Figment.
//!
//! Configuration is layered, later layers winning:
//! 1. built-in defaults
//! 2. `config/threepio.toml`
//! 3. environment variables prefixed with `THREEPIO_`, sections separated by
//!    a double underscore (e.g. `THREEPIO_CLOCK__TICK_MS=5`)
//!
//! # Example
//! ```no_run
//! use threepio::config::ThreepioConfig;
//!
//! let config = ThreepioConfig::load()?;
//! config.validate()?;
//! println!("Telescope: {}", config.telescope.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::clock::GREEN_BANK_LONGITUDE;
use crate::hardware::{SimulationParams, DEFAULT_TAGS};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/threepio.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreepioConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Telescope identity and location
    pub telescope: TelescopeConfig,
    /// Tick loop and sidereal clock
    pub clock: ClockConfig,
    /// Declination calibration files
    pub calibration: CalibrationFiles,
    /// Observation output
    pub storage: StorageConfig,
    /// Instruments
    pub hardware: HardwareConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Threepio".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Telescope identity and location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    /// Name written into every observation's metadata block
    pub name: String,
    /// Degrees east; seeds the sidereal estimate before calibration
    pub longitude: f64,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            name: "The Mighty Forty".to_string(),
            longitude: GREEN_BANK_LONGITUDE,
        }
    }
}

/// Tick loop and clock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Period of the outer tick driving `run_due`, milliseconds
    pub tick_ms: u64,
    /// Sampling rate while no observation is running, Hz
    pub idle_rate_hz: f64,
    /// Period of the status log line, milliseconds (0 disables it)
    pub status_interval_ms: u64,
    /// RA calibration record
    pub ra_record: PathBuf,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            idle_rate_hz: 1.0,
            status_interval_ms: 10_000,
            ra_record: PathBuf::from("ra-cal.txt"),
        }
    }
}

/// Declination calibration file locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationFiles {
    /// Active calibration table
    pub table: PathBuf,
    /// Where the previous table is copied before being overwritten
    pub backup: PathBuf,
}

impl Default for CalibrationFiles {
    fn default() -> Self {
        Self {
            table: PathBuf::from("dec-cal.txt"),
            backup: PathBuf::from("dec-cal-backup.txt"),
        }
    }
}

/// Observation output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory observation files are written to
    pub output_dir: PathBuf,
    /// Write one composite file instead of separate A/B files
    pub composite: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            composite: false,
        }
    }
}

/// Instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Skip discovery and simulate every instrument
    pub simulate: bool,
    /// Front end baud rate
    pub front_end_baud: u32,
    /// Angle sensor baud rate
    pub angle_sensor_baud: u32,
    /// Front end scan list
    pub channel_tags: Vec<u16>,
    /// Synthetic signal parameters
    pub simulation: SimulationParams,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            front_end_baud: 115_200,
            angle_sensor_baud: 9_600,
            channel_tags: DEFAULT_TAGS.to_vec(),
            simulation: SimulationParams::default(),
        }
    }
}

impl ThreepioConfig {
    /// Load configuration from `config/threepio.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ThreepioConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("THREEPIO_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.telescope.name.trim().is_empty() {
            return Err("Telescope name must not be empty".to_string());
        }

        if self.clock.tick_ms == 0 {
            return Err("clock.tick_ms must be greater than 0".to_string());
        }

        if !(self.clock.idle_rate_hz > 0.0) {
            return Err(format!(
                "clock.idle_rate_hz must be positive, got {}",
                self.clock.idle_rate_hz
            ));
        }

        if self.hardware.channel_tags.len() < 2 {
            return Err(format!(
                "hardware.channel_tags needs at least 2 entries, got {}",
                self.hardware.channel_tags.len()
            ));
        }

        if self.hardware.front_end_baud == 0 || self.hardware.angle_sensor_baud == 0 {
            return Err("Baud rates must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ThreepioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.telescope.name, "The Mighty Forty");
        assert_eq!(config.hardware.channel_tags, vec![0x0100, 0x0101, 0x0102]);
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ThreepioConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.clock, ClockConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threepio.toml");
        std::fs::write(
            &path,
            r#"
[application]
log_level = "debug"

[storage]
composite = true

[hardware]
simulate = true

[hardware.simulation]
noise = 0.0
"#,
        )
        .unwrap();

        let config = ThreepioConfig::load_from(&path).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, "pretty");
        assert!(config.storage.composite);
        assert!(config.hardware.simulate);
        assert_eq!(config.hardware.simulation.noise, 0.0);
        assert_eq!(config.hardware.simulation.variance, 1.0);
    }

    #[test]
    fn invalid_log_level() {
        let mut config = ThreepioConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let mut config = ThreepioConfig::default();
        config.clock.tick_ms = 0;
        assert!(config.validate().unwrap_err().contains("tick_ms"));
    }

    #[test]
    fn single_channel_scan_list_is_rejected() {
        let mut config = ThreepioConfig::default();
        config.hardware.channel_tags = vec![0x0100];
        assert!(config.validate().is_err());
    }
}
