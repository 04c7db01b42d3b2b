//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/illumination.toml` by default)
//! 2. Environment variables (prefixed with `ILLUMCAL_`, nested keys separated by `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! ILLUMCAL_APPLICATION__LOG_LEVEL=debug
//! ILLUMCAL_STORAGE__DATABASE=/data/calibration.csv
//! ILLUMCAL_ANALYSIS__WAIT_TIME_MS=250
//! ```
//!
//! # Example
//!
//! ```no_run
//! use illumination_cal::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load_from("config/illumination.toml")?;
//!     println!("Device: {}", settings.device.name);
//!     println!("Lasers: {}", settings.lasers.len());
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::analysis::{DomainBounds, ModelKind, ModelSpec};
use crate::error::{AppResult, IlluminationError};
use crate::hardware::Positions;
use crate::storage::{CalibrationIndex, StoreOptions};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/illumination.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "ILLUMCAL_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Calibration table settings
    pub storage: StorageConfig,
    /// Attenuating device identity
    pub device: DeviceConfig,
    /// Sweep and curve model settings
    pub analysis: AnalysisConfig,
    /// Attenuator driver
    pub attenuator: DeviceDefinition,
    /// Power meter driver
    pub power_meter: DeviceDefinition,
    /// Lasers by name
    #[serde(default)]
    pub lasers: BTreeMap<String, LaserDefinition>,
    /// Beam-path objects by id
    #[serde(default)]
    pub beam_path: BTreeMap<String, DeviceDefinition>,
    /// Index of the single-curve calibration
    #[serde(default)]
    pub calibration: Option<CalibrationTarget>,
    /// Laser x power calibration protocol
    #[serde(default)]
    pub protocol: Option<ProtocolConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Calibration table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// CSV file holding the calibration history
    pub database: PathBuf,
    /// Directory for diagnostic curve exports (defaults to the database directory)
    #[serde(default)]
    pub plot_dir: Option<PathBuf>,
    /// Total retry window for locked or unreadable tables, in milliseconds
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_ms: u64,
    /// Age in seconds after which a lock file is considered abandoned
    #[serde(default = "default_stale_lock")]
    pub stale_lock_secs: u64,
}

/// Identity of the attenuating device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// DEVICE key written with every calibration
    pub name: String,
}

/// Sweep and curve model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Curve model (sinusoidal, linear, polynomial, point)
    pub model: String,
    /// Lowest control value
    pub min: f64,
    /// Highest control value
    pub max: f64,
    /// Sweep step
    pub step: f64,
    /// Forward degree of polynomial models
    #[serde(default = "default_polydegree")]
    pub polydegree: usize,
    /// Power-meter readings averaged per sweep point
    #[serde(default = "default_averaging")]
    pub averaging: u32,
    /// Delay between moving the attenuator and reading, in milliseconds
    #[serde(default = "default_wait_time")]
    pub wait_time_ms: u64,
}

/// Driver selection for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Driver name in the device registry
    pub r#type: String,
    /// Driver-specific options
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Laser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserDefinition {
    /// Driver name in the device registry
    pub r#type: String,
    /// Emission wavelength in nm
    pub wavelength_nm: f64,
    /// Delay after a power change, in milliseconds
    #[serde(default)]
    pub warmup_ms: u64,
    /// Lowest settable power in mW
    #[serde(default)]
    pub min_power: Option<f64>,
    /// Highest settable power in mW
    #[serde(default)]
    pub max_power: Option<f64>,
    /// Driver-specific options
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

/// Index of a single-curve calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTarget {
    /// Wavelength in nm
    pub wavelength: f64,
    /// Laser power set-point in mW
    pub laser_power: f64,
}

/// Laser x power protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Lasers to calibrate, in order
    pub laser_sequence: Vec<String>,
    /// Power set-points per laser, in mW
    pub laser_powers: BTreeMap<String, Vec<f64>>,
    /// Beam-path positions to apply before calibrating each laser
    #[serde(default)]
    pub beam_path: BTreeMap<String, Positions>,
    /// Beam-path positions to restore after the protocol
    #[serde(default)]
    pub end: Option<Positions>,
}

// ============================================================================
// Default value functions
// ============================================================================

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "illumination_cal".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retry_timeout() -> u64 {
    10_000
}

fn default_stale_lock() -> u64 {
    120
}

fn default_polydegree() -> usize {
    10
}

fn default_averaging() -> u32 {
    1
}

fn default_wait_time() -> u64 {
    100
}

// ============================================================================
// Derived values
// ============================================================================

impl StorageConfig {
    /// Lock and retry tuning for the calibration store.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            retry_timeout: Duration::from_millis(self.retry_timeout_ms),
            stale_lock_age: Duration::from_secs(self.stale_lock_secs),
        }
    }

    /// Directory receiving curve exports.
    pub fn plot_dir(&self) -> PathBuf {
        match &self.plot_dir {
            Some(dir) => dir.clone(),
            None => self
                .database
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }
}

impl AnalysisConfig {
    /// Model constructor arguments.
    pub fn model_spec(&self) -> AppResult<ModelSpec> {
        Ok(ModelSpec {
            kind: self.model.parse::<ModelKind>()?,
            domain: DomainBounds::new(self.min, self.max),
            polydegree: self.polydegree,
        })
    }

    /// Control values of a sweep from `min` to `max` inclusive.
    ///
    /// When `step` does not divide the range, `max` is appended as a shorter last step.
    pub fn sweep_points(&self) -> Vec<f64> {
        let count = ((self.max - self.min) / self.step + 1e-9).floor() as usize + 1;
        let mut points: Vec<f64> = (0..count)
            .map(|i| self.min + i as f64 * self.step)
            .collect();
        if points.last().map_or(true, |&last| self.max - last > self.step * 1e-9) {
            points.push(self.max);
        }
        points
    }

    /// Settling delay per sweep point.
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl DeviceDefinition {
    /// Driver definition without options.
    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            r#type: kind.into(),
            options: BTreeMap::new(),
        }
    }

    /// Numeric option, or `default` when absent.
    pub fn option_f64(&self, key: &str, default: f64) -> AppResult<f64> {
        match self.options.get(key) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| {
                IlluminationError::Configuration(format!(
                    "Option '{}' of device type '{}' must be a number, got {}",
                    key, self.r#type, value
                ))
            }),
        }
    }
}

impl CalibrationTarget {
    /// Record index for `device`.
    pub fn index(&self, device: &str) -> CalibrationIndex {
        CalibrationIndex::new(device, self.wavelength, self.laser_power)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`ILLUMCAL_` prefix) take precedence over the file.
    /// After loading, configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns `IlluminationError::Config` if the file cannot be parsed and
    /// `IlluminationError::Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `IlluminationError::Configuration` with a descriptive message for any
    /// validation failure.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(IlluminationError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.storage.database.as_os_str().is_empty() {
            return invalid("storage.database must not be empty".to_string());
        }

        if self.device.name.trim().is_empty() {
            return invalid("device.name must not be empty".to_string());
        }

        let spec = self.analysis.model_spec()?;
        let analysis = &self.analysis;
        if !(analysis.min.is_finite() && analysis.max.is_finite()) {
            return invalid(format!(
                "analysis.min and analysis.max must be finite, got [{}, {}]",
                analysis.min, analysis.max
            ));
        }
        let empty_domain_ok = spec.kind == ModelKind::Point && analysis.min == analysis.max;
        if analysis.min >= analysis.max && !empty_domain_ok {
            return invalid(format!(
                "analysis.min ({}) must be below analysis.max ({})",
                analysis.min, analysis.max
            ));
        }
        if !(analysis.step > 0.0 && analysis.step.is_finite()) {
            return invalid(format!(
                "analysis.step must be positive, got {}",
                analysis.step
            ));
        }
        if analysis.polydegree == 0 {
            return invalid("analysis.polydegree must be at least 1".to_string());
        }
        if analysis.averaging == 0 {
            return invalid("analysis.averaging must be at least 1".to_string());
        }

        for (name, laser) in &self.lasers {
            if !(laser.wavelength_nm > 0.0) {
                return invalid(format!(
                    "Laser '{}' has invalid wavelength_nm {}. Must be positive",
                    name, laser.wavelength_nm
                ));
            }
            if let (Some(min), Some(max)) = (laser.min_power, laser.max_power) {
                if min > max {
                    return invalid(format!(
                        "Laser '{}' has min_power {} above max_power {}",
                        name, min, max
                    ));
                }
            }
        }

        if let Some(protocol) = &self.protocol {
            for (laser, powers) in &protocol.laser_powers {
                if powers.is_empty() {
                    return invalid(format!(
                        "protocol.laser_powers.{} must list at least one power",
                        laser
                    ));
                }
                if let Some(bad) = powers.iter().find(|p| !(**p > 0.0)) {
                    return invalid(format!(
                        "protocol.laser_powers.{} contains invalid power {}. Must be positive",
                        laser, bad
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "bench"
        log_level = "debug"

        [storage]
        database = "data/calibration.csv"

        [device]
        name = "M1"

        [analysis]
        model = "sinusoidal"
        min = 0.0
        max = 90.0
        step = 5.0

        [attenuator]
        type = "simulated"

        [power_meter]
        type = "simulated"
        options = { noise = 0.01 }

        [lasers.488]
        type = "simulated"
        wavelength_nm = 488.0
        max_power = 200.0

        [beam_path.mirror]
        type = "simulated"

        [protocol]
        laser_sequence = ["488", "405"]
        laser_powers = { 488 = [50.0, 100.0] }
        beam_path = { 488 = { mirror = "in" } }
        end = { mirror = "out" }
    "#;

    fn sample() -> Settings {
        Figment::from(Toml::string(SAMPLE)).extract().unwrap()
    }

    #[test]
    fn test_sample_parses_with_defaults() {
        let settings = sample();
        settings.validate().unwrap();
        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.storage.retry_timeout_ms, 10_000);
        assert_eq!(settings.storage.stale_lock_secs, 120);
        assert_eq!(settings.storage.plot_dir(), PathBuf::from("data"));
        assert_eq!(settings.analysis.polydegree, 10);
        assert_eq!(settings.analysis.averaging, 1);
        assert_eq!(settings.analysis.wait_time_ms, 100);
        assert_eq!(settings.lasers["488"].max_power, Some(200.0));
        assert_eq!(settings.power_meter.option_f64("noise", 0.0).unwrap(), 0.01);

        let protocol = settings.protocol.unwrap();
        assert_eq!(protocol.laser_sequence, vec!["488", "405"]);
        assert_eq!(
            protocol.beam_path["488"]["mirror"],
            crate::hardware::PositionValue::Label("in".into())
        );
    }

    #[test]
    fn test_sweep_points_include_max() {
        let analysis = sample().analysis;
        let points = analysis.sweep_points();
        assert_eq!(points.len(), 19);
        assert_eq!(points[0], 0.0);
        assert_eq!(points[18], 90.0);

        let uneven = AnalysisConfig {
            step: 0.1,
            min: 0.0,
            max: 0.3,
            ..analysis
        };
        assert_eq!(uneven.sweep_points().len(), 4);

        let remainder = AnalysisConfig {
            step: 3.0,
            max: 10.0,
            ..uneven
        };
        assert_eq!(remainder.sweep_points(), vec![0.0, 3.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = sample();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level 'verbose'"));
    }

    #[test]
    fn test_invalid_domain_and_step() {
        let mut settings = sample();
        settings.analysis.min = 90.0;
        settings.analysis.max = 0.0;
        assert!(settings.validate().unwrap_err().to_string().contains("must be below"));

        let mut settings = sample();
        settings.analysis.step = 0.0;
        assert!(settings.validate().unwrap_err().to_string().contains("step"));
    }

    #[test]
    fn test_point_model_allows_single_position() {
        let mut settings = sample();
        settings.analysis.model = "point".to_string();
        settings.analysis.min = 0.0;
        settings.analysis.max = 0.0;
        settings.validate().unwrap();
        assert_eq!(settings.analysis.sweep_points(), vec![0.0]);
    }

    #[test]
    fn test_unknown_model() {
        let mut settings = sample();
        settings.analysis.model = "spline".to_string();
        let msg = settings.validate().unwrap_err().to_string();
        assert!(msg.contains("spline"));
        assert!(msg.contains("sinusoidal"));
    }

    #[test]
    fn test_invalid_protocol_powers() {
        let mut settings = sample();
        if let Some(protocol) = settings.protocol.as_mut() {
            protocol.laser_powers.insert("488".into(), vec![50.0, -1.0]);
        }
        let msg = settings.validate().unwrap_err().to_string();
        assert!(msg.contains("invalid power -1"));
    }

    #[test]
    fn test_invalid_laser_wavelength() {
        let mut settings = sample();
        if let Some(laser) = settings.lasers.get_mut("488") {
            laser.wavelength_nm = 0.0;
        }
        assert!(settings.validate().unwrap_err().to_string().contains("wavelength_nm"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("illumination.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.device.name, "M1");
    }

    #[test]
    fn test_option_type_error() {
        let mut definition = DeviceDefinition::of_type("simulated");
        definition
            .options
            .insert("noise".into(), serde_json::Value::String("high".into()));
        let err = definition.option_f64("noise", 0.0).unwrap_err();
        assert!(err.to_string().contains("must be a number"));
    }
}
