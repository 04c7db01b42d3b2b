//! Custom error types for the application.
//!
//! This module defines the primary error type, `IlluminationError`, shared by the curve
//! models, the calibration store, the calibration protocols and the power-control engine.
//! It uses the `thiserror` crate so that every failure carries the offending value and,
//! where one exists, the valid range or list of options. Operators read these messages
//! straight off the console, so they are written to be self-explanatory.
//!
//! ## Error Hierarchy
//!
//! - **`Fitting`**: a curve fit did not converge or its input was degenerate
//!   (too few points, mismatched lengths, all-equal powers). Never retried.
//! - **`OutOfRange`**: an inversion was requested outside the achievable output range of
//!   a model. The power-control engine recovers from this by clamping.
//! - **`NoSolutionInDomain`**: a periodic model could not fold its inverse into the
//!   control domain within the bounded number of periods.
//! - **`NotCalibrated`**: a power was requested while no calibration is loaded.
//! - **`NotFound`**: a calibration store query matched no rows.
//! - **`UnknownLaser`**: the referenced laser is not part of the configuration.
//! - **`Storage`**, **`StorageBusy`**, **`BackupExists`**: calibration table problems.
//! - **`Config`** / **`Configuration`**: load errors from `figment`, and semantic
//!   validation errors respectively.
//! - **`Instrument`**: wraps the `anyhow::Error` returned by hardware capability traits.
//!
//! By using `#[from]`, `IlluminationError` can be created from the underlying error types,
//! so the `?` operator works across module boundaries.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IlluminationError>;

/// Errors raised by calibration, storage and power control.
#[derive(Error, Debug)]
pub enum IlluminationError {
    /// Curve fit did not converge or the input data is degenerate.
    #[error("Fitting error: {0}")]
    Fitting(String),

    /// Inversion requested outside the achievable output range.
    #[error("Requested power {requested} is out of range. Achievable range is [{min}, {max}]")]
    OutOfRange {
        /// The requested output value.
        requested: f64,
        /// Lower end of the achievable range.
        min: f64,
        /// Upper end of the achievable range.
        max: f64,
    },

    /// The requested output is achievable, but no control value for it lies within the
    /// allowed number of curve periods of the control domain.
    #[error(
        "Requested power {requested} has no control value within {periods} periods of the \
         domain [{min}, {max}]"
    )]
    NoSolutionInDomain {
        /// The requested output value.
        requested: f64,
        /// Lower end of the control domain.
        min: f64,
        /// Upper end of the control domain.
        max: f64,
        /// Number of periods searched.
        periods: u32,
    },

    /// Power set requested before any calibration was loaded.
    #[error("No calibration present for laser '{laser}'. Run a calibration first")]
    NotCalibrated {
        /// The laser for which no calibration exists (empty if none selected).
        laser: String,
    },

    /// A calibration store query matched nothing.
    #[error("No calibration found for {0}")]
    NotFound(String),

    /// Referenced laser is not configured.
    #[error("Laser '{name}' is not available. Configured lasers: {}", .available.join(", "))]
    UnknownLaser {
        /// The requested laser name.
        name: String,
        /// Names of all configured lasers.
        available: Vec<String>,
    },

    /// Model parameters could not be loaded.
    #[error("Invalid model parameters: {0}")]
    InvalidParameters(String),

    /// A request value is not usable (NaN, infinite, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The calibration table could not be read or written.
    #[error("Calibration storage error: {0}")]
    Storage(String),

    /// The calibration table stayed locked by another writer for the whole retry window.
    #[error("Calibration database {0:?} is locked by another process")]
    StorageBusy(PathBuf),

    /// A backup with the same name already exists.
    #[error("Backup file {0:?} already exists, refusing to overwrite")]
    BackupExists(PathBuf),

    /// Configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed CSV content.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A hardware capability reported a failure.
    #[error("Instrument error: {0}")]
    Instrument(#[from] anyhow::Error),
}

impl IlluminationError {
    /// Builds an `OutOfRange` error from a `(min, max)` pair.
    pub fn out_of_range(requested: f64, range: (f64, f64)) -> Self {
        Self::OutOfRange {
            requested,
            min: range.0,
            max: range.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IlluminationError::Fitting("all powers are equal".to_string());
        assert_eq!(err.to_string(), "Fitting error: all powers are equal");
    }

    #[test]
    fn test_out_of_range_carries_range() {
        let err = IlluminationError::out_of_range(120.0, (0.0, 50.0));
        let msg = err.to_string();
        assert!(msg.contains("120"));
        assert!(msg.contains("[0, 50]"));
    }

    #[test]
    fn test_unknown_laser_lists_options() {
        let err = IlluminationError::UnknownLaser {
            name: "405".into(),
            available: vec!["488".into(), "561".into()],
        };
        assert_eq!(
            err.to_string(),
            "Laser '405' is not available. Configured lasers: 488, 561"
        );
    }
}
