//! Calibration protocols.
//!
//! A single-curve protocol sweeps the attenuator over the configured control range,
//! reads the power meter at every step, fits the configured curve model and stores the
//! parameters under `(device, wavelength, laser power)`. The laser x power protocol
//! repeats that for every laser of a sequence and every power set-point of the laser.

pub mod plot;
mod protocol;

use std::time::Duration;

use crate::config::AnalysisConfig;

pub use plot::{CalibrationPlotter, CsvPlotExporter, LaserSummary, NoopPlotter};
pub use protocol::{
    CalibrationOutcome, CalibrationProtocol1D, CalibrationProtocol2D, LaserCalibration,
    ProtocolReport,
};

/// Measured `(control value, power)` pairs of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepData {
    /// Attenuator control values, in sweep order.
    pub positions: Vec<f64>,
    /// Power readings in mW.
    pub powers: Vec<f64>,
}

impl SweepData {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if nothing was measured.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Where and how to sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSettings {
    /// Control values to visit, in order.
    pub points: Vec<f64>,
    /// Settling delay between moving and reading.
    pub wait: Duration,
    /// Meter readings averaged per point.
    pub averaging: u32,
}

impl From<&AnalysisConfig> for SweepSettings {
    fn from(analysis: &AnalysisConfig) -> Self {
        Self {
            points: analysis.sweep_points(),
            wait: analysis.wait_time(),
            averaging: analysis.averaging,
        }
    }
}
