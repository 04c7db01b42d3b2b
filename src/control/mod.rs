//! Power control.
//!
//! A laser offers a handful of discrete output-power set-points ("buckets"), each with
//! its own fitted attenuation curve. [`PowerControlEngine`] picks the bucket and the
//! attenuator control value that deliver a requested sample power.

mod engine;

use std::fmt;

use crate::analysis::{within_range, AttenuationModel};

pub use engine::{PowerControlEngine, PowerSetting};

/// Fraction of a bucket's maximum output that counts as reachable during bucket search.
pub const HEADROOM: f64 = 0.95;

/// One laser power set-point with its attenuation curve.
#[derive(Debug, Clone)]
pub struct PowerBucket {
    /// Laser output-power set-point in mW.
    pub laser_power: f64,
    /// Fitted curve for this set-point.
    pub model: AttenuationModel,
    /// `(min, max)` sample power the curve can deliver.
    pub achievable_range: (f64, f64),
}

/// Calibration status of the active laser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationState {
    /// No laser selected yet.
    #[default]
    Uninitialized,
    /// Buckets are loaded.
    Calibrated,
    /// The store has no usable rows for the active laser.
    NotCalibrated,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Calibrated => "calibrated",
            Self::NotCalibrated => "not calibrated",
        };
        f.write_str(s)
    }
}

/// Index of the bucket to use for `requested`.
///
/// Keeps `active` if its range already covers the request. Otherwise takes the lowest
/// laser power whose maximum output, less the headroom margin, still reaches the
/// request, falling back to the highest laser power. `buckets` must be sorted by
/// ascending laser power and non-empty.
pub fn select_bucket(buckets: &[PowerBucket], active: usize, requested: f64) -> usize {
    if let Some(bucket) = buckets.get(active) {
        if within_range(bucket.achievable_range, requested) {
            return active;
        }
    }
    buckets
        .iter()
        .position(|b| b.achievable_range.1 * HEADROOM >= requested)
        .unwrap_or_else(|| buckets.len().saturating_sub(1))
}
