//! Atomic hardware capabilities.
//!
//! The calibration protocols and the power-control engine only talk to hardware
//! through these traits. Drivers (rotation mounts, AOTFs, laser controllers, power
//! meters, microscope beam-path objects) implement the subset they support.
//!
//! All methods are async and return `anyhow::Result` so drivers can attach whatever
//! context their transport provides. Setters are expected to block until the device
//! has settled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, IlluminationError};

/// Device that attenuates the beam as a function of one control value.
#[async_trait]
pub trait Attenuator: Send + Sync {
    /// Moves to `value` and waits until settled.
    async fn set(&self, value: f64) -> Result<()>;

    /// Runs the homing sequence.
    async fn home(&self) -> Result<()>;

    /// Current control value.
    async fn position(&self) -> Result<f64>;
}

/// Laser with an enable switch and an output-power set-point (mW).
#[async_trait]
pub trait Laser: Send + Sync {
    /// Emission wavelength in nm.
    fn wavelength(&self) -> f64;

    /// Lowest settable power, if known.
    fn min_power(&self) -> Option<f64>;

    /// Highest settable power, if known.
    fn max_power(&self) -> Option<f64>;

    /// Whether emission is enabled.
    async fn is_enabled(&self) -> Result<bool>;

    /// Enables or disables emission.
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Current power set-point in mW.
    async fn power(&self) -> Result<f64>;

    /// Changes the power set-point; returns once the laser has warmed up.
    async fn set_power(&self, power_mw: f64) -> Result<()>;
}

/// Optical power meter.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Mean of `averaging` readings, in mW.
    async fn read(&self, averaging: u32) -> Result<f64>;

    /// Retunes the sensor calibration to `wavelength_nm`.
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()>;

    /// Wavelength the sensor is currently tuned to.
    async fn wavelength(&self) -> Result<f64>;
}

/// Position of a beam-path object: a shutter flag, a turret slot or a named state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionValue {
    /// Open/closed, in/out.
    Flag(bool),
    /// Numeric slot or coordinate.
    Number(f64),
    /// Named state.
    Label(String),
}

impl fmt::Display for PositionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionValue::Flag(v) => write!(f, "{}", v),
            PositionValue::Number(v) => write!(f, "{}", v),
            PositionValue::Label(v) => f.write_str(v),
        }
    }
}

/// Object in the microscope light path (mirror, filter wheel, shutter, ...).
#[async_trait]
pub trait BeamPathObject: Send + Sync {
    /// Current position.
    async fn position(&self) -> Result<PositionValue>;

    /// Moves to `position`.
    async fn set_position(&self, position: &PositionValue) -> Result<()>;
}

/// Positions keyed by beam-path object id.
pub type Positions = BTreeMap<String, PositionValue>;

/// The set of beam-path objects routing light to the sample.
///
/// Objects are handed in at construction; any shared controller handle they need is
/// owned by the objects themselves.
#[derive(Default, Clone)]
pub struct BeamPath {
    objects: BTreeMap<String, Arc<dyn BeamPathObject>>,
}

impl fmt::Debug for BeamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeamPath")
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BeamPath {
    /// Empty beam path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an object.
    pub fn insert(&mut self, id: impl Into<String>, object: Arc<dyn BeamPathObject>) {
        self.objects.insert(id.into(), object);
    }

    /// Object ids.
    pub fn ids(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    /// Returns true if no objects are configured.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Current position of every object.
    pub async fn positions(&self) -> AppResult<Positions> {
        let mut out = Positions::new();
        for (id, object) in &self.objects {
            out.insert(id.clone(), object.position().await?);
        }
        Ok(out)
    }

    /// Moves the listed objects. Every id is checked before anything moves.
    pub async fn set_positions(&self, positions: &Positions) -> AppResult<()> {
        if let Some(unknown) = positions.keys().find(|id| !self.objects.contains_key(*id)) {
            return Err(IlluminationError::Configuration(format!(
                "Beam-path object '{}' is not configured. Available objects: {}",
                unknown,
                self.ids().join(", ")
            )));
        }
        for (id, position) in positions {
            if let Some(object) = self.objects.get(id) {
                object.set_position(position).await?;
            }
        }
        Ok(())
    }
}
