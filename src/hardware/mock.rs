//! Simulated Hardware
//!
//! A complete illumination bench without physical devices, used by the tests and by
//! the `simulated` entries of the device registry. All devices use async-safe
//! operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Devices
//!
//! - `SimulatedAttenuator` - rotation mount whose angle is shared with the power meter
//! - `SimulatedLaser` - laser with enable flag, power set-point and warm-up delay
//! - `SimulatedPowerMeter` - reads the sum over enabled lasers of
//!   `power * transmission(angle)` plus optional uniform noise
//! - `SimulatedBeamPathObject` - remembers the last position it was sent to
//!
//! The transmission follows a polarizer: `background + (1 - background) * (1 + sin(4 * (angle + phase))) / 2`.

use std::f64::consts::PI;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::capabilities::{Attenuator, BeamPathObject, Laser, PositionValue, PowerMeter};

// =============================================================================
// SimulatedBench - shared state
// =============================================================================

#[derive(Default)]
struct BenchState {
    angle: RwLock<f64>,
    lasers: StdRwLock<Vec<Arc<SimulatedLaser>>>,
}

/// Shared optical state of the simulated devices.
///
/// Cloning is cheap; every clone refers to the same bench.
#[derive(Clone, Default)]
pub struct SimulatedBench {
    state: Arc<BenchState>,
}

impl SimulatedBench {
    /// Empty bench, attenuator at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attenuator driving the bench angle.
    pub fn attenuator(&self) -> SimulatedAttenuator {
        SimulatedAttenuator {
            bench: self.clone(),
            settle: Duration::ZERO,
        }
    }

    /// Registers a laser so the power meter sees its light.
    pub fn add_laser(&self, laser: SimulatedLaser) -> Arc<SimulatedLaser> {
        let laser = Arc::new(laser);
        self.state
            .lasers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&laser));
        laser
    }

    /// Power meter looking at this bench.
    pub fn power_meter(&self, response: SimulatedResponse) -> SimulatedPowerMeter {
        SimulatedPowerMeter {
            bench: self.clone(),
            response,
            wavelength: RwLock::new(0.0),
        }
    }

    /// Current attenuator angle.
    pub async fn angle(&self) -> f64 {
        *self.state.angle.read().await
    }
}

// =============================================================================
// SimulatedAttenuator
// =============================================================================

/// Rotation mount on the simulated bench.
pub struct SimulatedAttenuator {
    bench: SimulatedBench,
    settle: Duration,
}

impl SimulatedAttenuator {
    /// Adds a settling delay after each move.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait]
impl Attenuator for SimulatedAttenuator {
    async fn set(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            bail!("Cannot move attenuator to non-finite position {}", value);
        }
        *self.bench.state.angle.write().await = value;
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.set(0.0).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.bench.angle().await)
    }
}

// =============================================================================
// SimulatedLaser
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct LaserState {
    enabled: bool,
    power: f64,
}

/// Laser on the simulated bench.
pub struct SimulatedLaser {
    name: String,
    wavelength: f64,
    min_power: Option<f64>,
    max_power: Option<f64>,
    warmup: Duration,
    state: RwLock<LaserState>,
}

impl SimulatedLaser {
    /// Disabled laser at 0 mW with no known power limits.
    pub fn new(name: impl Into<String>, wavelength: f64) -> Self {
        Self {
            name: name.into(),
            wavelength,
            min_power: None,
            max_power: None,
            warmup: Duration::ZERO,
            state: RwLock::new(LaserState {
                enabled: false,
                power: 0.0,
            }),
        }
    }

    /// Sets the settable power range.
    pub fn with_limits(mut self, min_power: Option<f64>, max_power: Option<f64>) -> Self {
        self.min_power = min_power;
        self.max_power = max_power;
        self
    }

    /// Sets the delay applied after every power change.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Laser name.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn emitted_power(&self) -> f64 {
        let state = *self.state.read().await;
        if state.enabled {
            state.power
        } else {
            0.0
        }
    }
}

#[async_trait]
impl Laser for SimulatedLaser {
    fn wavelength(&self) -> f64 {
        self.wavelength
    }

    fn min_power(&self) -> Option<f64> {
        self.min_power
    }

    fn max_power(&self) -> Option<f64> {
        self.max_power
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.state.read().await.enabled)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.state.write().await.enabled = enabled;
        Ok(())
    }

    async fn power(&self) -> Result<f64> {
        Ok(self.state.read().await.power)
    }

    async fn set_power(&self, power_mw: f64) -> Result<()> {
        let too_low = self.min_power.map_or(false, |min| power_mw < min);
        let too_high = self.max_power.map_or(false, |max| power_mw > max);
        if !power_mw.is_finite() || power_mw < 0.0 || too_low || too_high {
            bail!(
                "Laser {} cannot be set to {} mW (limits {:?} to {:?})",
                self.name,
                power_mw,
                self.min_power,
                self.max_power
            );
        }
        {
            let mut state = self.state.write().await;
            if state.power == power_mw {
                debug!(laser = %self.name, power_mw, "power unchanged, skipping");
                return Ok(());
            }
            state.power = power_mw;
        }
        if !self.warmup.is_zero() {
            debug!(laser = %self.name, warmup_ms = self.warmup.as_millis() as u64, "warming up");
            sleep(self.warmup).await;
        }
        Ok(())
    }
}

// =============================================================================
// SimulatedPowerMeter
// =============================================================================

/// Optical response of the simulated attenuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedResponse {
    /// Fraction of the light transmitted at minimum.
    pub background: f64,
    /// Phase offset in degrees.
    pub phase: f64,
    /// Half-width of the uniform reading noise, in mW.
    pub noise: f64,
}

impl Default for SimulatedResponse {
    fn default() -> Self {
        Self {
            background: 0.02,
            phase: 12.0,
            noise: 0.0,
        }
    }
}

impl SimulatedResponse {
    /// Transmitted fraction at `angle` degrees.
    pub fn transmission(&self, angle: f64) -> f64 {
        let modulation = (1.0 + (4.0 * PI / 180.0 * (angle + self.phase)).sin()) / 2.0;
        self.background + (1.0 - self.background) * modulation
    }
}

/// Power meter on the simulated bench.
pub struct SimulatedPowerMeter {
    bench: SimulatedBench,
    response: SimulatedResponse,
    wavelength: RwLock<f64>,
}

#[async_trait]
impl PowerMeter for SimulatedPowerMeter {
    async fn read(&self, averaging: u32) -> Result<f64> {
        let angle = self.bench.angle().await;
        let lasers = self
            .bench
            .state
            .lasers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut incident = 0.0;
        for laser in &lasers {
            incident += laser.emitted_power().await;
        }
        let exact = incident * self.response.transmission(angle);

        let samples = averaging.max(1);
        let noise = self.response.noise;
        let total: f64 = if noise > 0.0 {
            let mut rng = rand::thread_rng();
            (0..samples)
                .map(|_| exact + rng.gen_range(-noise..=noise))
                .sum()
        } else {
            exact * samples as f64
        };
        Ok(total / samples as f64)
    }

    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        if !(wavelength_nm > 0.0) {
            bail!("Power meter wavelength must be positive, got {} nm", wavelength_nm);
        }
        *self.wavelength.write().await = wavelength_nm;
        Ok(())
    }

    async fn wavelength(&self) -> Result<f64> {
        Ok(*self.wavelength.read().await)
    }
}

// =============================================================================
// SimulatedBeamPathObject
// =============================================================================

/// Beam-path object that stores its position.
pub struct SimulatedBeamPathObject {
    position: RwLock<PositionValue>,
}

impl SimulatedBeamPathObject {
    /// Object starting at `initial`.
    pub fn new(initial: PositionValue) -> Self {
        Self {
            position: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl BeamPathObject for SimulatedBeamPathObject {
    async fn position(&self) -> Result<PositionValue> {
        Ok(self.position.read().await.clone())
    }

    async fn set_position(&self, position: &PositionValue) -> Result<()> {
        *self.position.write().await = position.clone();
        Ok(())
    }
}
