//! Driver registry.
//!
//! Maps the `type` strings found in configuration to constructors. The table is built
//! once at startup; drivers are plain functions, so adding a driver means registering
//! one more function. Every constructor receives the shared [`SimulatedBench`] as an
//! explicit handle instead of reaching for global state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::capabilities::{Attenuator, BeamPath, BeamPathObject, Laser, PositionValue, PowerMeter};
use super::mock::{SimulatedBench, SimulatedBeamPathObject, SimulatedLaser, SimulatedResponse};
use crate::config::{DeviceDefinition, LaserDefinition, Settings};
use crate::error::{AppResult, IlluminationError};

/// Builds an attenuator from its definition.
pub type AttenuatorFactory =
    fn(&DeviceDefinition, &SimulatedBench) -> AppResult<Arc<dyn Attenuator>>;
/// Builds a power meter from its definition.
pub type PowerMeterFactory =
    fn(&DeviceDefinition, &SimulatedBench) -> AppResult<Arc<dyn PowerMeter>>;
/// Builds a named laser from its definition.
pub type LaserFactory =
    fn(&str, &LaserDefinition, &SimulatedBench) -> AppResult<Arc<dyn Laser>>;
/// Builds a beam-path object from its definition.
pub type BeamPathFactory =
    fn(&DeviceDefinition, &SimulatedBench) -> AppResult<Arc<dyn BeamPathObject>>;

/// Everything the protocols and the engine drive.
#[derive(Clone)]
pub struct Instruments {
    /// Attenuating device
    pub attenuator: Arc<dyn Attenuator>,
    /// Power meter at the sample plane
    pub power_meter: Arc<dyn PowerMeter>,
    /// Lasers by name
    pub lasers: BTreeMap<String, Arc<dyn Laser>>,
    /// Light routing
    pub beam_path: BeamPath,
}

/// Type-name to constructor table.
pub struct DeviceRegistry {
    attenuators: BTreeMap<String, AttenuatorFactory>,
    power_meters: BTreeMap<String, PowerMeterFactory>,
    lasers: BTreeMap<String, LaserFactory>,
    beam_path: BTreeMap<String, BeamPathFactory>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn lookup<'a, T>(role: &str, requested: &str, known: &'a BTreeMap<String, T>) -> AppResult<&'a T> {
    known.get(requested).ok_or_else(|| {
        IlluminationError::Configuration(format!(
            "Unknown {} type '{}'. Available types: {}",
            role,
            requested,
            known.keys().cloned().collect::<Vec<_>>().join(", ")
        ))
    })
}

fn simulated_attenuator(
    definition: &DeviceDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn Attenuator>> {
    let settle_ms = definition.option_f64("settle_ms", 0.0)?;
    Ok(Arc::new(
        bench
            .attenuator()
            .with_settle_time(Duration::from_secs_f64(settle_ms.max(0.0) / 1000.0)),
    ))
}

fn simulated_power_meter(
    definition: &DeviceDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn PowerMeter>> {
    let defaults = SimulatedResponse::default();
    let response = SimulatedResponse {
        background: definition.option_f64("background", defaults.background)?,
        phase: definition.option_f64("phase", defaults.phase)?,
        noise: definition.option_f64("noise", defaults.noise)?,
    };
    Ok(Arc::new(bench.power_meter(response)))
}

fn simulated_laser(
    name: &str,
    definition: &LaserDefinition,
    bench: &SimulatedBench,
) -> AppResult<Arc<dyn Laser>> {
    let laser = SimulatedLaser::new(name, definition.wavelength_nm)
        .with_limits(definition.min_power, definition.max_power)
        .with_warmup(Duration::from_millis(definition.warmup_ms));
    Ok(bench.add_laser(laser))
}

fn simulated_beam_path_object(
    definition: &DeviceDefinition,
    _bench: &SimulatedBench,
) -> AppResult<Arc<dyn BeamPathObject>> {
    let initial = match definition.options.get("initial") {
        None => PositionValue::Flag(false),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            IlluminationError::Configuration(format!(
                "Invalid initial position {} for beam-path object: {}",
                value, e
            ))
        })?,
    };
    Ok(Arc::new(SimulatedBeamPathObject::new(initial)))
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            attenuators: BTreeMap::new(),
            power_meters: BTreeMap::new(),
            lasers: BTreeMap::new(),
            beam_path: BTreeMap::new(),
        }
    }

    /// Registry with the simulated drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_attenuator("simulated", simulated_attenuator);
        registry.register_power_meter("simulated", simulated_power_meter);
        registry.register_laser("simulated", simulated_laser);
        registry.register_beam_path_object("simulated", simulated_beam_path_object);
        registry
    }

    /// Adds an attenuator driver.
    pub fn register_attenuator(&mut self, name: &str, factory: AttenuatorFactory) {
        self.attenuators.insert(name.to_string(), factory);
    }

    /// Adds a power meter driver.
    pub fn register_power_meter(&mut self, name: &str, factory: PowerMeterFactory) {
        self.power_meters.insert(name.to_string(), factory);
    }

    /// Adds a laser driver.
    pub fn register_laser(&mut self, name: &str, factory: LaserFactory) {
        self.lasers.insert(name.to_string(), factory);
    }

    /// Adds a beam-path object driver.
    pub fn register_beam_path_object(&mut self, name: &str, factory: BeamPathFactory) {
        self.beam_path.insert(name.to_string(), factory);
    }

    /// Instantiates every device named in `settings`.
    ///
    /// Fails with [`IlluminationError::Configuration`] naming the available types if a
    /// definition refers to an unregistered driver.
    pub fn build(&self, settings: &Settings) -> AppResult<Instruments> {
        let bench = SimulatedBench::new();

        let attenuator_type = settings.attenuator.r#type.as_str();
        let attenuator = lookup("attenuator", attenuator_type, &self.attenuators)?(
            &settings.attenuator,
            &bench,
        )?;

        let mut lasers = BTreeMap::new();
        for (name, definition) in &settings.lasers {
            let factory = lookup("laser", &definition.r#type, &self.lasers)?;
            lasers.insert(name.clone(), factory(name, definition, &bench)?);
        }

        let meter_type = settings.power_meter.r#type.as_str();
        let power_meter = lookup("power meter", meter_type, &self.power_meters)?(
            &settings.power_meter,
            &bench,
        )?;

        let mut beam_path = BeamPath::new();
        for (id, definition) in &settings.beam_path {
            let factory = lookup("beam-path object", &definition.r#type, &self.beam_path)?;
            beam_path.insert(id.clone(), factory(definition, &bench)?);
        }

        info!(
            attenuator = attenuator_type,
            power_meter = meter_type,
            lasers = lasers.len(),
            beam_path_objects = beam_path.ids().len(),
            "instruments ready"
        );
        Ok(Instruments {
            attenuator,
            power_meter,
            lasers,
            beam_path,
        })
    }
}
