use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{select_bucket, CalibrationState, PowerBucket};
use crate::analysis::{AttenuationModel, CurveModel, ModelSpec};
use crate::config::Settings;
use crate::error::{AppResult, IlluminationError};
use crate::hardware::{Attenuator, Instruments, Laser};
use crate::storage::{CalibrationStore, IndexQuery, TimeSelector};

/// What [`PowerControlEngine::set_power`] applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSetting {
    /// Laser output-power set-point of the chosen bucket, in mW.
    pub laser_power: f64,
    /// Attenuator control value sent to the device.
    pub control_value: f64,
    /// Sample power asked for.
    pub requested: f64,
    /// Sample power the curve predicts at `control_value`.
    pub applied_power: f64,
    /// Whether `requested` had to be clamped into the bucket's range.
    pub clamped: bool,
}

/// Turns requested sample powers into laser set-points and attenuator positions.
pub struct PowerControlEngine {
    device: String,
    lasers: BTreeMap<String, Arc<dyn Laser>>,
    attenuator: Arc<dyn Attenuator>,
    store: CalibrationStore,
    model: ModelSpec,
    active_laser: Option<String>,
    active_bucket: usize,
    buckets: Vec<PowerBucket>,
    state: CalibrationState,
}

impl PowerControlEngine {
    /// Engine with no laser selected.
    pub fn new(
        device: impl Into<String>,
        lasers: BTreeMap<String, Arc<dyn Laser>>,
        attenuator: Arc<dyn Attenuator>,
        store: CalibrationStore,
        model: ModelSpec,
    ) -> Self {
        Self {
            device: device.into(),
            lasers,
            attenuator,
            store,
            model,
            active_laser: None,
            active_bucket: 0,
            buckets: Vec::new(),
            state: CalibrationState::Uninitialized,
        }
    }

    /// Engine wired from configuration.
    pub fn from_settings(
        settings: &Settings,
        instruments: &Instruments,
        store: CalibrationStore,
    ) -> AppResult<Self> {
        Ok(Self::new(
            settings.device.name.clone(),
            instruments.lasers.clone(),
            Arc::clone(&instruments.attenuator),
            store,
            settings.analysis.model_spec()?,
        ))
    }

    /// Calibration status of the active laser.
    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Name of the active laser.
    pub fn active_laser(&self) -> Option<&str> {
        self.active_laser.as_deref()
    }

    /// Laser power set-point of the active bucket.
    pub fn active_laser_power(&self) -> Option<f64> {
        self.buckets.get(self.active_bucket).map(|b| b.laser_power)
    }

    /// Loaded buckets, by ascending laser power.
    pub fn buckets(&self) -> &[PowerBucket] {
        &self.buckets
    }

    /// `(laser power, achievable range)` of every bucket.
    pub fn power_ranges(&self) -> Vec<(f64, (f64, f64))> {
        self.buckets
            .iter()
            .map(|b| (b.laser_power, b.achievable_range))
            .collect()
    }

    /// Switches to laser `name` and loads its latest calibration per laser power.
    ///
    /// A laser without stored calibrations is not an error: the engine enters
    /// [`CalibrationState::NotCalibrated`] and every later `set_power` fails.
    /// If the store cannot be read the engine keeps the previous laser untouched; if
    /// switching the lasers fails it is left [`CalibrationState::NotCalibrated`].
    pub async fn set_laser(&mut self, name: &str) -> AppResult<()> {
        let Some(laser) = self.lasers.get(name).cloned() else {
            return Err(IlluminationError::UnknownLaser {
                name: name.to_string(),
                available: self.lasers.keys().cloned().collect(),
            });
        };

        // A failed load leaves the previous laser and its buckets in charge.
        let buckets = self.load_buckets(name, laser.wavelength()).await?;

        self.buckets.clear();
        self.active_bucket = 0;
        self.state = CalibrationState::NotCalibrated;
        if let Some(previous) = self.active_laser.as_deref() {
            if previous != name {
                if let Some(previous) = self.lasers.get(previous) {
                    previous.set_enabled(false).await?;
                }
            }
        }
        laser.set_enabled(true).await?;
        self.active_laser = Some(name.to_string());
        self.buckets = buckets;
        let Some(first_power) = self.active_laser_power() else {
            warn!(
                device = %self.device,
                laser = %name,
                "no calibration found for laser; run a calibration before setting powers"
            );
            self.state = CalibrationState::NotCalibrated;
            return Ok(());
        };

        laser.set_power(first_power).await?;
        self.state = CalibrationState::Calibrated;
        info!(
            laser = %name,
            buckets = ?self.power_ranges(),
            "laser selected, laser power {} mW",
            first_power
        );
        Ok(())
    }

    /// Re-reads the store for the active laser.
    pub async fn reload(&mut self) -> AppResult<()> {
        match self.active_laser.clone() {
            Some(name) => self.set_laser(&name).await,
            None => Ok(()),
        }
    }

    /// Delivers `requested` mW at the sample, clamping to the best available bucket.
    pub async fn set_power(&mut self, requested: f64) -> AppResult<PowerSetting> {
        let laser_name = self.active_laser.clone().unwrap_or_default();
        if self.state != CalibrationState::Calibrated || self.buckets.is_empty() {
            return Err(IlluminationError::NotCalibrated { laser: laser_name });
        }
        if !requested.is_finite() {
            return Err(IlluminationError::InvalidRequest(format!(
                "requested power must be finite, got {}",
                requested
            )));
        }

        let chosen = select_bucket(&self.buckets, self.active_bucket, requested);
        let bucket = &self.buckets[chosen];
        let (min, max) = bucket.achievable_range;
        let target = if requested < min {
            warn!(
                laser = %laser_name,
                laser_power = bucket.laser_power,
                "requested power {} mW is below the achievable range [{}, {}]; setting {} mW",
                requested, min, max, min
            );
            min
        } else if requested > max {
            warn!(
                laser = %laser_name,
                laser_power = bucket.laser_power,
                "requested power {} mW is above the achievable range [{}, {}]; setting {} mW",
                requested, min, max, max
            );
            max
        } else {
            requested
        };

        let control_value = bucket.model.invert(target)?;
        let laser_power = bucket.laser_power;
        debug!(requested, target, control_value, laser_power, "inverted curve");

        if chosen != self.active_bucket {
            if let Some(laser) = self.lasers.get(&laser_name) {
                laser.set_power(laser_power).await?;
            }
            info!(
                laser = %laser_name,
                from = self.active_laser_power(),
                to = laser_power,
                "switched laser power bucket"
            );
            self.active_bucket = chosen;
        }
        self.attenuator.set(control_value).await?;

        let applied_power = self.buckets[chosen].model.evaluate(control_value);
        Ok(PowerSetting {
            laser_power,
            control_value,
            requested,
            applied_power,
            clamped: target != requested,
        })
    }

    async fn load_buckets(&self, laser: &str, wavelength: f64) -> AppResult<Vec<PowerBucket>> {
        let query = IndexQuery::any().device(&self.device).wavelength(wavelength);
        let records = match self
            .store
            .load(&query, &TimeSelector::LastCombinations)
            .await
        {
            Ok(records) => records,
            Err(IlluminationError::NotFound(what)) => {
                debug!(laser = %laser, "{}", what);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut buckets = Vec::with_capacity(records.len());
        for record in records {
            let bucket = AttenuationModel::from_parameters(&self.model, &record.parameters)
                .and_then(|model| {
                    let achievable_range = model.output_range()?;
                    Ok(PowerBucket {
                        laser_power: record.laser_power,
                        model,
                        achievable_range,
                    })
                });
            match bucket {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => warn!(
                    laser = %laser,
                    laser_power = record.laser_power,
                    "ignoring stored calibration: {}",
                    e
                ),
            }
        }
        buckets.sort_by(|a, b| a.laser_power.total_cmp(&b.laser_power));
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{DomainBounds, ModelKind, ModelParameters};
    use crate::hardware::mock::{SimulatedBench, SimulatedLaser};
    use crate::storage::{CalibrationIndex, StoreOptions};
    use approx::assert_relative_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn linear() -> ModelSpec {
        ModelSpec {
            kind: ModelKind::Linear,
            domain: DomainBounds::new(0.0, 1.0),
            polydegree: 1,
        }
    }

    fn params(bkg: f64, amp: f64) -> ModelParameters {
        [("bkg".to_string(), bkg), ("amp".to_string(), amp)]
            .into_iter()
            .collect()
    }

    struct Fixture {
        dir: TempDir,
        bench: SimulatedBench,
        laser: Arc<SimulatedLaser>,
        other: Arc<SimulatedLaser>,
        engine: PowerControlEngine,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let options = StoreOptions {
            retry_timeout: Duration::from_millis(100),
            ..StoreOptions::default()
        };
        let store = CalibrationStore::with_options(dir.path().join("calibration.csv"), options);
        for (power, bkg, amp) in [(100.0, 0.0, 40.0), (200.0, 10.0, 80.0), (500.0, 50.0, 100.0)] {
            store
                .save(&CalibrationIndex::new("M1", 488.0, power), &params(bkg, amp))
                .await
                .unwrap();
        }
        // another wavelength must not leak into the 488 buckets
        store
            .save(&CalibrationIndex::new("M1", 561.0, 50.0), &params(0.0, 5.0))
            .await
            .unwrap();

        let bench = SimulatedBench::new();
        let laser = bench.add_laser(SimulatedLaser::new("488", 488.0));
        let other = bench.add_laser(SimulatedLaser::new("405", 405.0));
        let mut lasers: BTreeMap<String, Arc<dyn Laser>> = BTreeMap::new();
        lasers.insert("488".into(), laser.clone());
        lasers.insert("405".into(), other.clone());
        let engine =
            PowerControlEngine::new("M1", lasers, Arc::new(bench.attenuator()), store, linear());
        Fixture {
            dir,
            bench,
            laser,
            other,
            engine,
        }
    }

    #[tokio::test]
    async fn test_set_laser_loads_sorted_buckets() {
        let mut f = fixture().await;
        assert_eq!(f.engine.state(), CalibrationState::Uninitialized);

        f.engine.set_laser("488").await.unwrap();
        assert_eq!(f.engine.state(), CalibrationState::Calibrated);
        assert_eq!(f.engine.active_laser(), Some("488"));
        assert_eq!(f.engine.active_laser_power(), Some(100.0));
        assert_eq!(
            f.engine.power_ranges(),
            vec![
                (100.0, (0.0, 40.0)),
                (200.0, (10.0, 90.0)),
                (500.0, (50.0, 150.0))
            ]
        );
        assert!(f.laser.is_enabled().await.unwrap());
        assert_eq!(f.laser.power().await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_request_selects_minimum_qualifying_bucket() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();

        let setting = f.engine.set_power(70.0).await.unwrap();
        assert_eq!(setting.laser_power, 200.0);
        assert!(!setting.clamped);
        assert_relative_eq!(setting.control_value, 0.75, epsilon = 1e-9);
        assert_relative_eq!(setting.applied_power, 70.0, epsilon = 1e-9);
        assert_eq!(f.engine.active_laser_power(), Some(200.0));
        assert_eq!(f.laser.power().await.unwrap(), 200.0);
        assert_relative_eq!(f.bench.angle().await, 0.75, epsilon = 1e-9);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_request_clamps_to_highest_bucket() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();

        let setting = f.engine.set_power(1000.0).await.unwrap();
        assert_eq!(setting.laser_power, 500.0);
        assert!(setting.clamped);
        assert_relative_eq!(setting.applied_power, 150.0, epsilon = 1e-9);
        assert_relative_eq!(setting.control_value, 1.0, epsilon = 1e-9);
        assert!(logs_contain("above the achievable range"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_request_below_range_clamps_to_minimum() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();

        let setting = f.engine.set_power(-5.0).await.unwrap();
        assert_eq!(setting.laser_power, 100.0);
        assert!(setting.clamped);
        assert_relative_eq!(setting.control_value, 0.0, epsilon = 1e-9);
        assert!(logs_contain("below the achievable range"));
    }

    #[tokio::test]
    async fn test_active_bucket_is_kept_when_it_covers_request() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();
        f.engine.set_power(140.0).await.unwrap();
        assert_eq!(f.engine.active_laser_power(), Some(500.0));

        // 60 is inside [50, 150]: no switch back to a lower laser power
        let setting = f.engine.set_power(60.0).await.unwrap();
        assert_eq!(setting.laser_power, 500.0);
        assert_relative_eq!(setting.control_value, 0.1, epsilon = 1e-9);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_laser_without_calibration_is_not_calibrated() {
        let mut f = fixture().await;
        f.engine.set_laser("405").await.unwrap();
        assert_eq!(f.engine.state(), CalibrationState::NotCalibrated);
        assert!(f.engine.buckets().is_empty());
        assert!(logs_contain("no calibration found"));

        let err = f.engine.set_power(10.0).await.unwrap_err();
        assert!(matches!(err, IlluminationError::NotCalibrated { laser } if laser == "405"));
    }

    #[tokio::test]
    async fn test_switching_laser_disables_previous() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();
        f.engine.set_laser("405").await.unwrap();
        assert!(!f.laser.is_enabled().await.unwrap());
        assert_eq!(f.engine.active_laser(), Some("405"));
    }

    #[tokio::test]
    async fn test_unreadable_store_keeps_previous_laser() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();
        f.engine.set_power(70.0).await.unwrap();
        std::fs::write(f.dir.path().join("calibration.csv"), "garbage\n").unwrap();

        let err = f.engine.set_laser("405").await.unwrap_err();
        assert!(matches!(err, IlluminationError::Storage(_)));

        assert_eq!(f.engine.active_laser(), Some("488"));
        assert_eq!(f.engine.state(), CalibrationState::Calibrated);
        assert_eq!(f.engine.active_laser_power(), Some(200.0));
        assert!(f.laser.is_enabled().await.unwrap());
        assert!(!f.other.is_enabled().await.unwrap());

        // still driven by the 488 curves
        let setting = f.engine.set_power(50.0).await.unwrap();
        assert_eq!(setting.laser_power, 200.0);
        assert_relative_eq!(setting.control_value, 0.5, epsilon = 1e-9);
        assert_eq!(f.other.power().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_unknown_laser_lists_configured() {
        let mut f = fixture().await;
        let err = f.engine.set_laser("640").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Laser '640' is not available. Configured lasers: 405, 488"
        );
        assert_eq!(f.engine.state(), CalibrationState::Uninitialized);
    }

    #[tokio::test]
    async fn test_set_power_requires_laser() {
        let mut f = fixture().await;
        assert!(matches!(
            f.engine.set_power(1.0).await,
            Err(IlluminationError::NotCalibrated { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_finite_request_is_rejected() {
        let mut f = fixture().await;
        f.engine.set_laser("488").await.unwrap();
        assert!(matches!(
            f.engine.set_power(f64::NAN).await,
            Err(IlluminationError::InvalidRequest(_))
        ));
    }
}
