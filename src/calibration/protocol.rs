use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::plot::{CalibrationPlotter, LaserSummary, NoopPlotter};
use super::{SweepData, SweepSettings};
use crate::analysis::{AttenuationModel, CurveModel, FitReport, ModelSpec};
use crate::config::{ProtocolConfig, Settings};
use crate::error::{AppResult, IlluminationError};
use crate::hardware::{Attenuator, BeamPath, Instruments, Laser, PowerMeter};
use crate::storage::{CalibrationIndex, CalibrationRecord, CalibrationStore};

/// Result of one sweep, fit and save.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// Stored row, including the stamped date and time.
    pub record: CalibrationRecord,
    /// Fit diagnostics.
    pub report: FitReport,
    /// Raw sweep.
    pub data: SweepData,
    /// Exported diagnostic file, if any.
    pub plot: Option<PathBuf>,
}

/// Single-curve calibration: sweep, fit, save, export.
pub struct CalibrationProtocol1D {
    device: String,
    attenuator: Arc<dyn Attenuator>,
    power_meter: Arc<dyn PowerMeter>,
    store: CalibrationStore,
    model: ModelSpec,
    sweep: SweepSettings,
    plotter: Arc<dyn CalibrationPlotter>,
}

impl CalibrationProtocol1D {
    /// Protocol for `device` that discards diagnostic plots.
    pub fn new(
        device: impl Into<String>,
        attenuator: Arc<dyn Attenuator>,
        power_meter: Arc<dyn PowerMeter>,
        store: CalibrationStore,
        model: ModelSpec,
        sweep: SweepSettings,
    ) -> Self {
        Self {
            device: device.into(),
            attenuator,
            power_meter,
            store,
            model,
            sweep,
            plotter: Arc::new(NoopPlotter),
        }
    }

    /// Protocol wired from configuration.
    pub fn from_settings(
        settings: &Settings,
        instruments: &Instruments,
        store: CalibrationStore,
    ) -> AppResult<Self> {
        Ok(Self::new(
            settings.device.name.clone(),
            Arc::clone(&instruments.attenuator),
            Arc::clone(&instruments.power_meter),
            store,
            settings.analysis.model_spec()?,
            SweepSettings::from(&settings.analysis),
        ))
    }

    /// Sends results to `plotter`.
    pub fn with_plotter(mut self, plotter: Arc<dyn CalibrationPlotter>) -> Self {
        self.plotter = plotter;
        self
    }

    /// Visits every sweep point: move, wait, read.
    pub async fn sweep(&self) -> AppResult<SweepData> {
        let total = self.sweep.points.len();
        let mut data = SweepData {
            positions: Vec::with_capacity(total),
            powers: Vec::with_capacity(total),
        };
        for (i, &position) in self.sweep.points.iter().enumerate() {
            self.attenuator.set(position).await?;
            if !self.sweep.wait.is_zero() {
                sleep(self.sweep.wait).await;
            }
            let power = self.power_meter.read(self.sweep.averaging).await?;
            debug!(step = i + 1, of = total, "{}, {}", position, power);
            data.positions.push(position);
            data.powers.push(power);
        }
        Ok(data)
    }

    /// Calibrates the light currently reaching the sample and stores the curve under
    /// `(device, wavelength, laser_power)`.
    pub async fn run(&self, wavelength: f64, laser_power: f64) -> AppResult<CalibrationOutcome> {
        info!(
            device = %self.device,
            wavelength,
            laser_power,
            model = %self.model.kind,
            points = self.sweep.points.len(),
            "starting calibration sweep"
        );
        self.power_meter.set_wavelength(wavelength).await?;
        let data = self.sweep().await?;

        let mut model = AttenuationModel::new(&self.model);
        let report = model.fit(&data.positions, &data.powers)?;
        info!("fit: {}", report);

        let index = CalibrationIndex::new(self.device.clone(), wavelength, laser_power);
        let record = self.store.save(&index, &report.parameters).await?;

        let plot = match self.plotter.plot_curve(&record, &data, &model) {
            Ok(path) => path,
            Err(e) => {
                warn!("could not export calibration curve: {}", e);
                None
            }
        };

        Ok(CalibrationOutcome {
            record,
            report,
            data,
            plot,
        })
    }

    fn plot_summary(&self, summary: &LaserSummary) -> Option<PathBuf> {
        match self.plotter.plot_summary(summary) {
            Ok(path) => path,
            Err(e) => {
                warn!(laser = %summary.laser, "could not export calibration summary: {}", e);
                None
            }
        }
    }
}

/// All calibrations of one laser.
#[derive(Debug, Clone)]
pub struct LaserCalibration {
    /// Laser name.
    pub laser: String,
    /// Laser wavelength in nm.
    pub wavelength: f64,
    /// One outcome per power set-point, in protocol order.
    pub outcomes: Vec<CalibrationOutcome>,
    /// Fitted parameters by laser power.
    pub summary: LaserSummary,
    /// Exported summary file, if any.
    pub summary_plot: Option<PathBuf>,
}

/// What a laser x power protocol did.
#[derive(Debug, Clone, Default)]
pub struct ProtocolReport {
    /// Calibrated lasers, in sequence order.
    pub calibrated: Vec<LaserCalibration>,
    /// Lasers left out because they are missing from the configuration, from the
    /// sequence, or have no power set-points.
    pub skipped: Vec<String>,
}

/// Laser x power calibration.
pub struct CalibrationProtocol2D {
    runner: CalibrationProtocol1D,
    lasers: BTreeMap<String, Arc<dyn Laser>>,
    beam_path: BeamPath,
    protocol: ProtocolConfig,
}

impl CalibrationProtocol2D {
    /// Protocol driving `lasers` and `beam_path`, running `runner` for each step.
    pub fn new(
        runner: CalibrationProtocol1D,
        lasers: BTreeMap<String, Arc<dyn Laser>>,
        beam_path: BeamPath,
        protocol: ProtocolConfig,
    ) -> Self {
        Self {
            runner,
            lasers,
            beam_path,
            protocol,
        }
    }

    /// Protocol wired from configuration. Requires a `[protocol]` section.
    pub fn from_settings(
        settings: &Settings,
        instruments: &Instruments,
        runner: CalibrationProtocol1D,
    ) -> AppResult<Self> {
        let protocol = settings.protocol.clone().ok_or_else(|| {
            IlluminationError::Configuration(
                "No [protocol] section configured; add laser_sequence and laser_powers".to_string(),
            )
        })?;
        Ok(Self::new(
            runner,
            instruments.lasers.clone(),
            instruments.beam_path.clone(),
            protocol,
        ))
    }

    /// Calibrates every laser of the sequence that is also configured.
    pub async fn run(&self) -> AppResult<ProtocolReport> {
        let mut report = ProtocolReport::default();

        for name in &self.protocol.laser_sequence {
            let Some(laser) = self.lasers.get(name) else {
                warn!(laser = %name, "laser in protocol sequence is not configured, skipping");
                report.skipped.push(name.clone());
                continue;
            };
            let powers = match self.protocol.laser_powers.get(name) {
                Some(powers) if !powers.is_empty() => powers,
                _ => {
                    warn!(laser = %name, "no laser powers listed for laser, skipping");
                    report.skipped.push(name.clone());
                    continue;
                }
            };
            match self.calibrate_laser(name, laser, powers).await {
                Ok(calibration) => report.calibrated.push(calibration),
                Err(e) => {
                    if let Err(restore) = self.restore_end_positions().await {
                        warn!("failed to restore end beam path after error: {}", restore);
                    }
                    return Err(e);
                }
            }
        }

        for name in self.lasers.keys() {
            if !self.protocol.laser_sequence.contains(name) {
                info!(laser = %name, "configured laser not in protocol sequence, skipping");
                report.skipped.push(name.clone());
            }
        }

        self.restore_end_positions().await?;

        info!(
            calibrated = report.calibrated.len(),
            skipped = ?report.skipped,
            "protocol finished"
        );
        Ok(report)
    }

    async fn restore_end_positions(&self) -> AppResult<()> {
        if let Some(end) = &self.protocol.end {
            self.beam_path.set_positions(end).await?;
            info!(positions = ?end, "restored end beam path");
        }
        Ok(())
    }

    /// Sweeps every power of one laser; the laser is parked whether or not that succeeds.
    async fn calibrate_laser(
        &self,
        name: &str,
        laser: &Arc<dyn Laser>,
        powers: &[f64],
    ) -> AppResult<LaserCalibration> {
        let calibration = self.sweep_laser(name, laser, powers).await;
        let parked = park(laser).await;
        match (calibration, parked) {
            (Ok(calibration), parked) => parked.map(|()| calibration),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(park_error)) => {
                warn!(laser = %name, "failed to park laser after error: {}", park_error);
                Err(e)
            }
        }
    }

    async fn sweep_laser(
        &self,
        name: &str,
        laser: &Arc<dyn Laser>,
        powers: &[f64],
    ) -> AppResult<LaserCalibration> {
        for (other_name, other) in &self.lasers {
            if other_name != name {
                other.set_enabled(false).await?;
            }
        }
        laser.set_enabled(true).await?;
        if let Some(positions) = self.protocol.beam_path.get(name) {
            self.beam_path.set_positions(positions).await?;
            debug!(laser = %name, ?positions, "beam path set");
        }

        let wavelength = laser.wavelength();
        let mut summary = LaserSummary {
            device: self.runner.device.clone(),
            laser: name.to_string(),
            wavelength,
            entries: Vec::with_capacity(powers.len()),
        };
        let mut outcomes = Vec::with_capacity(powers.len());
        for (i, &power) in powers.iter().enumerate() {
            info!(laser = %name, power, step = i + 1, of = powers.len(), "setting laser power");
            laser.set_power(power).await?;
            let outcome = self.runner.run(wavelength, power).await?;
            summary
                .entries
                .push((power, outcome.report.parameters.clone()));
            outcomes.push(outcome);
        }
        let summary_plot = self.runner.plot_summary(&summary);

        Ok(LaserCalibration {
            laser: name.to_string(),
            wavelength,
            outcomes,
            summary,
            summary_plot,
        })
    }
}

/// Lowest power, emission off.
async fn park(laser: &Arc<dyn Laser>) -> AppResult<()> {
    let lowered = laser.set_power(laser.min_power().unwrap_or(0.0)).await;
    laser.set_enabled(false).await?;
    lowered?;
    Ok(())
}
