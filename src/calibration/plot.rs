//! Diagnostic exports of calibration results.
//!
//! The protocols hand every fitted curve and every per-laser summary to a
//! [`CalibrationPlotter`]. [`CsvPlotExporter`] writes them as CSV files that any
//! plotting tool can pick up; [`NoopPlotter`] discards them.

use std::fs;
use std::path::{Path, PathBuf};

use crate::analysis::{CurveModel, ModelParameters};
use crate::error::AppResult;
use crate::storage::{CalibrationRecord, DATE_FORMAT};

use super::SweepData;

/// Number of points at which fitted curves are sampled.
pub const CURVE_SAMPLES: usize = 50;

/// Fitted parameters of one laser, by laser power.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserSummary {
    /// Device the laser was calibrated on.
    pub device: String,
    /// Laser name.
    pub laser: String,
    /// Laser wavelength in nm.
    pub wavelength: f64,
    /// `(laser power, parameters)` in calibration order.
    pub entries: Vec<(f64, ModelParameters)>,
}

/// Receives calibration results for display or export.
pub trait CalibrationPlotter: Send + Sync {
    /// Measured sweep and fitted curve of one calibration.
    fn plot_curve(
        &self,
        record: &CalibrationRecord,
        data: &SweepData,
        model: &dyn CurveModel,
    ) -> AppResult<Option<PathBuf>>;

    /// Fitted parameters of one laser across its power set-points.
    fn plot_summary(&self, summary: &LaserSummary) -> AppResult<Option<PathBuf>>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPlotter;

impl CalibrationPlotter for NoopPlotter {
    fn plot_curve(
        &self,
        _record: &CalibrationRecord,
        _data: &SweepData,
        _model: &dyn CurveModel,
    ) -> AppResult<Option<PathBuf>> {
        Ok(None)
    }

    fn plot_summary(&self, _summary: &LaserSummary) -> AppResult<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes curves and summaries as CSV files into one directory.
#[derive(Debug, Clone)]
pub struct CsvPlotExporter {
    dir: PathBuf,
}

impl CsvPlotExporter {
    /// Exporter writing into `dir` (created on first use).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn target(&self, stem: &str) -> AppResult<PathBuf> {
        if !self.dir.as_os_str().is_empty() {
            fs::create_dir_all(&self.dir)?;
        }
        Ok(self.dir.join(format!("{}.csv", stem)))
    }
}

impl CalibrationPlotter for CsvPlotExporter {
    fn plot_curve(
        &self,
        record: &CalibrationRecord,
        data: &SweepData,
        model: &dyn CurveModel,
    ) -> AppResult<Option<PathBuf>> {
        let path = self.target(&record.file_stem())?;
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["series", "position", "power"])?;
        for (x, y) in data.positions.iter().zip(&data.powers) {
            writer.write_record(&["measured".to_string(), x.to_string(), y.to_string()])?;
        }
        for (x, y) in model.sample_curve(CURVE_SAMPLES) {
            writer.write_record(&["fit".to_string(), x.to_string(), y.to_string()])?;
        }
        writer.flush()?;
        Ok(Some(path))
    }

    fn plot_summary(&self, summary: &LaserSummary) -> AppResult<Option<PathBuf>> {
        let stem = format!(
            "summary_DEVICE-{}_LASER-{}_WAVELENGTH-{}_DATE-{}",
            summary.device,
            summary.laser,
            summary.wavelength,
            chrono::Local::now().date_naive().format(DATE_FORMAT)
        )
        .replace([':', '/', '\\', ' '], "-");
        let path = self.target(&stem)?;

        let mut columns: Vec<&String> = Vec::new();
        for (_, parameters) in &summary.entries {
            for name in parameters.keys() {
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }

        let mut writer = csv::Writer::from_path(&path)?;
        let mut header = vec!["LASER_POWER".to_string()];
        header.extend(columns.iter().map(|c| c.to_string()));
        writer.write_record(&header)?;
        for (power, parameters) in &summary.entries {
            let mut row = vec![power.to_string()];
            row.extend(
                columns
                    .iter()
                    .map(|c| parameters.get(*c).map(f64::to_string).unwrap_or_default()),
            );
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(Some(path))
    }
}
