//! Constant output, for light paths without an attenuator.

use super::{
    check_samples, required_parameters, rms, unfitted, CurveModel, DomainBounds, FitReport,
    ModelKind, ModelParameters,
};
use crate::error::AppResult;

/// Single-value model: the mean of the calibration readings.
#[derive(Debug, Clone)]
pub struct PointModel {
    domain: DomainBounds,
    amp: Option<f64>,
}

impl PointModel {
    /// Creates an unfitted model.
    pub fn new(domain: DomainBounds) -> Self {
        Self { domain, amp: None }
    }
}

impl CurveModel for PointModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Point
    }

    fn domain(&self) -> DomainBounds {
        self.domain
    }

    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport> {
        check_samples(ModelKind::Point, xs, ys, 1)?;
        let amp = ys.iter().sum::<f64>() / ys.len() as f64;
        self.amp = Some(amp);
        Ok(FitReport {
            parameters: self.parameters(),
            rms_residual: rms(ys.iter().map(|y| y - amp)),
            iterations: 1,
            points: ys.len(),
        })
    }

    fn evaluate(&self, _x: f64) -> f64 {
        self.amp.unwrap_or(f64::NAN)
    }

    /// There is no control parameter; every achievable power maps to 0.
    fn invert(&self, _y: f64) -> AppResult<f64> {
        self.amp.ok_or_else(|| unfitted(ModelKind::Point))?;
        Ok(0.0)
    }

    fn output_range(&self) -> AppResult<(f64, f64)> {
        let amp = self.amp.ok_or_else(|| unfitted(ModelKind::Point))?;
        Ok((amp, amp))
    }

    fn parameters(&self) -> ModelParameters {
        let mut out = ModelParameters::new();
        if let Some(amp) = self.amp {
            out.insert("amp".to_string(), amp);
        }
        out
    }

    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()> {
        let [amp] = required_parameters(ModelKind::Point, parameters, ["amp"])?;
        self.amp = Some(amp);
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.amp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_takes_mean() {
        let mut model = PointModel::new(DomainBounds::new(0.0, 0.0));
        let report = model.fit(&[0.0, 0.0, 0.0], &[9.0, 10.0, 11.0]).unwrap();
        assert_eq!(report.parameters["amp"], 10.0);
        assert_eq!(model.evaluate(123.0), 10.0);
        assert_eq!(model.output_range().unwrap(), (10.0, 10.0));
        assert_eq!(model.invert(10.0).unwrap(), 0.0);
    }

    #[test]
    fn test_single_reading_is_enough() {
        let mut model = PointModel::new(DomainBounds::new(0.0, 0.0));
        model.fit(&[0.0], &[4.2]).unwrap();
        assert_eq!(model.evaluate(0.0), 4.2);
        assert!(model.fit(&[], &[]).is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let mut model = PointModel::new(DomainBounds::new(0.0, 0.0));
        model.fit(&[0.0, 0.0], &[1.0, 3.0]).unwrap();
        let mut restored = PointModel::new(DomainBounds::new(0.0, 0.0));
        restored.load(&model.parameters()).unwrap();
        assert_eq!(restored.evaluate(0.0), model.evaluate(0.0));
        assert_eq!(restored.invert(2.0).unwrap(), model.invert(2.0).unwrap());
    }
}
