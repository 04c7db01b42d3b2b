//! Straight-line response `y = bkg + amp * x`.

use super::fit::{levenberg_marquardt, LmSettings};
use super::{
    check_samples, check_varying, min_max, ordered, required_parameters, rms, unfitted,
    within_range, CurveModel, DomainBounds, FitReport, ModelKind, ModelParameters,
};
use crate::error::{AppResult, IlluminationError};

/// Linear attenuation model.
#[derive(Debug, Clone)]
pub struct LinearModel {
    domain: DomainBounds,
    params: Option<(f64, f64)>,
}

impl LinearModel {
    /// Creates an unfitted model over `domain`.
    pub fn new(domain: DomainBounds) -> Self {
        Self {
            domain,
            params: None,
        }
    }

    /// Creates a model with known offset and slope.
    pub fn with_parameters(domain: DomainBounds, bkg: f64, amp: f64) -> Self {
        Self {
            domain,
            params: Some((bkg, amp)),
        }
    }
}

impl CurveModel for LinearModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Linear
    }

    fn domain(&self) -> DomainBounds {
        self.domain
    }

    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport> {
        check_samples(ModelKind::Linear, xs, ys, 2)?;
        check_varying(ModelKind::Linear, "powers", ys)?;
        check_varying(ModelKind::Linear, "control values", xs)?;

        let (lo, hi) = min_max(ys);
        let outcome = levenberg_marquardt(
            xs,
            ys,
            &[lo, hi - lo],
            |x, p| p[0] + p[1] * x,
            |x, _p, row| {
                row[0] = 1.0;
                row[1] = x;
            },
            LmSettings::default(),
        )?;

        let (bkg, amp) = (outcome.params[0], outcome.params[1]);
        if !(bkg.is_finite() && amp.is_finite()) || amp == 0.0 {
            return Err(IlluminationError::Fitting(format!(
                "linear fit produced a non-invertible line bkg={} amp={}",
                bkg, amp
            )));
        }
        self.params = Some((bkg, amp));

        Ok(FitReport {
            parameters: self.parameters(),
            rms_residual: rms(xs.iter().zip(ys).map(|(&x, &y)| y - (bkg + amp * x))),
            iterations: outcome.iterations,
            points: xs.len(),
        })
    }

    fn evaluate(&self, x: f64) -> f64 {
        self.params.map_or(f64::NAN, |(bkg, amp)| bkg + amp * x)
    }

    fn invert(&self, y: f64) -> AppResult<f64> {
        let (bkg, amp) = self.params.ok_or_else(|| unfitted(ModelKind::Linear))?;
        let range = self.output_range()?;
        if !within_range(range, y) {
            return Err(IlluminationError::out_of_range(y, range));
        }
        if amp == 0.0 {
            return Ok(self.domain.min);
        }
        Ok(self.domain.clamp((y - bkg) / amp))
    }

    fn output_range(&self) -> AppResult<(f64, f64)> {
        if self.params.is_none() {
            return Err(unfitted(ModelKind::Linear));
        }
        Ok(ordered(
            self.evaluate(self.domain.min),
            self.evaluate(self.domain.max),
        ))
    }

    fn parameters(&self) -> ModelParameters {
        let mut out = ModelParameters::new();
        if let Some((bkg, amp)) = self.params {
            out.insert("bkg".to_string(), bkg);
            out.insert("amp".to_string(), amp);
        }
        out
    }

    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()> {
        let [bkg, amp] = required_parameters(ModelKind::Linear, parameters, ["bkg", "amp"])?;
        self.params = Some((bkg, amp));
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.params.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_exact_line() {
        let xs = [0.0, 0.25, 0.5, 0.75, 1.0];
        let ys: Vec<f64> = xs.iter().map(|x| 10.0 + 80.0 * x).collect();
        let mut model = LinearModel::new(DomainBounds::new(0.0, 1.0));
        let report = model.fit(&xs, &ys).unwrap();
        assert_relative_eq!(report.parameters["bkg"], 10.0, epsilon = 1e-9);
        assert_relative_eq!(report.parameters["amp"], 80.0, epsilon = 1e-9);
        assert!(report.rms_residual < 1e-9);
    }

    #[test]
    fn test_round_trip() {
        let model = LinearModel::with_parameters(DomainBounds::new(0.0, 1.0), 10.0, 80.0);
        for i in 0..=20 {
            let x = i as f64 / 20.0;
            let back = model.invert(model.evaluate(x)).unwrap();
            assert_relative_eq!(back, x, epsilon = 1e-12, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_negative_slope_range_is_sorted() {
        let model = LinearModel::with_parameters(DomainBounds::new(0.0, 10.0), 100.0, -5.0);
        assert_eq!(model.output_range().unwrap(), (50.0, 100.0));
        assert_relative_eq!(model.invert(75.0).unwrap(), 5.0);
        assert!(matches!(
            model.invert(101.0),
            Err(IlluminationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_fit_degenerate() {
        let mut model = LinearModel::new(DomainBounds::new(0.0, 1.0));
        assert!(model.fit(&[0.0, 1.0], &[2.0, 2.0]).is_err());
        assert!(model.fit(&[0.5, 0.5], &[1.0, 2.0]).is_err());
        assert!(model.fit(&[0.5], &[1.0]).is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let model = LinearModel::with_parameters(DomainBounds::new(0.0, 1.0), 0.0, 40.0);
        let mut restored = LinearModel::new(DomainBounds::new(0.0, 1.0));
        restored.load(&model.parameters()).unwrap();
        assert_eq!(restored.evaluate(0.3), model.evaluate(0.3));
        assert_eq!(restored.invert(12.0).unwrap(), model.invert(12.0).unwrap());
    }
}
