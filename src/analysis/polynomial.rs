//! Polynomial response with a separately fitted inverse.
//!
//! The forward polynomial of degree `d` is fitted over the samples inside the domain.
//! The inverse polynomial maps power back to control value and is fitted only over the
//! samples between the global minimum and maximum reading, where the response is
//! expected to be monotonic. Its degree is `1.5 * d`, capped by the number of samples
//! available there. Inversions are polished by Newton iteration on the forward
//! polynomial.

use tracing::debug;

use super::fit::{polyder, polyfit, polyval, real_roots};
use super::{
    check_samples, check_varying, ordered, rms, unfitted, within_range, CurveModel,
    DomainBounds, FitReport, ModelKind, ModelParameters,
};
use crate::error::{AppResult, IlluminationError};

const NEWTON_ITERATIONS: usize = 20;

/// Polynomial attenuation model.
#[derive(Debug, Clone)]
pub struct PolynomialModel {
    domain: DomainBounds,
    degree: usize,
    forward: Vec<f64>,
    inverse: Vec<f64>,
}

impl PolynomialModel {
    /// Creates an unfitted model with forward polynomial `degree`.
    pub fn new(domain: DomainBounds, degree: usize) -> Self {
        Self {
            domain,
            degree: degree.max(1),
            forward: Vec::new(),
            inverse: Vec::new(),
        }
    }

    /// Degree of the forward polynomial.
    pub fn degree(&self) -> usize {
        self.degree
    }

    fn ensure_fitted(&self) -> AppResult<()> {
        if self.forward.is_empty() || self.inverse.is_empty() {
            return Err(unfitted(ModelKind::Polynomial));
        }
        Ok(())
    }

    /// Newton iteration on the forward polynomial, kept inside the domain.
    fn refine(&self, target: f64, start: f64) -> f64 {
        let derivative = polyder(&self.forward);
        let mut x = start;
        for _ in 0..NEWTON_ITERATIONS {
            let fx = polyval(&self.forward, x) - target;
            let dfx = polyval(&derivative, x);
            if dfx.abs() < 1e-15 {
                break;
            }
            let next = self.domain.clamp(x - fx / dfx);
            if (next - x).abs() < 1e-10 {
                x = next;
                break;
            }
            x = next;
        }

        let refined_error = (polyval(&self.forward, x) - target).abs();
        let start_error = (polyval(&self.forward, start) - target).abs();
        if refined_error <= start_error {
            x
        } else {
            start
        }
    }
}

/// Collects `prefix<N>` entries into a dense coefficient vector. NaN entries become 0.
fn coefficients(parameters: &ModelParameters, prefix: char) -> Vec<f64> {
    let indexed: Vec<(usize, f64)> = parameters
        .iter()
        .filter_map(|(name, value)| {
            let index = name.strip_prefix(prefix)?.parse::<usize>().ok()?;
            Some((index, *value))
        })
        .collect();
    let Some(len) = indexed.iter().map(|(i, _)| i + 1).max() else {
        return Vec::new();
    };
    let mut out = vec![0.0; len];
    for (index, value) in indexed {
        out[index] = if value.is_nan() { 0.0 } else { value };
    }
    out
}

impl CurveModel for PolynomialModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Polynomial
    }

    fn domain(&self) -> DomainBounds {
        self.domain
    }

    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport> {
        check_samples(ModelKind::Polynomial, xs, ys, self.degree + 1)?;

        let (cx, cy): (Vec<f64>, Vec<f64>) = xs
            .iter()
            .zip(ys)
            .filter(|(x, _)| self.domain.contains(**x))
            .map(|(x, y)| (*x, *y))
            .unzip();
        if cx.len() < xs.len() {
            debug!(
                dropped = xs.len() - cx.len(),
                min = self.domain.min,
                max = self.domain.max,
                "discarding samples outside the domain"
            );
        }
        check_samples(ModelKind::Polynomial, &cx, &cy, self.degree + 1)?;
        check_varying(ModelKind::Polynomial, "powers", &cy)?;

        let forward = polyfit(&cx, &cy, self.degree)?;

        let argmin = cy
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        let argmax = cy
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        let (start, end) = (argmin.min(argmax), argmin.max(argmax));
        let monotonic_x = &cx[start..=end];
        let monotonic_y = &cy[start..=end];
        if monotonic_x.len() < 2 {
            return Err(IlluminationError::Fitting(
                "polynomial inverse needs at least 2 points between the minimum and maximum reading"
                    .to_string(),
            ));
        }
        let inverse_degree = ((self.degree as f64 * 1.5) as usize)
            .min(monotonic_x.len() - 1)
            .max(1);
        let inverse = polyfit(monotonic_y, monotonic_x, inverse_degree)?;

        self.forward = forward;
        self.inverse = inverse;

        Ok(FitReport {
            parameters: self.parameters(),
            rms_residual: rms(cx
                .iter()
                .zip(&cy)
                .map(|(&x, &y)| y - polyval(&self.forward, x))),
            iterations: 1,
            points: cx.len(),
        })
    }

    fn evaluate(&self, x: f64) -> f64 {
        if self.forward.is_empty() {
            return f64::NAN;
        }
        polyval(&self.forward, x)
    }

    fn invert(&self, y: f64) -> AppResult<f64> {
        let range = self.output_range()?;
        if !within_range(range, y) {
            return Err(IlluminationError::out_of_range(y, range));
        }
        let start = self.domain.clamp(polyval(&self.inverse, y));
        let x = self.refine(y, start);
        debug!(y, start, x, "polynomial inversion");
        Ok(self.domain.clamp(x))
    }

    fn output_range(&self) -> AppResult<(f64, f64)> {
        self.ensure_fitted()?;
        let (mut lo, mut hi) = ordered(
            self.evaluate(self.domain.min),
            self.evaluate(self.domain.max),
        );
        for root in real_roots(&polyder(&self.forward)) {
            if root > self.domain.min && root < self.domain.max {
                let y = self.evaluate(root);
                lo = lo.min(y);
                hi = hi.max(y);
            }
        }
        Ok((lo, hi))
    }

    fn parameters(&self) -> ModelParameters {
        let forward = self
            .forward
            .iter()
            .enumerate()
            .map(|(i, c)| (format!("p{}", i), *c));
        let inverse = self
            .inverse
            .iter()
            .enumerate()
            .map(|(i, c)| (format!("i{}", i), *c));
        forward.chain(inverse).collect()
    }

    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()> {
        let forward = coefficients(parameters, 'p');
        let inverse = coefficients(parameters, 'i');
        if forward.is_empty() || inverse.is_empty() {
            let present: Vec<&str> = parameters.keys().map(String::as_str).collect();
            return Err(IlluminationError::InvalidParameters(format!(
                "polynomial model requires p0..pN and i0..iM coefficients (got: {})",
                present.join(", ")
            )));
        }
        if let Some(bad) = forward.iter().chain(&inverse).find(|c| !c.is_finite()) {
            return Err(IlluminationError::InvalidParameters(format!(
                "polynomial coefficient is not finite: {}",
                bad
            )));
        }
        self.degree = forward.len().saturating_sub(1).max(1);
        self.forward = forward;
        self.inverse = inverse;
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        !self.forward.is_empty() && !self.inverse.is_empty()
    }
}
