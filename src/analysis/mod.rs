//! Attenuation curve models.
//!
//! A curve model maps an actuator control value `x` (rotation-mount angle, AOTF
//! setting, ...) to the optical power `y` measured at the sample. Every model can be
//! fitted to sweep data, evaluated, inverted over its valid control domain and
//! serialized to a flat parameter map for the calibration store.
//!
//! Models are selected by name from configuration through [`ModelKind`], which is the
//! whole registry: there is no runtime type loading. [`AttenuationModel`] is the tagged
//! union that owns one concrete variant and forwards the [`CurveModel`] operations.

pub mod fit;
mod linear;
mod point;
mod polynomial;
mod sinusoidal;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, IlluminationError};

pub use linear::LinearModel;
pub use point::PointModel;
pub use polynomial::PolynomialModel;
pub use sinusoidal::SinusoidalModel;

/// Flat parameter map as persisted in the calibration table.
pub type ModelParameters = BTreeMap<String, f64>;

/// Relative slack used when checking that a power lies inside an achievable range.
pub const RANGE_TOLERANCE: f64 = 1e-9;

/// Valid interval of the control parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainBounds {
    /// Lowest control value.
    pub min: f64,
    /// Highest control value.
    pub max: f64,
}

impl DomainBounds {
    /// Creates bounds, swapping the ends if given in descending order.
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Returns true if `x` lies inside the bounds (inclusive).
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x <= self.max
    }

    /// Clamps `x` into the bounds.
    pub fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.min, self.max)
    }

    /// Width of the interval.
    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

/// Summary of a completed fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Fitted parameters, identical to [`CurveModel::parameters`] after the fit.
    pub parameters: ModelParameters,
    /// Root-mean-square of the residuals over the fitted samples.
    pub rms_residual: f64,
    /// Iterations used by the refinement (1 for closed-form fits).
    pub iterations: usize,
    /// Number of samples that entered the fit.
    pub points: usize,
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} points, {} iterations, rms residual {:.4e}:",
            self.points, self.iterations, self.rms_residual
        )?;
        for (name, value) in &self.parameters {
            write!(f, " {}={:.6}", name, value)?;
        }
        Ok(())
    }
}

/// Names of the available model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Polarizer / rotation-mount response with a 90 degree period.
    Sinusoidal,
    /// Straight line.
    Linear,
    /// Forward polynomial plus a separately fitted inverse polynomial.
    Polynomial,
    /// Constant output, used when there is no attenuator.
    Point,
}

impl ModelKind {
    /// All variants, in registry order.
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Sinusoidal,
        ModelKind::Linear,
        ModelKind::Polynomial,
        ModelKind::Point,
    ];

    /// Configuration name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Sinusoidal => "sinusoidal",
            ModelKind::Linear => "linear",
            ModelKind::Polynomial => "polynomial",
            ModelKind::Point => "point",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = IlluminationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = ModelKind::ALL.iter().map(|k| k.name()).collect();
                IlluminationError::Configuration(format!(
                    "Unknown model '{}'. Available models: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// Everything needed to construct an empty model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    /// Which variant to build.
    pub kind: ModelKind,
    /// Control-value domain.
    pub domain: DomainBounds,
    /// Forward degree for polynomial models.
    pub polydegree: usize,
}

/// Operations shared by every attenuation model.
pub trait CurveModel: fmt::Debug + Send + Sync {
    /// Variant of this model.
    fn kind(&self) -> ModelKind;

    /// Control-value domain over which the model is valid.
    fn domain(&self) -> DomainBounds;

    /// Estimates initial parameters from `(xs, ys)` and refines them by least squares.
    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport>;

    /// Output power at control value `x`. Defined for every real `x`; returns NaN while
    /// the model has no parameters.
    fn evaluate(&self, x: f64) -> f64;

    /// Control value producing output `y`.
    ///
    /// Fails with [`IlluminationError::OutOfRange`] if `y` is outside [`Self::output_range`].
    fn invert(&self, y: f64) -> AppResult<f64>;

    /// Lowest and highest output achievable over the domain, ascending.
    fn output_range(&self) -> AppResult<(f64, f64)>;

    /// Current parameters (empty while unfitted).
    fn parameters(&self) -> ModelParameters;

    /// Replaces the parameters with previously serialized ones.
    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()>;

    /// Returns true once the model has been fitted or loaded.
    fn is_fitted(&self) -> bool;

    /// Samples `(x, evaluate(x))` at `count` evenly spaced points across the domain.
    fn sample_curve(&self, count: usize) -> Vec<(f64, f64)> {
        let domain = self.domain();
        match count {
            0 => Vec::new(),
            1 => vec![(domain.min, self.evaluate(domain.min))],
            _ => (0..count)
                .map(|i| {
                    let x = domain.min + domain.width() * i as f64 / (count - 1) as f64;
                    (x, self.evaluate(x))
                })
                .collect(),
        }
    }
}

/// Owned model of any variant.
#[derive(Debug, Clone)]
pub enum AttenuationModel {
    /// See [`SinusoidalModel`].
    Sinusoidal(SinusoidalModel),
    /// See [`LinearModel`].
    Linear(LinearModel),
    /// See [`PolynomialModel`].
    Polynomial(PolynomialModel),
    /// See [`PointModel`].
    Point(PointModel),
}

impl AttenuationModel {
    /// Builds an empty model.
    pub fn new(spec: &ModelSpec) -> Self {
        match spec.kind {
            ModelKind::Sinusoidal => Self::Sinusoidal(SinusoidalModel::new(spec.domain)),
            ModelKind::Linear => Self::Linear(LinearModel::new(spec.domain)),
            ModelKind::Polynomial => {
                Self::Polynomial(PolynomialModel::new(spec.domain, spec.polydegree))
            }
            ModelKind::Point => Self::Point(PointModel::new(spec.domain)),
        }
    }

    /// Builds a model and loads stored parameters into it.
    pub fn from_parameters(spec: &ModelSpec, parameters: &ModelParameters) -> AppResult<Self> {
        let mut model = Self::new(spec);
        model.load(parameters)?;
        Ok(model)
    }

    fn inner(&self) -> &dyn CurveModel {
        match self {
            Self::Sinusoidal(m) => m,
            Self::Linear(m) => m,
            Self::Polynomial(m) => m,
            Self::Point(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn CurveModel {
        match self {
            Self::Sinusoidal(m) => m,
            Self::Linear(m) => m,
            Self::Polynomial(m) => m,
            Self::Point(m) => m,
        }
    }
}

impl CurveModel for AttenuationModel {
    fn kind(&self) -> ModelKind {
        self.inner().kind()
    }

    fn domain(&self) -> DomainBounds {
        self.inner().domain()
    }

    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport> {
        self.inner_mut().fit(xs, ys)
    }

    fn evaluate(&self, x: f64) -> f64 {
        self.inner().evaluate(x)
    }

    fn invert(&self, y: f64) -> AppResult<f64> {
        self.inner().invert(y)
    }

    fn output_range(&self) -> AppResult<(f64, f64)> {
        self.inner().output_range()
    }

    fn parameters(&self) -> ModelParameters {
        self.inner().parameters()
    }

    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()> {
        self.inner_mut().load(parameters)
    }

    fn is_fitted(&self) -> bool {
        self.inner().is_fitted()
    }
}

/// Returns true if `y` lies in `range`, allowing a small relative slack.
pub fn within_range(range: (f64, f64), y: f64) -> bool {
    let slack = RANGE_TOLERANCE * range.0.abs().max(range.1.abs()).max(1.0);
    y >= range.0 - slack && y <= range.1 + slack
}

pub(crate) fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Checks paired samples: equal lengths, enough points, all finite.
pub(crate) fn check_samples(
    kind: ModelKind,
    xs: &[f64],
    ys: &[f64],
    min_points: usize,
) -> AppResult<()> {
    if xs.len() != ys.len() {
        return Err(IlluminationError::Fitting(format!(
            "{} fit got {} control values but {} power readings",
            kind,
            xs.len(),
            ys.len()
        )));
    }
    if xs.len() < min_points {
        return Err(IlluminationError::Fitting(format!(
            "{} fit needs at least {} points, got {}",
            kind,
            min_points,
            xs.len()
        )));
    }
    if let Some(bad) = xs.iter().chain(ys).find(|v| !v.is_finite()) {
        return Err(IlluminationError::Fitting(format!(
            "{} fit input contains a non-finite value ({})",
            kind, bad
        )));
    }
    Ok(())
}

/// Rejects sample sets whose values are all equal.
pub(crate) fn check_varying(kind: ModelKind, what: &str, values: &[f64]) -> AppResult<()> {
    let (lo, hi) = min_max(values);
    if hi - lo <= f64::EPSILON * lo.abs().max(hi.abs()).max(1.0) {
        return Err(IlluminationError::Fitting(format!(
            "{} fit is degenerate: all {} are equal to {}",
            kind, what, lo
        )));
    }
    Ok(())
}

pub(crate) fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

pub(crate) fn rms(residuals: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = residuals.fold((0.0, 0usize), |(s, n), r| (s + r * r, n + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Reads named parameters, failing with the list of missing or non-finite names.
pub(crate) fn required_parameters<const N: usize>(
    kind: ModelKind,
    parameters: &ModelParameters,
    names: [&str; N],
) -> AppResult<[f64; N]> {
    let mut values = [0.0; N];
    let mut missing = Vec::new();
    for (slot, name) in values.iter_mut().zip(names) {
        match parameters.get(name) {
            Some(v) if v.is_finite() => *slot = *v,
            _ => missing.push(name),
        }
    }
    if !missing.is_empty() {
        let present: Vec<&str> = parameters.keys().map(String::as_str).collect();
        return Err(IlluminationError::InvalidParameters(format!(
            "{} model requires {}; missing or not finite: {} (got: {})",
            kind,
            names.join(", "),
            missing.join(", "),
            present.join(", ")
        )));
    }
    Ok(values)
}

pub(crate) fn unfitted(kind: ModelKind) -> IlluminationError {
    IlluminationError::InvalidParameters(format!(
        "{} model has no parameters; fit it or load a calibration first",
        kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: ModelKind) -> ModelSpec {
        ModelSpec {
            kind,
            domain: DomainBounds::new(0.0, 90.0),
            polydegree: 6,
        }
    }

    #[test]
    fn test_model_kind_from_str() {
        assert_eq!("sinusoidal".parse::<ModelKind>().unwrap(), ModelKind::Sinusoidal);
        assert_eq!(" Polynomial ".parse::<ModelKind>().unwrap(), ModelKind::Polynomial);

        let err = "cosine".parse::<ModelKind>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cosine"));
        assert!(msg.contains("sinusoidal, linear, polynomial, point"));
    }

    #[test]
    fn test_domain_bounds_orders_ends() {
        let d = DomainBounds::new(10.0, -5.0);
        assert_eq!(d.min, -5.0);
        assert_eq!(d.max, 10.0);
        assert!(d.contains(0.0));
        assert!(!d.contains(10.5));
        assert_eq!(d.clamp(12.0), 10.0);
    }

    #[test]
    fn test_new_model_is_empty() {
        for kind in ModelKind::ALL {
            let model = AttenuationModel::new(&spec(kind));
            assert_eq!(model.kind(), kind);
            assert!(!model.is_fitted());
            assert!(model.parameters().is_empty());
            assert!(model.evaluate(1.0).is_nan());
            assert!(model.output_range().is_err());
        }
    }

    #[test]
    fn test_from_parameters_reports_missing_names() {
        let mut params = ModelParameters::new();
        params.insert("bkg".into(), 1.0);
        let err = AttenuationModel::from_parameters(&spec(ModelKind::Sinusoidal), &params)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("amp"));
        assert!(msg.contains("phi"));
    }

    #[test]
    fn test_within_range_slack() {
        assert!(within_range((0.0, 50.0), 50.0 + 1e-12));
        assert!(!within_range((0.0, 50.0), 50.1));
        assert!(!within_range((0.0, 50.0), -0.1));
    }

    #[test]
    fn test_sample_curve_spans_domain() {
        let mut params = ModelParameters::new();
        params.insert("bkg".into(), 1.0);
        params.insert("amp".into(), 2.0);
        let model = AttenuationModel::from_parameters(&spec(ModelKind::Linear), &params).unwrap();
        let curve = model.sample_curve(50);
        assert_eq!(curve.len(), 50);
        assert_eq!(curve[0], (0.0, 1.0));
        assert_eq!(curve[49], (90.0, 181.0));
    }
}
