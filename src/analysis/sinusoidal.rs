//! Rotation-mount response through a polarizer.
//!
//! `y = bkg + amp * (1 + sin(4 * (x + phi) degrees)) / 2`, period 90 degrees in `x`.
//! Fitted parameters are kept canonical: `amp > 0` and `phi` in `[0, 90)`.

use std::f64::consts::PI;

use tracing::debug;

use super::fit::{levenberg_marquardt, LmSettings};
use super::{
    check_samples, check_varying, min_max, ordered, required_parameters, rms, unfitted,
    within_range, CurveModel, DomainBounds, FitReport, ModelKind, ModelParameters,
};
use crate::error::{AppResult, IlluminationError};

/// Period of the response in control units (degrees).
pub const PERIOD: f64 = 90.0;

/// Maximum number of whole periods a raw inverse may be shifted by.
const MAX_FOLDS: u32 = 5;

const RAD_PER_DEG: f64 = 4.0 * PI / 180.0;
const PHASE_GRID_STEP: f64 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Params {
    bkg: f64,
    amp: f64,
    phi: f64,
}

impl Params {
    fn from_slice(p: &[f64]) -> Self {
        Self {
            bkg: p[0],
            amp: p[1],
            phi: p[2],
        }
    }

    fn canonical(self) -> Self {
        let mut p = self;
        if p.amp < 0.0 {
            p.bkg += p.amp;
            p.amp = -p.amp;
            p.phi += PERIOD / 2.0;
        }
        p.phi = p.phi.rem_euclid(PERIOD);
        p
    }
}

fn modulation(x: f64, phi: f64) -> f64 {
    (1.0 + (RAD_PER_DEG * (x + phi)).sin()) / 2.0
}

fn shape(x: f64, p: &[f64]) -> f64 {
    p[0] + p[1] * modulation(x, p[2])
}

fn shape_jacobian(x: f64, p: &[f64], row: &mut [f64]) {
    let theta = RAD_PER_DEG * (x + p[2]);
    row[0] = 1.0;
    row[1] = (1.0 + theta.sin()) / 2.0;
    row[2] = p[1] * theta.cos() * RAD_PER_DEG / 2.0;
}

fn sum_squares(xs: &[f64], ys: &[f64], p: &[f64]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - shape(x, p);
            r * r
        })
        .sum()
}

/// Sinusoidal attenuation model.
#[derive(Debug, Clone)]
pub struct SinusoidalModel {
    domain: DomainBounds,
    params: Option<Params>,
}

impl SinusoidalModel {
    /// Creates an unfitted model over `domain`.
    pub fn new(domain: DomainBounds) -> Self {
        Self {
            domain,
            params: None,
        }
    }

    /// Creates a model with known parameters.
    pub fn with_parameters(domain: DomainBounds, bkg: f64, amp: f64, phi: f64) -> Self {
        Self {
            domain,
            params: Some(Params { bkg, amp, phi }),
        }
    }

    fn params(&self) -> AppResult<Params> {
        self.params.ok_or_else(|| unfitted(ModelKind::Sinusoidal))
    }

    /// Background, full modulation and phase from the raw extrema.
    fn initial_estimate(xs: &[f64], ys: &[f64]) -> [f64; 3] {
        let (lo, hi) = min_max(ys);
        let argmax = ys
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        [lo, hi - lo, xs[argmax] + 22.5]
    }

    /// Best phase on a coarse grid, with `bkg` and `amp` solved in closed form for each
    /// candidate. Keeps the extrema estimate if it is already better.
    fn seed(xs: &[f64], ys: &[f64]) -> [f64; 3] {
        let mut best = Self::initial_estimate(xs, ys);
        let mut best_cost = sum_squares(xs, ys, &best);

        let n = xs.len() as f64;
        let steps = (PERIOD / PHASE_GRID_STEP) as usize;
        for k in 0..steps {
            let phi = k as f64 * PHASE_GRID_STEP;
            let s: Vec<f64> = xs.iter().map(|&x| modulation(x, phi)).collect();
            let s_mean = s.iter().sum::<f64>() / n;
            let y_mean = ys.iter().sum::<f64>() / n;
            let (cov, var) = s.iter().zip(ys).fold((0.0, 0.0), |(c, v), (&si, &yi)| {
                (c + (si - s_mean) * (yi - y_mean), v + (si - s_mean) * (si - s_mean))
            });
            if var <= f64::EPSILON {
                continue;
            }
            let amp = cov / var;
            let candidate = [y_mean - amp * s_mean, amp, phi];
            let cost = sum_squares(xs, ys, &candidate);
            if cost < best_cost {
                best = candidate;
                best_cost = cost;
            }
        }
        best
    }

    /// Control values of the interior extrema inside the domain.
    fn critical_points(&self, p: &Params) -> Vec<f64> {
        let first = 22.5 - p.phi;
        let half = PERIOD / 2.0;
        let k0 = ((self.domain.min - first) / half).ceil();
        let mut points = Vec::new();
        let mut x = first + k0 * half;
        while x <= self.domain.max {
            points.push(x);
            x += half;
        }
        points
    }

    /// Smallest copy of `x` shifted by whole periods that lands in the domain.
    fn fold(&self, x: f64) -> Option<f64> {
        let slack = 1e-9 * self.domain.width().max(1.0);
        let shift = ((self.domain.min - slack - x) / PERIOD).ceil();
        if shift.abs() > MAX_FOLDS as f64 {
            return None;
        }
        let folded = x + shift * PERIOD;
        (folded <= self.domain.max + slack).then(|| self.domain.clamp(folded))
    }
}

impl CurveModel for SinusoidalModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Sinusoidal
    }

    fn domain(&self) -> DomainBounds {
        self.domain
    }

    fn fit(&mut self, xs: &[f64], ys: &[f64]) -> AppResult<FitReport> {
        check_samples(ModelKind::Sinusoidal, xs, ys, 3)?;
        check_varying(ModelKind::Sinusoidal, "powers", ys)?;
        check_varying(ModelKind::Sinusoidal, "control values", xs)?;

        let seed = Self::seed(xs, ys);
        debug!(bkg = seed[0], amp = seed[1], phi = seed[2], "sinusoidal initial estimate");
        let outcome =
            levenberg_marquardt(xs, ys, &seed, shape, shape_jacobian, LmSettings::default())?;

        let p = Params::from_slice(&outcome.params).canonical();
        if !(p.bkg.is_finite() && p.amp.is_finite() && p.phi.is_finite()) || p.amp == 0.0 {
            return Err(IlluminationError::Fitting(format!(
                "sinusoidal fit produced unusable parameters bkg={} amp={} phi={}",
                p.bkg, p.amp, p.phi
            )));
        }
        self.params = Some(p);

        let fitted = [p.bkg, p.amp, p.phi];
        Ok(FitReport {
            parameters: self.parameters(),
            rms_residual: rms(xs.iter().zip(ys).map(|(&x, &y)| y - shape(x, &fitted))),
            iterations: outcome.iterations,
            points: xs.len(),
        })
    }

    fn evaluate(&self, x: f64) -> f64 {
        match self.params {
            Some(p) => p.bkg + p.amp * modulation(x, p.phi),
            None => f64::NAN,
        }
    }

    fn invert(&self, y: f64) -> AppResult<f64> {
        let p = self.params()?;
        let range = self.output_range()?;
        if !within_range(range, y) {
            return Err(IlluminationError::out_of_range(y, range));
        }
        if p.amp == 0.0 {
            return Ok(self.domain.min);
        }

        let u = (2.0 * (y - p.bkg) / p.amp - 1.0).clamp(-1.0, 1.0);
        let angle = u.asin().to_degrees();
        let principal = angle / 4.0 - p.phi;
        let mirror = (180.0 - angle) / 4.0 - p.phi;

        let candidates: Vec<f64> = [principal, mirror]
            .into_iter()
            .filter_map(|x| self.fold(x))
            .collect();
        debug!(y, principal, mirror, ?candidates, "sinusoidal inversion");

        candidates
            .into_iter()
            .min_by(f64::total_cmp)
            .ok_or(IlluminationError::NoSolutionInDomain {
                requested: y,
                min: self.domain.min,
                max: self.domain.max,
                periods: MAX_FOLDS,
            })
    }

    fn output_range(&self) -> AppResult<(f64, f64)> {
        let p = self.params()?;
        let (mut lo, mut hi) = ordered(
            self.evaluate(self.domain.min),
            self.evaluate(self.domain.max),
        );
        for x in self.critical_points(&p) {
            let y = self.evaluate(x);
            lo = lo.min(y);
            hi = hi.max(y);
        }
        Ok((lo, hi))
    }

    fn parameters(&self) -> ModelParameters {
        let mut out = ModelParameters::new();
        if let Some(p) = self.params {
            out.insert("bkg".to_string(), p.bkg);
            out.insert("amp".to_string(), p.amp);
            out.insert("phi".to_string(), p.phi);
        }
        out
    }

    fn load(&mut self, parameters: &ModelParameters) -> AppResult<()> {
        let [bkg, amp, phi] =
            required_parameters(ModelKind::Sinusoidal, parameters, ["bkg", "amp", "phi"])?;
        self.params = Some(Params { bkg, amp, phi });
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
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn quarter_wave() -> SinusoidalModel {
        SinusoidalModel::with_parameters(DomainBounds::new(0.0, 90.0), 0.0, 50.0, 30.0)
    }

    #[test]
    fn test_evaluate_matches_formula() {
        let model = quarter_wave();
        let expected = 50.0 * (1.0 + (4.0 * PI / 180.0 * 40.0).sin()) / 2.0;
        assert_relative_eq!(model.evaluate(10.0), expected, epsilon = 1e-12);
        // defined outside the domain too
        assert!(model.evaluate(-400.0).is_finite());
    }

    #[test]
    fn test_invert_known_point() {
        let model = quarter_wave();
        let x = model.invert(model.evaluate(10.0)).unwrap();
        assert_relative_eq!(x, 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_round_trip_within_one_period() {
        let model = quarter_wave();
        // With phi = 30 the smallest in-domain solution for every power lies in [0, 37.5].
        for i in 0..=75 {
            let x = i as f64 * 0.5;
            let back = model.invert(model.evaluate(x)).unwrap();
            assert!(
                (back - x).abs() < 1e-3,
                "x = {} inverted to {}",
                x,
                back
            );
        }
    }

    #[test]
    fn test_invert_any_solution_reproduces_power() {
        let model = quarter_wave();
        for i in 0..=90 {
            let x = i as f64;
            let y = model.evaluate(x);
            let back = model.invert(y).unwrap();
            assert!(model.domain().contains(back));
            assert_relative_eq!(model.evaluate(back), y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_invert_out_of_range() {
        let model = quarter_wave();
        match model.invert(60.0).unwrap_err() {
            IlluminationError::OutOfRange { requested, min, max } => {
                assert_eq!(requested, 60.0);
                assert_relative_eq!(min, 0.0, epsilon = 1e-9);
                assert_relative_eq!(max, 50.0, epsilon = 1e-9);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_invert_folds_into_distant_domain() {
        // four periods away from the asin branches
        let model = SinusoidalModel::with_parameters(DomainBounds::new(360.0, 450.0), 0.0, 50.0, 10.0);
        let y = model.evaluate(380.0);
        let x = model.invert(y).unwrap();
        assert!(model.domain().contains(x));
        assert_relative_eq!(model.evaluate(x), y, epsilon = 1e-6);
    }

    #[test]
    fn test_invert_gives_up_after_max_folds() {
        // reachable power, but every solution is more than five periods from the branches
        let model = SinusoidalModel::with_parameters(DomainBounds::new(500.0, 590.0), 0.0, 50.0, 10.0);
        let y = model.evaluate(520.0);
        let (lo, hi) = model.output_range().unwrap();
        assert!(within_range((lo, hi), y));

        let err = model.invert(y).unwrap_err();
        match &err {
            IlluminationError::NoSolutionInDomain {
                requested,
                min,
                max,
                periods,
            } => {
                assert_eq!(*requested, y);
                assert_eq!((*min, *max), (500.0, 590.0));
                assert_eq!(*periods, 5);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.to_string().contains("within 5 periods of the domain [500, 590]"));
    }

    #[test]
    fn test_output_range_uses_interior_extrema() {
        // Narrow domain around the maximum at x = 22.5 - phi + 90k = 82.5 for phi = 30.
        let model = SinusoidalModel::with_parameters(DomainBounds::new(70.0, 90.0), 5.0, 40.0, 30.0);
        let (lo, hi) = model.output_range().unwrap();
        assert_relative_eq!(hi, 45.0, epsilon = 1e-9);
        assert!(lo > 5.0);

        for i in 0..=200 {
            let x = 70.0 + i as f64 * 0.1;
            assert!(within_range((lo, hi), model.evaluate(x)));
        }
    }

    #[test]
    fn test_narrow_domain_without_solution_fails() {
        // Output range of [70, 75] is a monotonic slice; invert works inside it only.
        let model = SinusoidalModel::with_parameters(DomainBounds::new(70.0, 75.0), 0.0, 50.0, 30.0);
        let (lo, hi) = model.output_range().unwrap();
        let mid = (lo + hi) / 2.0;
        let x = model.invert(mid).unwrap();
        assert!((70.0..=75.0).contains(&x));
        assert!(model.invert(hi + 1.0).is_err());
    }

    #[test]
    fn test_fit_recovers_parameters_with_noise() {
        let mut rng = StdRng::seed_from_u64(7);
        let truth = SinusoidalModel::with_parameters(DomainBounds::new(0.0, 90.0), 5.0, 40.0, 12.0);
        let xs: Vec<f64> = (0..19).map(|i| i as f64 * 5.0).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| truth.evaluate(x) + rng.gen_range(-0.2..0.2))
            .collect();

        let mut model = SinusoidalModel::new(DomainBounds::new(0.0, 90.0));
        let report = model.fit(&xs, &ys).unwrap();
        assert_eq!(report.points, 19);
        assert!(report.rms_residual < 0.5);

        let params = model.parameters();
        assert_relative_eq!(params["bkg"], 5.0, max_relative = 0.1);
        assert_relative_eq!(params["amp"], 40.0, max_relative = 0.1);
        assert_relative_eq!(params["phi"], 12.0, max_relative = 0.1);
    }

    #[test]
    fn test_fit_canonicalizes_parameters() {
        // Same curve written with a negative amplitude and shifted phase.
        let xs: Vec<f64> = (0..30).map(|i| i as f64 * 3.0).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| shape(x, &[45.0, -40.0, 57.0]))
            .collect();
        let mut model = SinusoidalModel::new(DomainBounds::new(0.0, 90.0));
        model.fit(&xs, &ys).unwrap();
        let p = model.parameters();
        assert!(p["amp"] > 0.0);
        assert!((0.0..PERIOD).contains(&p["phi"]));
        for &x in &xs {
            assert_relative_eq!(model.evaluate(x), shape(x, &[45.0, -40.0, 57.0]), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_fit_rejects_flat_data() {
        let mut model = SinusoidalModel::new(DomainBounds::new(0.0, 90.0));
        let err = model.fit(&[0.0, 10.0, 20.0], &[3.0, 3.0, 3.0]).unwrap_err();
        assert!(matches!(err, IlluminationError::Fitting(_)));
        assert!(!model.is_fitted());

        let err = model.fit(&[0.0, 10.0], &[1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("at least 3"));
    }

    #[test]
    fn test_load_round_trip() {
        let model = quarter_wave();
        let mut restored = SinusoidalModel::new(DomainBounds::new(0.0, 90.0));
        restored.load(&model.parameters()).unwrap();
        for i in 0..=18 {
            let x = i as f64 * 5.0;
            assert_eq!(restored.evaluate(x), model.evaluate(x));
            let y = model.evaluate(x);
            assert_eq!(restored.invert(y).unwrap(), model.invert(y).unwrap());
        }
    }
}
