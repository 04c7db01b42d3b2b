//! Numerical routines behind the curve models.
//!
//! - [`levenberg_marquardt`]: damped Gauss-Newton refinement of a scalar model
//!   `y = f(x; p)` against paired samples.
//! - [`polyfit`]: linear least-squares polynomial fit through an SVD of the
//!   column-scaled Vandermonde matrix.
//! - [`polyval`], [`polyder`], [`real_roots`]: polynomial helpers. Roots come from the
//!   eigenvalues of the companion matrix and are polished with Newton steps.
//!
//! Coefficients are always stored in ascending order: `c[0] + c[1] x + c[2] x^2 + ...`.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{AppResult, IlluminationError};

/// Tuning knobs for [`levenberg_marquardt`].
#[derive(Debug, Clone, Copy)]
pub struct LmSettings {
    /// Maximum number of accepted or rejected steps.
    pub max_iterations: usize,
    /// Relative reduction of the cost below which the fit is converged.
    pub ftol: f64,
    /// Relative step size below which the fit is converged.
    pub xtol: f64,
    /// Infinity norm of the gradient below which the fit is converged.
    pub gtol: f64,
    /// Starting damping factor.
    pub initial_lambda: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-12,
            initial_lambda: 1e-3,
        }
    }
}

/// Result of a successful refinement.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    /// Refined parameter vector.
    pub params: Vec<f64>,
    /// Number of iterations used.
    pub iterations: usize,
    /// Sum of squared residuals at `params`.
    pub cost: f64,
}

const MAX_LAMBDA: f64 = 1e16;

/// Refines `initial` so that `model(x, p)` best matches `ys` in the least-squares sense.
///
/// `jacobian(x, p, row)` must fill `row[j]` with `d model / d p[j]` at `x`.
///
/// Fails with [`IlluminationError::Fitting`] if the residuals become non-finite or the
/// iteration budget runs out before any convergence criterion is met. A step that
/// cannot reduce the cost even with maximal damping is treated as converged (no
/// further reduction is possible from this point).
pub fn levenberg_marquardt<F, J>(
    xs: &[f64],
    ys: &[f64],
    initial: &[f64],
    model: F,
    jacobian: J,
    settings: LmSettings,
) -> AppResult<LmOutcome>
where
    F: Fn(f64, &[f64]) -> f64,
    J: Fn(f64, &[f64], &mut [f64]),
{
    let n = xs.len();
    let m = initial.len();
    if n != ys.len() || n < m {
        return Err(IlluminationError::Fitting(format!(
            "need at least {} paired samples for {} parameters, got {} x and {} y values",
            m,
            m,
            n,
            ys.len()
        )));
    }

    let residuals = |p: &DVector<f64>| -> DVector<f64> {
        DVector::from_iterator(
            n,
            xs.iter()
                .zip(ys)
                .map(|(&x, &y)| y - model(x, p.as_slice())),
        )
    };

    let mut p = DVector::from_column_slice(initial);
    let mut r = residuals(&p);
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(IlluminationError::Fitting(format!(
            "initial parameters {:?} produce non-finite residuals",
            initial
        )));
    }

    let mut lambda = settings.initial_lambda;
    let mut row = vec![0.0; m];
    let mut jac = DMatrix::<f64>::zeros(n, m);

    for iteration in 1..=settings.max_iterations {
        for (i, &x) in xs.iter().enumerate() {
            jacobian(x, p.as_slice(), &mut row);
            for (j, value) in row.iter().enumerate() {
                jac[(i, j)] = *value;
            }
        }
        let jt = jac.transpose();
        let jtj = &jt * &jac;
        let gradient = &jt * &r;

        if gradient.amax() <= settings.gtol {
            return Ok(LmOutcome {
                params: p.as_slice().to_vec(),
                iterations: iteration,
                cost,
            });
        }

        loop {
            let mut damped = jtj.clone();
            for k in 0..m {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }

            let Some(cholesky) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    return Ok(LmOutcome {
                        params: p.as_slice().to_vec(),
                        iterations: iteration,
                        cost,
                    });
                }
                continue;
            };

            let delta = cholesky.solve(&gradient);
            let candidate = &p + &delta;
            let r_candidate = residuals(&candidate);
            let cost_candidate = r_candidate.norm_squared();

            if cost_candidate.is_finite() && cost_candidate < cost {
                let reduction = (cost - cost_candidate) / cost.max(f64::MIN_POSITIVE);
                let small_step = delta.norm() <= settings.xtol * (p.norm() + settings.xtol);
                p = candidate;
                r = r_candidate;
                cost = cost_candidate;
                lambda = (lambda / 10.0).max(1e-15);

                if reduction <= settings.ftol || small_step {
                    return Ok(LmOutcome {
                        params: p.as_slice().to_vec(),
                        iterations: iteration,
                        cost,
                    });
                }
                break;
            }

            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                debug!(iteration, cost, "no further cost reduction possible");
                return Ok(LmOutcome {
                    params: p.as_slice().to_vec(),
                    iterations: iteration,
                    cost,
                });
            }
        }
    }

    Err(IlluminationError::Fitting(format!(
        "refinement did not converge within {} iterations (residual sum of squares {:.6e})",
        settings.max_iterations, cost
    )))
}

/// Evaluates a polynomial with Horner's method.
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .rev()
        .fold(0.0, |acc, &c| acc * x + c)
}

/// Coefficients of the first derivative.
pub fn polyder(coefficients: &[f64]) -> Vec<f64> {
    coefficients
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, &c)| i as f64 * c)
        .collect()
}

/// Least-squares polynomial of `degree` through `(xs, ys)`.
///
/// Columns of the Vandermonde matrix are scaled to unit max-norm before the SVD so
/// that degrees around 15 over control ranges of tens of units stay well conditioned.
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> AppResult<Vec<f64>> {
    let n = xs.len();
    let cols = degree + 1;
    if n != ys.len() {
        return Err(IlluminationError::Fitting(format!(
            "mismatched sample lengths: {} x values, {} y values",
            n,
            ys.len()
        )));
    }
    if n < cols {
        return Err(IlluminationError::Fitting(format!(
            "a degree {} polynomial needs at least {} points, got {}",
            degree, cols, n
        )));
    }

    let mut vandermonde = DMatrix::<f64>::from_fn(n, cols, |i, j| xs[i].powi(j as i32));
    let mut scales = vec![1.0; cols];
    for (j, scale) in scales.iter_mut().enumerate() {
        let norm = vandermonde.column(j).amax();
        if norm > 0.0 {
            *scale = norm;
            vandermonde.column_mut(j).unscale_mut(norm);
        }
    }

    let rhs = DVector::from_column_slice(ys);
    let svd = vandermonde.svd(true, true);
    let largest = svd.singular_values.max();
    let solution = svd
        .solve(&rhs, largest * 1e-13)
        .map_err(|e| IlluminationError::Fitting(format!("polynomial least squares failed: {}", e)))?;

    let coefficients: Vec<f64> = solution
        .iter()
        .zip(&scales)
        .map(|(c, s)| c / s)
        .collect();
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(IlluminationError::Fitting(
            "polynomial least squares produced non-finite coefficients".to_string(),
        ));
    }
    Ok(coefficients)
}

/// Real roots of a polynomial, in ascending order.
pub fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    let scale = coefficients.iter().fold(0.0_f64, |acc, c| acc.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let mut trimmed = coefficients.to_vec();
    while trimmed.len() > 1 && trimmed.last().map_or(false, |c| c.abs() <= scale * 1e-14) {
        trimmed.pop();
    }

    let degree = trimmed.len() - 1;
    let mut roots = match degree {
        0 => return Vec::new(),
        1 => vec![-trimmed[0] / trimmed[1]],
        _ => {
            let lead = trimmed[degree];
            let companion = DMatrix::<f64>::from_fn(degree, degree, |i, j| {
                if j == degree - 1 {
                    -trimmed[i] / lead
                } else if i == j + 1 {
                    1.0
                } else {
                    0.0
                }
            });
            companion
                .complex_eigenvalues()
                .iter()
                .filter(|z| z.im.abs() <= 1e-7 * z.re.abs().max(1.0))
                .map(|z| polish_root(&trimmed, z.re))
                .collect()
        }
    };

    roots.retain(|r| r.is_finite());
    roots.sort_by(f64::total_cmp);
    roots
}

fn polish_root(coefficients: &[f64], mut x: f64) -> f64 {
    let derivative = polyder(coefficients);
    for _ in 0..8 {
        let dfx = polyval(&derivative, x);
        if dfx.abs() < 1e-300 {
            break;
        }
        let step = polyval(coefficients, x) / dfx;
        x -= step;
        if step.abs() <= 1e-15 * x.abs().max(1.0) {
            break;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_polyval_and_derivative() {
        // y = 1 + 2x + 3x^2
        let c = [1.0, 2.0, 3.0];
        assert_relative_eq!(polyval(&c, 0.0), 1.0);
        assert_relative_eq!(polyval(&c, 2.0), 17.0);
        assert_eq!(polyder(&c), vec![2.0, 6.0]);
        assert!(polyder(&[5.0]).is_empty());
    }

    #[test]
    fn test_polyfit_recovers_cubic() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 1.25).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|x| 0.5 - 1.5 * x + 0.25 * x * x - 0.01 * x * x * x)
            .collect();
        let c = polyfit(&xs, &ys, 3).unwrap();
        assert_relative_eq!(c[0], 0.5, epsilon = 1e-8);
        assert_relative_eq!(c[1], -1.5, epsilon = 1e-8);
        assert_relative_eq!(c[2], 0.25, epsilon = 1e-9);
        assert_relative_eq!(c[3], -0.01, epsilon = 1e-10);
    }

    #[test]
    fn test_polyfit_needs_enough_points() {
        let err = polyfit(&[0.0, 1.0], &[1.0, 2.0], 3).unwrap_err();
        assert!(matches!(err, IlluminationError::Fitting(_)));
    }

    #[test]
    fn test_real_roots() {
        // (x - 1)(x - 2)(x + 3) = x^3 - 7x + 6
        let roots = real_roots(&[6.0, -7.0, 0.0, 1.0]);
        assert_eq!(roots.len(), 3);
        assert_relative_eq!(roots[0], -3.0, epsilon = 1e-9);
        assert_relative_eq!(roots[1], 1.0, epsilon = 1e-9);
        assert_relative_eq!(roots[2], 2.0, epsilon = 1e-9);

        // x^2 + 1 has no real roots
        assert!(real_roots(&[1.0, 0.0, 1.0]).is_empty());
        // trailing zeros are ignored
        let linear = real_roots(&[-4.0, 2.0, 0.0]);
        assert_eq!(linear.len(), 1);
        assert_relative_eq!(linear[0], 2.0);
    }

    #[test]
    fn test_levenberg_marquardt_exponential() {
        let xs: Vec<f64> = (0..15).map(|i| i as f64 * 0.2).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * (-0.7 * x).exp()).collect();
        let outcome = levenberg_marquardt(
            &xs,
            &ys,
            &[1.0, -0.1],
            |x, p| p[0] * (p[1] * x).exp(),
            |x, p, row| {
                row[0] = (p[1] * x).exp();
                row[1] = p[0] * x * (p[1] * x).exp();
            },
            LmSettings::default(),
        )
        .unwrap();
        assert_relative_eq!(outcome.params[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(outcome.params[1], -0.7, epsilon = 1e-6);
        assert!(outcome.cost < 1e-12);
    }

    #[test]
    fn test_levenberg_marquardt_rejects_too_few_points() {
        let err = levenberg_marquardt(
            &[1.0],
            &[2.0],
            &[0.0, 1.0],
            |x, p| p[0] + p[1] * x,
            |x, _p, row| {
                row[0] = 1.0;
                row[1] = x;
            },
            LmSettings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }
}
