use log::trace;
use nalgebra::{DMatrix, DVector};

use super::{FitPoint, FitResult, PeakFitter, PeakModel};
use crate::histogram::Histogram1D;

/// Damped least squares on the χ² of binned data.
#[derive(Debug, Clone, Copy)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// relative χ² change treated as convergence
    pub tolerance: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

fn clamp_into(params: &mut [f64], bounds: &[(f64, f64)]) {
    for (param, (low, high)) in params.iter_mut().zip(bounds) {
        *param = param.clamp(*low, *high);
    }
}

fn chi2(model: PeakModel, points: &[FitPoint], params: &[f64]) -> f64 {
    points
        .iter()
        .map(|p| ((p.y - model.evaluate(p.x, params)) / p.sigma).powi(2))
        .sum()
}

/// Normal equations `JᵀWJ` and `JᵀWr` with a central-difference Jacobian.
fn normal_equations(
    model: PeakModel,
    points: &[FitPoint],
    params: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let n = params.len();
    let mut alpha = DMatrix::<f64>::zeros(n, n);
    let mut beta = DVector::<f64>::zeros(n);
    let mut shifted = params.to_vec();

    for p in points {
        let weight = p.sigma.powi(-2);
        let residual = p.y - model.evaluate(p.x, params);

        let gradient = (0..n)
            .map(|j| {
                let h = 1e-6 * params[j].abs().max(1e-3);
                shifted[j] = params[j] + h;
                let up = model.evaluate(p.x, &shifted);
                shifted[j] = params[j] - h;
                let down = model.evaluate(p.x, &shifted);
                shifted[j] = params[j];
                (up - down) / (2.0 * h)
            })
            .collect::<Vec<_>>();

        for j in 0..n {
            beta[j] += weight * gradient[j] * residual;
            for k in 0..=j {
                alpha[(j, k)] += weight * gradient[j] * gradient[k];
            }
        }
    }
    for j in 0..n {
        for k in 0..j {
            alpha[(k, j)] = alpha[(j, k)];
        }
    }

    (alpha, beta)
}

impl LevenbergMarquardt {
    /// Fits `model` to arbitrary points, starting from `initial`.
    pub fn fit_points(
        &self,
        points: &[FitPoint],
        model: PeakModel,
        initial: Vec<f64>,
        bounds: &[(f64, f64)],
        window: (f64, f64),
    ) -> Option<FitResult> {
        let n = model.num_params();
        if points.len() <= n || initial.len() != n || bounds.len() != n {
            return None;
        }

        let mut params = initial;
        clamp_into(&mut params, bounds);
        let mut current = chi2(model, points, &params);
        let mut lambda = 1e-3;
        let mut converged = false;

        for iteration in 0..self.max_iterations {
            let (alpha, beta) = normal_equations(model, points, &params);

            let mut damped = alpha.clone();
            for j in 0..n {
                damped[(j, j)] += lambda * alpha[(j, j)].max(f64::EPSILON);
            }
            let Some(step) = damped.lu().solve(&beta) else {
                lambda *= 10.0;
                continue;
            };

            let mut candidate = params.iter().zip(step.iter()).map(|(p, d)| p + d).collect::<Vec<_>>();
            clamp_into(&mut candidate, bounds);
            let next = chi2(model, points, &candidate);

            if next.is_finite() && next <= current {
                let change = current - next;
                params = candidate;
                current = next;
                lambda = (lambda / 10.0).max(1e-12);
                if change <= self.tolerance * current.max(1.0) {
                    trace!("converged after {iteration} iterations, chi2 {current}");
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    // no downhill step left within machine precision
                    converged = current.is_finite();
                    break;
                }
            }
        }

        let (alpha, _) = normal_equations(model, points, &params);
        let errors = match alpha.try_inverse() {
            Some(covariance) => (0..n)
                .map(|j| {
                    let variance = covariance[(j, j)];
                    if variance.is_finite() && variance >= 0.0 {
                        variance.sqrt()
                    } else {
                        f64::INFINITY
                    }
                })
                .collect(),
            None => vec![f64::INFINITY; n],
        };

        Some(FitResult {
            model,
            window,
            params,
            errors,
            chi2: current,
            ndf: points.len() - n,
            converged,
        })
    }
}

impl PeakFitter for LevenbergMarquardt {
    fn fit(
        &self,
        histogram: &Histogram1D,
        model: PeakModel,
        bounds: Option<&[(f64, f64)]>,
        window: (f64, f64),
    ) -> Option<FitResult> {
        let points = FitPoint::from_histogram(histogram, window);
        let initial = model.initial_guess(&points)?;
        let bounds = match bounds {
            Some(bounds) => bounds.to_vec(),
            None => model.default_bounds(window, &initial),
        };
        self.fit_points(&points, model, initial, &bounds, window)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn gaussian_histogram(amplitude: f64, mean: f64, sigma: f64) -> Histogram1D {
        let mut hist = Histogram1D::new(256, 0.0, 1024.0);
        for bin in 0..hist.axis.bins {
            let x = hist.axis.center(bin);
            let count = (amplitude * (-0.5 * ((x - mean) / sigma).powi(2)).exp()).round();
            hist.fill_weighted(x, count);
        }
        hist
    }

    #[test]
    fn test_gaussian_recovers_peak() {
        let hist = gaussian_histogram(500.0, 450.0, 60.0);
        let result = LevenbergMarquardt::default()
            .fit(&hist, PeakModel::Gaussian, None, (175.0, 900.0))
            .unwrap();

        assert_abs_diff_eq!(result.mean(), 450.0, epsilon = 1.0);
        assert_abs_diff_eq!(result.sigma(), 60.0, epsilon = 1.0);
        assert_abs_diff_eq!(result.params[0], 500.0, epsilon = 10.0);
        assert!(result.mean_error() > 0.0 && result.mean_error() < 1.0);
        assert!(result.chi2_ndf().unwrap() < 1.0);
    }

    #[test]
    fn test_crystal_ball_on_gaussian_data() {
        let hist = gaussian_histogram(800.0, 520.0, 40.0);
        let result = LevenbergMarquardt::default()
            .fit(&hist, PeakModel::CrystalBall, None, (175.0, 900.0))
            .unwrap();
        assert_abs_diff_eq!(result.mean(), 520.0, epsilon = 2.0);
        assert_eq!(result.params.len(), 6);
    }

    #[test]
    fn test_empty_window_gives_no_fit() {
        let hist = Histogram1D::new(256, 0.0, 1024.0);
        assert!(LevenbergMarquardt::default()
            .fit(&hist, PeakModel::Gaussian, None, (175.0, 900.0))
            .is_none());
    }

    #[test]
    fn test_bounds_are_respected() {
        let hist = gaussian_histogram(300.0, 450.0, 50.0);
        let bounds = [(0.0, 1e6), (200.0, 400.0), (1.0, 500.0)];
        let result = LevenbergMarquardt::default()
            .fit(&hist, PeakModel::Gaussian, Some(&bounds), (175.0, 900.0))
            .unwrap();
        assert!(result.mean() <= 400.0);
    }
}
