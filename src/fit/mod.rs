//! Peak and line fitting.
//!
//! The calibration code only talks to [`PeakFitter`]; [`LevenbergMarquardt`]
//! is the implementation shipped with the crate.

mod line;
mod lm;

pub use line::{fit_line, LineFit};
pub use lm::LevenbergMarquardt;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::histogram::Histogram1D;

/// Parameter bounds, one `(min, max)` pair per model parameter.
pub type Bounds = Vec<(f64, f64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakModel {
    /// `[amplitude, mean, sigma]`
    #[default]
    Gaussian,
    /// Gaussian core with a power-law low-side tail on a constant offset:
    /// `[amplitude, mean, sigma, alpha, n, offset]`
    CrystalBall,
}

impl PeakModel {
    pub fn num_params(self) -> usize {
        match self {
            PeakModel::Gaussian => 3,
            PeakModel::CrystalBall => 6,
        }
    }

    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            PeakModel::Gaussian => &["amplitude", "mean", "sigma"],
            PeakModel::CrystalBall => &["amplitude", "mean", "sigma", "alpha", "n", "offset"],
        }
    }

    pub fn evaluate(self, x: f64, params: &[f64]) -> f64 {
        let (amplitude, mean, sigma) = (params[0], params[1], params[2]);
        let t = (x - mean) / sigma;
        match self {
            PeakModel::Gaussian => amplitude * (-0.5 * t * t).exp(),
            PeakModel::CrystalBall => {
                let (alpha, n, offset) = (params[3].abs(), params[4], params[5]);
                let core = if t > -alpha {
                    (-0.5 * t * t).exp()
                } else {
                    let a = (n / alpha).powf(n) * (-0.5 * alpha * alpha).exp();
                    let b = n / alpha - alpha;
                    a * (b - t).powf(-n)
                };
                amplitude * core + offset
            }
        }
    }

    /// Starting values from the data in the fit window: highest bin,
    /// count-weighted mean and RMS. `None` when the window is empty.
    pub fn initial_guess(self, points: &[FitPoint]) -> Option<Vec<f64>> {
        let total: f64 = points.iter().map(|p| p.y.max(0.0)).sum();
        if total <= 0.0 {
            return None;
        }
        let amplitude = points.iter().map(|p| p.y).fold(f64::MIN, f64::max);
        let mean = points.iter().map(|p| p.x * p.y.max(0.0)).sum::<f64>() / total;
        let rms = (points
            .iter()
            .map(|p| (p.x - mean).powi(2) * p.y.max(0.0))
            .sum::<f64>()
            / total)
            .sqrt();
        let sigma = if rms > 0.0 { rms } else { 1.0 };

        Some(match self {
            PeakModel::Gaussian => vec![amplitude, mean, sigma],
            PeakModel::CrystalBall => vec![amplitude, mean, sigma, 1.5, 3.0, 0.0],
        })
    }

    /// Loose bounds keeping the peak inside the window.
    pub fn default_bounds(self, window: (f64, f64), guess: &[f64]) -> Bounds {
        let width = (window.1 - window.0).abs().max(f64::EPSILON);
        let mut bounds = vec![
            (0.0, f64::INFINITY),
            (window.0, window.1),
            (width * 1e-4, width),
        ];
        if self == PeakModel::CrystalBall {
            bounds.extend([(0.05, 10.0), (1.01, 100.0), (0.0, guess[0].max(1.0))]);
        }
        bounds
    }
}

/// A measured point with its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitPoint {
    pub x: f64,
    pub y: f64,
    pub sigma: f64,
}

impl FitPoint {
    /// Bin contents with Poisson errors; empty bins get an error of 1.
    pub fn from_histogram(histogram: &Histogram1D, window: (f64, f64)) -> Vec<Self> {
        histogram
            .points_in(window.0, window.1)
            .into_iter()
            .map(|(x, y)| FitPoint {
                x,
                y,
                sigma: y.max(1.0).sqrt(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub model: PeakModel,
    pub window: (f64, f64),
    pub params: Vec<f64>,
    pub errors: Vec<f64>,
    pub chi2: f64,
    pub ndf: usize,
    pub converged: bool,
}

impl FitResult {
    pub fn mean(&self) -> f64 {
        self.params[1]
    }

    pub fn mean_error(&self) -> f64 {
        self.errors[1]
    }

    pub fn sigma(&self) -> f64 {
        self.params[2].abs()
    }

    pub fn sigma_error(&self) -> f64 {
        self.errors[2]
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.model.evaluate(x, &self.params)
    }

    pub fn chi2_ndf(&self) -> Option<f64> {
        (self.ndf > 0).then(|| self.chi2 / self.ndf as f64)
    }

    /// Probability of a χ² at least this large.
    pub fn p_value(&self) -> Option<f64> {
        let dist = ChiSquared::new(self.ndf as f64).ok()?;
        Some(1.0 - dist.cdf(self.chi2))
    }

    /// Relative width σ/mean and its propagated uncertainty.
    pub fn resolution(&self) -> (f64, f64) {
        let (mean, sigma) = (self.mean(), self.sigma());
        let ratio = sigma / mean;
        let error = ratio.abs()
            * ((self.mean_error() / mean).powi(2) + (self.sigma_error() / sigma).powi(2)).sqrt();
        (ratio, error)
    }
}

/// Fits a parametric peak model to a histogram inside `window`.
///
/// Returns `None` when the window does not hold enough data to constrain the
/// model. A returned result can still be of low quality; callers judge it
/// through `converged` and the parameter errors.
pub trait PeakFitter {
    fn fit(
        &self,
        histogram: &Histogram1D,
        model: PeakModel,
        bounds: Option<&[(f64, f64)]>,
        window: (f64, f64),
    ) -> Option<FitResult>;
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_crystal_ball_is_continuous_at_alpha() {
        let params = [100.0, 400.0, 30.0, 1.2, 4.0, 5.0];
        let edge = 400.0 - 1.2 * 30.0;
        let left = PeakModel::CrystalBall.evaluate(edge - 1e-9, &params);
        let right = PeakModel::CrystalBall.evaluate(edge + 1e-9, &params);
        assert_abs_diff_eq!(left, right, epsilon = 1e-6);
        assert_abs_diff_eq!(PeakModel::CrystalBall.evaluate(400.0, &params), 105.0);
    }

    #[test]
    fn test_crystal_ball_tail_exceeds_gaussian() {
        let params = [100.0, 400.0, 30.0, 1.0, 2.0, 0.0];
        let x = 400.0 - 5.0 * 30.0;
        assert!(
            PeakModel::CrystalBall.evaluate(x, &params)
                > PeakModel::Gaussian.evaluate(x, &params[..3])
        );
    }

    #[test]
    fn test_resolution_propagation() {
        let result = FitResult {
            model: PeakModel::Gaussian,
            window: (0.0, 1.0),
            params: vec![10.0, 400.0, 40.0],
            errors: vec![1.0, 4.0, 0.8],
            chi2: 10.0,
            ndf: 10,
            converged: true,
        };
        let (ratio, error) = result.resolution();
        assert_abs_diff_eq!(ratio, 0.1);
        assert_abs_diff_eq!(error, 0.1 * (0.01f64.powi(2) + 0.02f64.powi(2)).sqrt());
        assert_abs_diff_eq!(result.chi2_ndf().unwrap(), 1.0);
        let p = result.p_value().unwrap();
        assert!(p > 0.3 && p < 0.6);
    }
}
