use serde::{Deserialize, Serialize};

/// `y = slope * x + intercept` with standard errors from the residuals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    pub slope: f64,
    pub slope_error: f64,
    pub intercept: f64,
    pub intercept_error: f64,
    pub points: usize,
}

impl LineFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Least-squares line through the points with `x` inside `window`
/// (inclusive). Needs at least three points spread over two distinct `x`
/// values, otherwise the errors are undefined and `None` is returned.
pub fn fit_line(points: &[(f64, f64)], window: (f64, f64)) -> Option<LineFit> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = points
        .iter()
        .filter(|(x, _)| (window.0..=window.1).contains(x))
        .copied()
        .unzip();

    let n = xs.len();
    if n < 3 {
        return None;
    }

    let x_mean = xs.iter().sum::<f64>() / n as f64;
    let sxx = xs.iter().map(|x| (x - x_mean).powi(2)).sum::<f64>();
    if sxx <= 0.0 {
        return None;
    }

    let (slope, intercept): (f64, f64) = linreg::linear_regression(&xs, &ys).ok()?;

    let residual_variance = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum::<f64>()
        / (n - 2) as f64;

    Some(LineFit {
        slope,
        slope_error: (residual_variance / sxx).sqrt(),
        intercept,
        intercept_error: (residual_variance * (1.0 / n as f64 + x_mean * x_mean / sxx)).sqrt(),
        points: n,
    })
}
