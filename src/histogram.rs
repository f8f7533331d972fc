//! Fixed-binning histograms used to aggregate features over a run.
//!
//! Fills are commutative, so histograms built on separate event batches can
//! be merged in any order.

use serde::{Deserialize, Serialize};

use crate::error::HistogramError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub bins: usize,
    pub low: f64,
    pub high: f64,
}

impl Axis {
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        Self { bins, low, high }
    }

    pub fn width(&self) -> f64 {
        (self.high - self.low) / self.bins as f64
    }

    /// Bin holding `x`; `None` for under/overflow (and NaN) and on an axis
    /// without bins.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(self.low..self.high).contains(&x) {
            return None;
        }
        let idx = ((x - self.low) / self.width()) as usize;
        Some(idx.min(self.bins.checked_sub(1)?))
    }

    pub fn center(&self, bin: usize) -> f64 {
        self.low + (bin as f64 + 0.5) * self.width()
    }

    pub fn centers(&self) -> Vec<f64> {
        (0..self.bins).map(|bin| self.center(bin)).collect()
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bins in [{}, {})", self.bins, self.low, self.high)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    pub axis: Axis,
    pub counts: Vec<f64>,
    pub underflow: f64,
    pub overflow: f64,
    pub entries: u64,
}

impl Histogram1D {
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        Self {
            axis: Axis::new(bins, low, high),
            counts: vec![0.0; bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        }
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0)
    }

    pub fn fill_weighted(&mut self, x: f64, weight: f64) {
        self.entries += 1;
        match self.axis.find_bin(x) {
            Some(bin) => self.counts[bin] += weight,
            None if x < self.axis.low => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    pub fn x(&self) -> Vec<f64> {
        self.axis.centers()
    }

    /// Sum of in-range bin contents.
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Contents of all bins from the one holding `low` to the one holding
    /// `high`, both inclusive. Bounds outside the axis are clamped.
    pub fn integral_between(&self, low: f64, high: f64) -> f64 {
        let clamp = |x: f64| {
            self.axis.find_bin(x).unwrap_or(if x < self.axis.low {
                0
            } else {
                self.axis.bins - 1
            })
        };
        let (first, last) = (clamp(low), clamp(high));
        if first > last {
            return 0.0;
        }
        self.counts[first..=last].iter().sum()
    }

    /// Bin centers and contents with centers inside `[low, high]`.
    pub fn points_in(&self, low: f64, high: f64) -> Vec<(f64, f64)> {
        self.counts
            .iter()
            .enumerate()
            .map(|(bin, count)| (self.axis.center(bin), *count))
            .filter(|(x, _)| (low..=high).contains(x))
            .collect()
    }

    pub fn mean(&self) -> Option<f64> {
        let total = self.total();
        (total > 0.0).then(|| {
            self.counts
                .iter()
                .enumerate()
                .map(|(bin, count)| self.axis.center(bin) * count)
                .sum::<f64>()
                / total
        })
    }

    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let total = self.total();
        let variance = self
            .counts
            .iter()
            .enumerate()
            .map(|(bin, count)| (self.axis.center(bin) - mean).powi(2) * count)
            .sum::<f64>()
            / total;
        Some(variance.sqrt())
    }

    pub fn max_bin(&self) -> Option<(usize, f64)> {
        self.counts
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (bin, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((bin, count)),
            })
    }

    pub fn merge(&mut self, other: &Histogram1D) -> Result<(), HistogramError> {
        if self.axis != other.axis {
            return Err(HistogramError::BinningMismatch {
                ours: self.axis.to_string(),
                theirs: other.axis.to_string(),
            });
        }
        self.counts
            .iter_mut()
            .zip(&other.counts)
            .for_each(|(ours, theirs)| *ours += theirs);
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    pub fn to_csv(&self, separator: char) -> String {
        let mut out = format!("bin_center{separator}counts\n");
        for (bin, count) in self.counts.iter().enumerate() {
            out.push_str(&format!("{}{separator}{count}\n", self.axis.center(bin)));
        }
        out
    }
}

/// One x-column of a [`Histogram2D`]: mean y weighted by bin contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfilePoint {
    pub x: f64,
    pub mean: f64,
    pub entries: f64,
}

/// Counts stored row-major by x bin (`counts[ix * y_bins + iy]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram2D {
    pub x_axis: Axis,
    pub y_axis: Axis,
    pub counts: Vec<u32>,
    pub entries: u64,
}

impl Histogram2D {
    pub fn new(x_axis: Axis, y_axis: Axis) -> Self {
        Self {
            x_axis,
            y_axis,
            counts: vec![0; x_axis.bins * y_axis.bins],
            entries: 0,
        }
    }

    pub fn fill(&mut self, x: f64, y: f64) {
        self.entries += 1;
        if let (Some(ix), Some(iy)) = (self.x_axis.find_bin(x), self.y_axis.find_bin(y)) {
            self.counts[ix * self.y_axis.bins + iy] += 1;
        }
    }

    pub fn get(&self, ix: usize, iy: usize) -> u32 {
        self.counts[ix * self.y_axis.bins + iy]
    }

    /// Column means for every x bin that holds at least one entry.
    pub fn profile_x(&self) -> Vec<ProfilePoint> {
        (0..self.x_axis.bins)
            .filter_map(|ix| {
                let (sum, entries) = (0..self.y_axis.bins).fold((0.0, 0.0), |(sum, n), iy| {
                    let count = self.get(ix, iy) as f64;
                    (sum + count * self.y_axis.center(iy), n + count)
                });
                (entries > 0.0).then(|| ProfilePoint {
                    x: self.x_axis.center(ix),
                    mean: sum / entries,
                    entries,
                })
            })
            .collect()
    }

    /// `z[iy][ix]`, the layout heat maps expect.
    pub fn z_rows(&self) -> Vec<Vec<f64>> {
        (0..self.y_axis.bins)
            .map(|iy| {
                (0..self.x_axis.bins)
                    .map(|ix| self.get(ix, iy) as f64)
                    .collect()
            })
            .collect()
    }

    pub fn merge(&mut self, other: &Histogram2D) -> Result<(), HistogramError> {
        if self.x_axis != other.x_axis || self.y_axis != other.y_axis {
            return Err(HistogramError::BinningMismatch {
                ours: format!("{} x {}", self.x_axis, self.y_axis),
                theirs: format!("{} x {}", other.x_axis, other.y_axis),
            });
        }
        self.counts
            .iter_mut()
            .zip(&other.counts)
            .for_each(|(ours, theirs)| *ours += theirs);
        self.entries += other.entries;
        Ok(())
    }
}
