//! Beam position scan: how the peak sum of one crystal changes as the beam
//! is moved across it.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    channel_map::{ChannelMap, ReadoutMode},
    config::ScanPolicy,
    fit::{FitPoint, FitResult, LevenbergMarquardt, PeakFitter, PeakModel},
    histogram::Histogram1D,
    waveform::Event,
};

/// Peak-amplitude sum of the scanned crystal for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrystalPeakSum {
    pub crystal: usize,
    pub histogram: Histogram1D,
}

impl CrystalPeakSum {
    pub fn new(policy: &ScanPolicy) -> Self {
        Self {
            crystal: policy.crystal,
            histogram: policy.binning.histogram(),
        }
    }

    /// Events without any signal in the crystal are skipped.
    pub fn fill(&mut self, map: &ChannelMap, mode: ReadoutMode, event: &Event) {
        let sum: u64 = map
            .channels_of(self.crystal, mode)
            .map(|channel| event.peak_amplitude(channel) as u64)
            .sum();
        if sum > 0 {
            self.histogram.fill(sum as f64);
        }
    }

    pub fn fit<F: PeakFitter>(&self, fitter: &F, policy: &ScanPolicy) -> Option<FitResult> {
        fitter.fit(&self.histogram, PeakModel::Gaussian, None, policy.fit_window)
    }
}

/// Fitted peak of one scan run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanMeasurement {
    pub run: u32,
    pub position: f64,
    pub mean: f64,
    pub mean_error: f64,
    pub sigma: f64,
}

/// Gaussian through the peak means versus position. Its mean is the beam
/// position of maximum response.
pub fn fit_beam_centre(measurements: &[ScanMeasurement], policy: &ScanPolicy) -> Option<FitResult> {
    let points = measurements
        .iter()
        .filter(|m| m.mean_error.is_finite() && m.mean_error > 0.0)
        .map(|m| FitPoint {
            x: m.position,
            y: m.mean,
            sigma: m.mean_error,
        })
        .collect::<Vec<_>>();
    if points.len() < measurements.len() {
        warn!(
            "{} scan point(s) without a usable error are left out of the centre fit",
            measurements.len() - points.len()
        );
    }

    let model = PeakModel::Gaussian;
    let initial = model.initial_guess(&points)?;
    let (low, high) = policy.position_window;
    let width = (high - low).abs().max(f64::EPSILON);
    let bounds = [(0.0, f64::INFINITY), (low, high), (width * 1e-3, width * 100.0)];
    LevenbergMarquardt::default().fit_points(&points, model, initial, &bounds, policy.position_window)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        channel_map::{ConnectorLayout, Wiring},
        waveform::{Waveform, NUM_SAMPLES},
    };

    #[test]
    fn test_fill_skips_empty_events() {
        let mut wiring = Wiring::desy_2025(ConnectorLayout::Interleaved);
        wiring.asic[22] = 0;
        let map = ChannelMap::new(wiring).unwrap();
        let policy = ScanPolicy::default();
        let mode = ReadoutMode::Interleaved16;
        let mut sum = CrystalPeakSum::new(&policy);

        sum.fill(&map, mode, &Event::empty(false));
        assert_eq!(sum.histogram.entries, 0);

        let mut event = Event::empty(false);
        for channel in map.channels_of(policy.crystal, mode) {
            let mut samples = [100; NUM_SAMPLES];
            samples[4] = 350;
            event.adc[channel] = Waveform(samples);
        }
        sum.fill(&map, mode, &event);
        assert_eq!(sum.histogram.entries, 1);
        assert_abs_diff_eq!(sum.histogram.mean().unwrap(), 4000.0, epsilon = 16.0);
    }

    #[test]
    fn test_beam_centre() {
        let policy = ScanPolicy::default();
        let measurements = policy
            .points
            .iter()
            .map(|point| {
                let x = point.position - 0.7;
                ScanMeasurement {
                    run: point.run,
                    position: point.position,
                    mean: 4500.0 * (-0.5 * (x / 6.0).powi(2)).exp(),
                    mean_error: 5.0,
                    sigma: 300.0,
                }
            })
            .collect::<Vec<_>>();

        let fit = fit_beam_centre(&measurements, &policy).unwrap();
        assert_abs_diff_eq!(fit.mean(), 0.7, epsilon = 0.05);
        assert_abs_diff_eq!(fit.sigma(), 6.0, epsilon = 0.2);
    }
}
