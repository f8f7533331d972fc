//! Turning accumulated per-channel histograms into calibration tables.

use log::{debug, info, warn};

use super::{CalibrationEntry, GainTable, TableMetadata, TotConversionTable};
use crate::{
    config::{GainPolicy, TotPolicy},
    fit::{fit_line, FitResult, LineFit, PeakFitter},
    histogram::{Histogram1D, Histogram2D},
};

/// Gain table together with the fits it was computed from, for reports.
#[derive(Debug, Clone)]
pub struct GainDerivation {
    pub table: GainTable,
    pub fits: Vec<Option<FitResult>>,
}

#[derive(Debug, Clone)]
pub struct TotDerivation {
    pub table: TotConversionTable,
    pub fits: Vec<Option<LineFit>>,
}

impl TotDerivation {
    /// Channels whose fitted ToT falls with the ADC. Such a conversion is
    /// kept but recovers negative amplitudes.
    pub fn negative_slopes(&self) -> Vec<usize> {
        self.fits
            .iter()
            .enumerate()
            .filter(|(_, fit)| fit.as_ref().is_some_and(|line| line.slope < 0.0))
            .map(|(channel, _)| channel)
            .collect()
    }
}

/// `target / mean` with the error scaled from the mean's error. Falls back
/// to the identity when there is no usable peak: no fit, a fit that did not
/// converge, a mean at or below `min_mean` or an error that is not finite.
pub fn gain_from_fit(fit: Option<&FitResult>, policy: &GainPolicy) -> CalibrationEntry {
    let Some(fit) = fit.filter(|fit| fit.converged) else {
        return CalibrationEntry::IDENTITY;
    };
    let mean = fit.mean();
    if !mean.is_finite() || mean <= policy.min_mean {
        return CalibrationEntry::IDENTITY;
    }

    let gain = policy.target / mean;
    let error = gain * fit.mean_error() / mean;
    if !error.is_finite() {
        return CalibrationEntry::IDENTITY;
    }
    CalibrationEntry::measured(gain, error)
}

/// Fits the peak-amplitude spectrum of every listed channel and normalises
/// its peak to `policy.target`. Channels not listed keep gain 1.
pub fn derive_gains<F: PeakFitter>(
    fitter: &F,
    peaks: &[Histogram1D],
    channels: &[usize],
    policy: &GainPolicy,
    metadata: TableMetadata,
) -> GainDerivation {
    let mut table = GainTable::new(metadata, policy.clone());
    let mut fits = vec![None; peaks.len()];

    for &channel in channels {
        let Some(histogram) = peaks.get(channel) else {
            continue;
        };
        let fit = fitter.fit(histogram, policy.model, None, policy.fit_window);
        let entry = gain_from_fit(fit.as_ref(), policy);

        match &fit {
            Some(fit) => debug!(
                "channel {channel}: mean {:.1} ± {:.2}, gain {:.4} ± {:.4}",
                fit.mean(),
                fit.mean_error(),
                entry.value,
                entry.error
            ),
            None => debug!(
                "channel {channel}: no peak in {:?} ({} entries), gain 1",
                policy.fit_window, histogram.entries
            ),
        }

        table.gains[channel] = entry;
        fits[channel] = fit;
    }

    info!(
        "derived gains for {}/{} channels",
        table.valid_channels(),
        channels.len()
    );
    GainDerivation { table, fits }
}

/// Empty (peak ADC, peak ToT) correlation histogram with the policy binning.
pub fn correlation_histogram(policy: &TotPolicy) -> Histogram2D {
    Histogram2D::new(policy.adc_binning.axis(), policy.tot_binning.axis())
}

/// Whether an event of a channel enters the ADC↔ToT correlation: ToT must
/// have fired and the ADC must sit strictly inside the linear band.
pub fn in_correlation_band(policy: &TotPolicy, peak: u32, tot: u32) -> bool {
    let peak = peak as f64;
    tot > policy.tot_min && policy.adc_band.0 < peak && peak < policy.adc_band.1
}

/// Straight line through the ToT profile of one channel.
pub fn fit_conversion(correlation: &Histogram2D, policy: &TotPolicy) -> Option<LineFit> {
    let profile = correlation
        .profile_x()
        .into_iter()
        .map(|point| (point.x, point.mean))
        .collect::<Vec<_>>();
    fit_line(&profile, policy.fit_window)
}

/// Fits `ToT = slope · ADC + intercept` for every channel that has a
/// correlation histogram. Channels without enough profile points keep a
/// zero, invalid entry.
pub fn derive_tot_conversion(
    correlations: &[Option<Histogram2D>],
    policy: &TotPolicy,
    metadata: TableMetadata,
) -> TotDerivation {
    let mut table = TotConversionTable::new(metadata, policy.clone());
    let mut fits = vec![None; correlations.len()];

    for (channel, correlation) in correlations.iter().enumerate() {
        let Some(correlation) = correlation else {
            continue;
        };
        let Some(line) = fit_conversion(correlation, policy) else {
            debug!(
                "channel {channel}: too few profile points in {:?} ({} entries)",
                policy.fit_window, correlation.entries
            );
            continue;
        };
        if !(line.slope.is_finite() && line.intercept.is_finite()) {
            continue;
        }

        if line.slope < 0.0 {
            warn!(
                "channel {channel}: ToT falls with ADC (tot = {:.3}·adc + {:.1}), recovered amplitudes will be negative",
                line.slope, line.intercept
            );
        } else {
            debug!(
                "channel {channel}: tot = {:.3}·adc + {:.1}",
                line.slope, line.intercept
            );
        }
        if channel < table.slopes.len() {
            table.slopes[channel] = CalibrationEntry::measured(line.slope, line.slope_error);
            table.intercepts[channel] =
                CalibrationEntry::measured(line.intercept, line.intercept_error);
        }
        fits[channel] = Some(line);
    }

    info!(
        "derived ToT conversion for {}/{} channels",
        table.valid_channels(),
        correlations.iter().flatten().count()
    );
    TotDerivation { table, fits }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        channel_map::{ConnectorLayout, ReadoutMode, NUM_CHANNELS},
        fit::{LevenbergMarquardt, PeakModel},
    };

    fn metadata() -> TableMetadata {
        TableMetadata::new(1, ReadoutMode::Interleaved16, ConnectorLayout::Interleaved)
    }

    fn fit_with_mean(mean: f64, error: f64) -> FitResult {
        FitResult {
            model: PeakModel::Gaussian,
            window: (175.0, 900.0),
            params: vec![100.0, mean, 30.0],
            errors: vec![1.0, error, 0.5],
            chi2: 1.0,
            ndf: 1,
            converged: true,
        }
    }

    #[test]
    fn test_gain_from_fit() {
        let policy = GainPolicy::default();
        let entry = gain_from_fit(Some(&fit_with_mean(500.0, 5.0)), &policy);
        assert!(entry.valid);
        assert_abs_diff_eq!(entry.value, 0.8);
        assert_abs_diff_eq!(entry.error, 0.8 * 0.01);
    }

    #[test]
    fn test_gain_fallbacks() {
        let policy = GainPolicy::default();
        assert_eq!(gain_from_fit(None, &policy), CalibrationEntry::IDENTITY);
        assert_eq!(
            gain_from_fit(Some(&fit_with_mean(1.0, 0.1)), &policy),
            CalibrationEntry::IDENTITY
        );
        assert_eq!(
            gain_from_fit(Some(&fit_with_mean(-20.0, 0.1)), &policy),
            CalibrationEntry::IDENTITY
        );
        assert_eq!(
            gain_from_fit(Some(&fit_with_mean(300.0, f64::INFINITY)), &policy),
            CalibrationEntry::IDENTITY
        );
        assert_eq!(
            gain_from_fit(Some(&fit_with_mean(300.0, f64::NAN)), &policy),
            CalibrationEntry::IDENTITY
        );
        let stalled = FitResult {
            converged: false,
            ..fit_with_mean(500.0, 5.0)
        };
        assert_eq!(gain_from_fit(Some(&stalled), &policy), CalibrationEntry::IDENTITY);
    }

    /// Hands out a prepared fit per histogram, keyed by its entry count.
    struct FixedFits(Vec<(u64, FitResult)>);

    impl PeakFitter for FixedFits {
        fn fit(
            &self,
            histogram: &Histogram1D,
            _model: PeakModel,
            _bounds: Option<&[(f64, f64)]>,
            _window: (f64, f64),
        ) -> Option<FitResult> {
            self.0
                .iter()
                .find(|(entries, _)| *entries == histogram.entries)
                .map(|(_, fit)| fit.clone())
        }
    }

    #[test]
    fn test_derive_gains_degenerate_fits_give_identity() {
        let policy = GainPolicy::default();
        let mut peaks = vec![policy.binning.histogram(); NUM_CHANNELS];
        for (channel, entries) in [(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)] {
            for _ in 0..entries {
                peaks[channel].fill(500.0);
            }
        }
        let fitter = FixedFits(vec![
            (1, fit_with_mean(1.0, 0.1)),
            (2, fit_with_mean(0.5, 0.1)),
            (
                3,
                FitResult {
                    converged: false,
                    ..fit_with_mean(500.0, 5.0)
                },
            ),
            (4, fit_with_mean(500.0, f64::NAN)),
            (5, fit_with_mean(500.0, f64::INFINITY)),
        ]);

        let channels = [0, 1, 2, 3, 4, 5];
        let derivation = derive_gains(&fitter, &peaks, &channels, &policy, metadata());
        for channel in channels {
            assert_eq!(derivation.table.gains[channel], CalibrationEntry::IDENTITY, "channel {channel}");
        }
        assert_eq!(derivation.table.valid_channels(), 0);
    }

    #[test]
    fn test_derive_gains_without_peak_in_window_gives_identity() {
        let policy = GainPolicy::default();
        let mut peaks = vec![policy.binning.histogram(); NUM_CHANNELS];
        // everything at or below a mean of 1, far under the fit window
        peaks[1].fill_weighted(0.5, 1000.0);

        let derivation = derive_gains(
            &LevenbergMarquardt::default(),
            &peaks,
            &[1, 2],
            &policy,
            metadata(),
        );
        assert!(derivation.fits[1].is_none());
        assert_eq!(derivation.table.gains[1], CalibrationEntry::IDENTITY);
        // empty spectrum
        assert_eq!(derivation.table.gains[2], CalibrationEntry::IDENTITY);
    }

    #[test]
    fn test_correlation_band_is_exclusive() {
        let policy = TotPolicy::default();
        assert!(in_correlation_band(&policy, 800, 6));
        assert!(!in_correlation_band(&policy, 800, 5));
        assert!(!in_correlation_band(&policy, 200, 900));
        assert!(!in_correlation_band(&policy, 950, 900));
        assert!(in_correlation_band(&policy, 201, 900));
    }

    fn exact_correlation(policy: &TotPolicy, tot: impl Fn(f64) -> f64) -> Histogram2D {
        let mut correlation = correlation_histogram(policy);
        for adc in 0..1024 {
            if in_correlation_band(policy, adc, 10) {
                correlation.fill(adc as f64, tot(adc as f64));
            }
        }
        correlation
    }

    #[test]
    fn test_derive_tot_conversion() {
        let policy = TotPolicy::default();
        let correlation = exact_correlation(&policy, |adc| 2.0 * adc + 100.0);

        let mut correlations = vec![None; NUM_CHANNELS];
        correlations[10] = Some(correlation);
        correlations[11] = Some(correlation_histogram(&policy));

        let derivation = derive_tot_conversion(&correlations, &policy, metadata());
        let (slope, intercept) = derivation.table.conversion(10).unwrap();
        // y is binned at 32 counts, so the profile is a staircase
        assert_abs_diff_eq!(slope, 2.0, epsilon = 0.02);
        assert_abs_diff_eq!(intercept, 100.0, epsilon = 5.0);
        for adc in [400.0, 800.0, 1200.0] {
            let recovered = (2.0 * adc + 100.0 - intercept) / slope;
            assert_abs_diff_eq!(recovered, adc, epsilon = 2.0);
        }
        assert!(derivation.fits[10].is_some());
        assert_eq!(derivation.table.conversion(11), None);
        assert_eq!(derivation.table.valid_channels(), 1);
        assert!(derivation.negative_slopes().is_empty());
    }

    #[test]
    fn test_negative_slope_is_kept_and_reported() {
        let policy = TotPolicy::default();
        let mut correlations = vec![None; NUM_CHANNELS];
        correlations[5] = Some(exact_correlation(&policy, |adc| 3000.0 - 2.0 * adc));

        let derivation = derive_tot_conversion(&correlations, &policy, metadata());
        let (slope, _) = derivation.table.conversion(5).unwrap();
        assert_abs_diff_eq!(slope, -2.0, epsilon = 0.02);
        assert_eq!(derivation.negative_slopes(), [5]);
    }
}
