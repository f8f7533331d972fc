//! Energy-sum spectra: per SiPM, per crystal, central 3×3 and whole
//! calorimeter, each as a "single" (peak amplitude) and a "full" (windowed
//! sum) spectrum.

use serde::{Deserialize, Serialize};

use crate::{
    channel_map::{ChannelMap, ReadoutMode, NUM_CRYSTALS},
    config::{Binning, SpectraPolicy},
    error::HistogramError,
    fit::{FitResult, PeakFitter, PeakModel},
    histogram::Histogram1D,
};

/// Single and full spectrum of one sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumPair {
    pub single: Histogram1D,
    pub full: Histogram1D,
}

impl SpectrumPair {
    fn new(single: Binning, full: Binning) -> Self {
        Self {
            single: single.histogram(),
            full: full.histogram(),
        }
    }

    fn fill(&mut self, (single, full): (f64, f64)) {
        self.single.fill(single);
        self.full.fill(full);
    }

    fn merge(&mut self, other: &SpectrumPair) -> Result<(), HistogramError> {
        self.single.merge(&other.single)?;
        self.full.merge(&other.full)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrystalSums {
    pub mode: ReadoutMode,
    /// indexed by `crystal * sipms_per_crystal + sipm`
    pub sipm: Vec<SpectrumPair>,
    pub crystal: Vec<SpectrumPair>,
    pub central: SpectrumPair,
    pub calo: SpectrumPair,
    pub events: u64,
}

impl CrystalSums {
    pub fn new(mode: ReadoutMode, policy: &SpectraPolicy) -> Self {
        let n = mode.sipms_per_crystal();
        let crystal = SpectrumPair::new(policy.crystal_single.scaled(n), policy.crystal_full.scaled(n));
        let calo = SpectrumPair::new(policy.calo_single.scaled(n), policy.calo_full.scaled(n));
        Self {
            mode,
            sipm: vec![SpectrumPair::new(policy.sipm_single, policy.sipm_full); NUM_CRYSTALS * n],
            crystal: vec![crystal; NUM_CRYSTALS],
            central: calo.clone(),
            calo,
            events: 0,
        }
    }

    /// Adds one event. `amplitude(channel)` gives the `(single, full)`
    /// amplitude of a channel, raw or calibrated.
    pub fn fill<F>(&mut self, map: &ChannelMap, mut amplitude: F)
    where
        F: FnMut(usize) -> (f64, f64),
    {
        let n = self.mode.sipms_per_crystal();
        let mut central = (0.0, 0.0);
        let mut calo = (0.0, 0.0);

        for crystal in 0..NUM_CRYSTALS {
            let mut sum = (0.0, 0.0);
            for (sipm, channel) in map.channels_of(crystal, self.mode).enumerate() {
                let value = amplitude(channel);
                self.sipm[crystal * n + sipm].fill(value);
                sum.0 += value.0;
                sum.1 += value.1;
            }
            self.crystal[crystal].fill(sum);

            if ChannelMap::is_central(crystal) {
                central.0 += sum.0;
                central.1 += sum.1;
            }
            calo.0 += sum.0;
            calo.1 += sum.1;
        }

        self.central.fill(central);
        self.calo.fill(calo);
        self.events += 1;
    }

    pub fn merge(&mut self, other: &CrystalSums) -> Result<(), HistogramError> {
        if self.mode != other.mode {
            return Err(HistogramError::BinningMismatch {
                ours: format!("{} mode", self.mode),
                theirs: format!("{} mode", other.mode),
            });
        }
        for (ours, theirs) in self.sipm.iter_mut().zip(&other.sipm) {
            ours.merge(theirs)?;
        }
        for (ours, theirs) in self.crystal.iter_mut().zip(&other.crystal) {
            ours.merge(theirs)?;
        }
        self.central.merge(&other.central)?;
        self.calo.merge(&other.calo)?;
        self.events += other.events;
        Ok(())
    }

    /// Fits every spectrum in its window.
    pub fn summarize<F: PeakFitter>(&self, fitter: &F, policy: &SpectraPolicy, map: &ChannelMap) -> SpectraSummary {
        let n = self.mode.sipms_per_crystal();
        let scale = |(low, high): (f64, f64)| (low * n as f64, high * n as f64);
        let fit_pair = |label: String, pair: &SpectrumPair, windows: ((f64, f64), (f64, f64))| {
            [
                PeakSummary::fit(fitter, policy.model, format!("{label} single"), &pair.single, windows.0),
                PeakSummary::fit(fitter, policy.model, format!("{label} full"), &pair.full, windows.1),
            ]
        };

        let sipm = self
            .sipm
            .iter()
            .enumerate()
            .map(|(idx, pair)| {
                let (crystal, sipm) = (idx / n, idx % n);
                let label = format!("crystal {} sipm {sipm}", map.display_id(crystal));
                fit_pair(label, pair, (policy.sipm_single_window, policy.sipm_full_window))
            })
            .collect();
        let crystal = self
            .crystal
            .iter()
            .enumerate()
            .map(|(crystal, pair)| {
                let label = format!("crystal {}", map.display_id(crystal));
                fit_pair(
                    label,
                    pair,
                    (scale(policy.crystal_single_window), scale(policy.crystal_full_window)),
                )
            })
            .collect();

        SpectraSummary {
            sipm,
            crystal,
            central: fit_pair(
                "central 3x3".to_owned(),
                &self.central,
                (policy.central_single_window, policy.central_full_window),
            ),
            calo: fit_pair(
                "calorimeter".to_owned(),
                &self.calo,
                (policy.calo_single_window, policy.calo_full_window),
            ),
        }
    }
}

/// `[single, full]` fits of every spectrum in [`CrystalSums`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpectraSummary {
    pub sipm: Vec<[PeakSummary; 2]>,
    pub crystal: Vec<[PeakSummary; 2]>,
    pub central: [PeakSummary; 2],
    pub calo: [PeakSummary; 2],
}

impl SpectraSummary {
    /// SiPM rows first, then crystals, the central 3×3 and the calorimeter.
    pub fn rows(&self) -> impl Iterator<Item = &PeakSummary> {
        self.sipm
            .iter()
            .chain(&self.crystal)
            .chain([&self.central, &self.calo])
            .flatten()
    }
}

/// Fit outcome of one spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSummary {
    pub label: String,
    pub window: (f64, f64),
    pub fit: Option<FitResult>,
    pub entries_in_range: f64,
}

impl PeakSummary {
    pub const TSV_HEADER: &'static str =
        "label\tmean\tmean_err\tsigma\tsigma_err\tresolution\tresolution_err\tentries";

    pub fn fit<F: PeakFitter>(
        fitter: &F,
        model: PeakModel,
        label: String,
        histogram: &Histogram1D,
        window: (f64, f64),
    ) -> Self {
        Self {
            label,
            window,
            fit: fitter.fit(histogram, model, None, window),
            entries_in_range: histogram.integral_between(window.0, window.1),
        }
    }

    pub fn tsv_row(&self) -> String {
        match &self.fit {
            Some(fit) => {
                let (resolution, resolution_err) = fit.resolution();
                format!(
                    "{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.5}\t{:.5}\t{}",
                    self.label,
                    fit.mean(),
                    fit.mean_error(),
                    fit.sigma(),
                    fit.sigma_error(),
                    resolution,
                    resolution_err,
                    self.entries_in_range
                )
            }
            None => format!("{}\tNaN\tNaN\tNaN\tNaN\tNaN\tNaN\t{}", self.label, self.entries_in_range),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        channel_map::{ConnectorLayout, Wiring},
        fit::LevenbergMarquardt,
    };

    fn map() -> ChannelMap {
        let mut wiring = Wiring::desy_2025(ConnectorLayout::Interleaved);
        wiring.asic[22] = 0;
        ChannelMap::new(wiring).unwrap()
    }

    #[test]
    fn test_binning_scales_with_mode() {
        let policy = SpectraPolicy::default();
        let sums = CrystalSums::new(ReadoutMode::Quadrant4, &policy);
        assert_eq!(sums.sipm.len(), 100);
        assert_eq!(sums.crystal[0].full.axis.high, 10000.0);
        assert_eq!(sums.crystal[0].full.axis.bins, 100);
        assert_eq!(sums.calo.single.axis.high, 4096.0);
    }

    #[test]
    fn test_fill_sums_crystals() {
        let map = map();
        let mode = ReadoutMode::Quadrant4;
        let mut sums = CrystalSums::new(mode, &SpectraPolicy::default());
        sums.fill(&map, |_| (10.0, 30.0));

        assert_eq!(sums.events, 1);
        // 4 SiPMs per crystal
        assert_eq!(sums.crystal[12].single.mean(), Some(sums.crystal[12].single.axis.center(10)));
        assert_eq!(sums.central.single.entries, 1);
        let central_bin = sums.central.single.axis.find_bin(9.0 * 40.0).unwrap();
        assert_eq!(sums.central.single.counts[central_bin], 1.0);
        let calo_bin = sums.calo.full.axis.find_bin(25.0 * 120.0).unwrap();
        assert_eq!(sums.calo.full.counts[calo_bin], 1.0);
    }

    #[test]
    fn test_merge() {
        let map = map();
        let policy = SpectraPolicy::default();
        let mut first = CrystalSums::new(ReadoutMode::Single, &policy);
        let mut second = first.clone();
        first.fill(&map, |_| (10.0, 20.0));
        second.fill(&map, |_| (10.0, 20.0));
        second.fill(&map, |_| (30.0, 40.0));
        first.merge(&second).unwrap();
        assert_eq!(first.events, 3);
        assert_eq!(first.crystal[0].single.entries, 3);

        let other_mode = CrystalSums::new(ReadoutMode::Quadrant4, &policy);
        assert!(first.merge(&other_mode).is_err());
    }

    #[test]
    fn test_summarize_fits_sipm_peak() {
        let map = map();
        let policy = SpectraPolicy::default();
        let mode = ReadoutMode::Single;
        let mut sums = CrystalSums::new(mode, &policy);
        for i in 0..2000 {
            // deterministic spread around 500
            let value = 500.0 + 60.0 * ((i as f64) * 0.61803).sin();
            sums.fill(&map, |_| (value, 3.0 * value));
        }

        let summary = sums.summarize(&LevenbergMarquardt::default(), &policy, &map);
        assert_eq!(summary.rows().count(), 2 * (25 + 25 + 2));
        let first = &summary.sipm[0][0];
        assert!(first.label.ends_with("sipm 0 single"));
        let fit = first.fit.as_ref().unwrap();
        assert_abs_diff_eq!(fit.mean(), 500.0, epsilon = 20.0);
        assert_eq!(first.entries_in_range, 2000.0);
        assert!(first.tsv_row().starts_with(&first.label));
        assert_eq!(summary.calo[1].label, "calorimeter full");
        assert_eq!(PeakSummary::TSV_HEADER.split('\t').count(), first.tsv_row().split('\t').count());
    }
}
