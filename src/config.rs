//! Analysis configuration.
//!
//! Every threshold of the analysis lives here under a name. The defaults
//! are the values the test-beam analysis used; where different scripts
//! disagreed, the alternative is noted on the field. Configs are read from
//! YAML and any missing field falls back to its default.

use std::{ops::Range, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    channel_map::{ConnectorLayout, ReadoutMode},
    error::ConfigError,
    fit::PeakModel,
    waveform::DEFAULT_SUM_WINDOW,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub bins: usize,
    pub low: f64,
    pub high: f64,
}

impl Binning {
    pub const fn new(bins: usize, low: f64, high: f64) -> Self {
        Self { bins, low, high }
    }

    pub fn histogram(&self) -> crate::histogram::Histogram1D {
        crate::histogram::Histogram1D::new(self.bins, self.low, self.high)
    }

    pub fn axis(&self) -> crate::histogram::Axis {
        crate::histogram::Axis::new(self.bins, self.low, self.high)
    }

    /// Same range and bin density multiplied by `factor`.
    pub fn scaled(&self, factor: usize) -> Self {
        Self::new(self.bins * factor, self.low, self.high * factor as f64)
    }

    pub fn check(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.bins == 0 || !(self.low < self.high) {
            return Err(ConfigError::BadBinning {
                name,
                bins: self.bins,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionPolicy {
    /// samples summed for the full-charge estimate
    pub sum_window: Range<usize>,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        Self {
            sum_window: DEFAULT_SUM_WINDOW,
        }
    }
}

/// Gain normalisation derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainPolicy {
    pub binning: Binning,
    pub model: PeakModel,
    /// per-channel fit window; crystal aggregates use `[200, 900]` scaled by
    /// the SiPM count instead
    pub fit_window: (f64, f64),
    /// peak position every channel is normalised to
    pub target: f64,
    /// fitted means at or below this give a gain of 1
    pub min_mean: f64,
}

impl Default for GainPolicy {
    fn default() -> Self {
        Self {
            binning: Binning::new(256, 0.0, 1024.0),
            model: PeakModel::Gaussian,
            fit_window: (175.0, 900.0),
            target: 400.0,
            min_mean: 1.0,
        }
    }
}

/// ADC↔ToT linear conversion derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotPolicy {
    /// only events with a peak ToT strictly above this are filled
    pub tot_min: u32,
    /// exclusive ADC band where the channel is linear but ToT is active;
    /// the correlation plots of an earlier analysis used (150, 950)
    pub adc_band: (f64, f64),
    /// inclusive ADC range of the line fit
    pub fit_window: (f64, f64),
    pub adc_binning: Binning,
    pub tot_binning: Binning,
}

impl Default for TotPolicy {
    fn default() -> Self {
        Self {
            tot_min: 5,
            adc_band: (200.0, 950.0),
            fit_window: (700.0, 900.0),
            adc_binning: Binning::new(128, 0.0, 1024.0),
            tot_binning: Binning::new(128, 0.0, 4096.0),
        }
    }
}

/// Calibration application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyPolicy {
    /// peaks at or above this use the ToT path
    pub saturation: u32,
    /// ToT peaks below this are not recoverable
    pub tot_valid_min: u32,
    /// slopes with a smaller magnitude are treated as missing
    pub min_slope: f64,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            saturation: 700,
            tot_valid_min: 200,
            min_slope: 1e-6,
        }
    }
}

/// Binning and fit windows of the energy-sum spectra. Crystal and
/// calorimeter binnings and the crystal windows are given per SiPM and get
/// multiplied by the SiPM count of the readout mode; the central-9 and
/// full-calorimeter windows are absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectraPolicy {
    pub model: PeakModel,

    pub sipm_single: Binning,
    pub sipm_full: Binning,
    pub crystal_single: Binning,
    pub crystal_full: Binning,
    pub calo_single: Binning,
    pub calo_full: Binning,

    pub sipm_single_window: (f64, f64),
    pub sipm_full_window: (f64, f64),
    pub crystal_single_window: (f64, f64),
    pub crystal_full_window: (f64, f64),
    pub central_single_window: (f64, f64),
    pub central_full_window: (f64, f64),
    pub calo_single_window: (f64, f64),
    pub calo_full_window: (f64, f64),
}

impl Default for SpectraPolicy {
    fn default() -> Self {
        Self {
            model: PeakModel::Gaussian,
            sipm_single: Binning::new(256, 0.0, 1024.0),
            sipm_full: Binning::new(256, 0.0, 3500.0),
            crystal_single: Binning::new(256, 0.0, 1024.0),
            crystal_full: Binning::new(25, 0.0, 2500.0),
            calo_single: Binning::new(256, 0.0, 1024.0),
            calo_full: Binning::new(25, 0.0, 4000.0),
            sipm_single_window: (200.0, 900.0),
            sipm_full_window: (600.0, 3500.0),
            crystal_single_window: (200.0, 900.0),
            crystal_full_window: (1150.0, 1800.0),
            central_single_window: (6000.0, 10000.0),
            central_full_window: (25000.0, 38000.0),
            calo_single_window: (8000.0, 16000.0),
            calo_full_window: (30000.0, 45000.0),
        }
    }
}

/// One run of a position scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    pub run: u32,
    /// horizontal table position, mm
    pub position: f64,
}

/// Horizontal beam scan across one crystal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    pub points: Vec<ScanPoint>,
    /// crystal whose SiPM peak sum is followed
    pub crystal: usize,
    pub binning: Binning,
    pub fit_window: (f64, f64),
    /// window of the Gaussian fit of mean versus position
    pub position_window: (f64, f64),
}

impl Default for ScanPolicy {
    fn default() -> Self {
        let points = [(39, -4.0), (38, -2.0), (37, 0.0), (40, 2.0), (41, 4.0)]
            .into_iter()
            .map(|(run, position)| ScanPoint { run, position })
            .collect();
        Self {
            points,
            crystal: 12,
            binning: Binning::new(500, 0.0, 8000.0),
            fit_window: (3500.0, 5000.0),
            position_window: (-4.0, 4.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub mode: ReadoutMode,
    pub layout: ConnectorLayout,
    /// refuse to run on a wiring with colliding channels
    pub strict_wiring: bool,
    /// file name of a run under the data root; `{run}` is replaced by the
    /// zero-padded run number
    pub run_file_pattern: String,
    pub extraction: ExtractionPolicy,
    pub gain: GainPolicy,
    pub tot: TotPolicy,
    pub apply: ApplyPolicy,
    pub spectra: SpectraPolicy,
    pub scan: ScanPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: ReadoutMode::default(),
            layout: ConnectorLayout::default(),
            strict_wiring: false,
            run_file_pattern: "Run{run}.bin".to_owned(),
            extraction: ExtractionPolicy::default(),
            gain: GainPolicy::default(),
            tot: TotPolicy::default(),
            apply: ApplyPolicy::default(),
            spectra: SpectraPolicy::default(),
            scan: ScanPolicy::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(file).map_err(|err| ConfigError::Parse {
            file: path.display().to_string(),
            err,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects binnings no histogram can be built from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let spectra = &self.spectra;
        let binnings = [
            ("gain.binning", &self.gain.binning),
            ("tot.adc_binning", &self.tot.adc_binning),
            ("tot.tot_binning", &self.tot.tot_binning),
            ("spectra.sipm_single", &spectra.sipm_single),
            ("spectra.sipm_full", &spectra.sipm_full),
            ("spectra.crystal_single", &spectra.crystal_single),
            ("spectra.crystal_full", &spectra.crystal_full),
            ("spectra.calo_single", &spectra.calo_single),
            ("spectra.calo_full", &spectra.calo_full),
            ("scan.binning", &self.scan.binning),
        ];
        binnings
            .into_iter()
            .try_for_each(|(name, binning)| binning.check(name))
    }

    /// Defaults when no config file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn run_file_name(&self, run: u32) -> String {
        self.run_file_pattern.replace("{run}", &format!("{run:03}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
mode: 4x4
layout: sequential
apply:
  saturation: 650
tot:
  adc_band: [150.0, 950.0]
gain:
  model: crystal_ball
scan:
  points:
    - { run: 7, position: -1.5 }
    - { run: 8, position: 1.5 }
";
        let config: AnalysisConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, ReadoutMode::Quadrant4);
        assert_eq!(config.layout, ConnectorLayout::Sequential);
        assert_eq!(config.apply.saturation, 650);
        assert_eq!(config.apply.tot_valid_min, 200);
        assert_eq!(config.tot.adc_band, (150.0, 950.0));
        assert_eq!(config.tot.tot_min, 5);
        assert_eq!(config.gain.model, PeakModel::CrystalBall);
        assert_eq!(config.gain.target, 400.0);
        assert_eq!(config.extraction.sum_window, 2..10);
        assert_eq!(config.scan.points.len(), 2);
        assert_eq!(config.scan.points[1], ScanPoint { run: 8, position: 1.5 });
        assert_eq!(config.scan.crystal, 12);
    }

    #[test]
    fn test_run_file_name() {
        let config = AnalysisConfig::default();
        assert_eq!(config.run_file_name(7), "Run007.bin");
        assert_eq!(config.run_file_name(1234), "Run1234.bin");
    }

    #[test]
    fn test_degenerate_binning_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("gain:\n  binning: { bins: 0, low: 0.0, high: 1024.0 }\n", "gain.binning"),
            ("tot:\n  tot_binning: { bins: 128, low: 4096.0, high: 4096.0 }\n", "tot.tot_binning"),
            ("scan:\n  binning: { bins: 10, low: 100.0, high: 0.0 }\n", "scan.binning"),
        ];
        for (idx, (yaml, field)) in cases.into_iter().enumerate() {
            let path = dir.path().join(format!("config{idx}.yaml"));
            std::fs::write(&path, yaml).unwrap();
            match AnalysisConfig::load(&path) {
                Err(ConfigError::BadBinning { name, .. }) => assert_eq!(name, field),
                other => panic!("{field}: expected a binning error, got {other:?}"),
            }
        }

        let path = dir.path().join("good.yaml");
        std::fs::write(&path, "mode: 16p\n").unwrap();
        assert!(AnalysisConfig::load(&path).is_ok());
        assert!(AnalysisConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scaled_binning() {
        let binning = Binning::new(25, 0.0, 2500.0).scaled(16);
        assert_eq!(binning, Binning::new(400, 0.0, 40000.0));
    }
}
