//! One pass over a run, folding every event into the histograms all
//! derivations and reports start from.

use std::path::{Path, PathBuf};

use cached::IOCachedAsync;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    cache::CacacheBackend,
    calibration::derive::{correlation_histogram, in_correlation_band},
    channel_map::{ChannelMap, NUM_CHANNELS},
    config::AnalysisConfig,
    error::{HistogramError, StorageError},
    histogram::{Histogram1D, Histogram2D},
    spectra::CrystalSums,
    storage::RunReader,
    waveform::Event,
};

/// Accumulated histograms of one run (or of several merged runs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFeatures {
    pub run: u32,
    pub events: u64,
    /// peak amplitude per channel
    pub peak: Vec<Histogram1D>,
    /// (peak ADC, peak ToT) per channel, created on the first accepted event
    pub adc_tot: Vec<Option<Histogram2D>>,
    pub spectra: CrystalSums,
    active: Vec<usize>,
}

impl RunFeatures {
    pub fn new(run: u32, map: &ChannelMap, config: &AnalysisConfig) -> Self {
        Self {
            run,
            events: 0,
            peak: vec![config.gain.binning.histogram(); NUM_CHANNELS],
            adc_tot: vec![None; NUM_CHANNELS],
            spectra: CrystalSums::new(config.mode, &config.spectra),
            active: map.active_channels(config.mode),
        }
    }

    /// Channels read out in the configured mode.
    pub fn active_channels(&self) -> &[usize] {
        &self.active
    }

    pub fn fill(&mut self, map: &ChannelMap, config: &AnalysisConfig, event: &Event) {
        for &channel in &self.active {
            let peak = event.peak_amplitude(channel);
            self.peak[channel].fill(peak as f64);

            let tot = event.peak_tot(channel);
            if in_correlation_band(&config.tot, peak, tot) {
                self.adc_tot[channel]
                    .get_or_insert_with(|| correlation_histogram(&config.tot))
                    .fill(peak as f64, tot as f64);
            }
        }

        let window = &config.extraction.sum_window;
        self.spectra.fill(map, |channel| {
            (
                event.peak_amplitude(channel) as f64,
                event.windowed_sum(channel, window.clone()),
            )
        });
        self.events += 1;
    }

    pub fn merge(&mut self, other: &RunFeatures) -> Result<(), HistogramError> {
        for (ours, theirs) in self.peak.iter_mut().zip(&other.peak) {
            ours.merge(theirs)?;
        }
        for (ours, theirs) in self.adc_tot.iter_mut().zip(&other.adc_tot) {
            match (ours.as_mut(), theirs) {
                (Some(ours), Some(theirs)) => ours.merge(theirs)?,
                (None, Some(theirs)) => *ours = Some(theirs.clone()),
                (_, None) => {}
            }
        }
        self.spectra.merge(&other.spectra)?;
        self.events += other.events;
        Ok(())
    }
}

pub fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template("[{elapsed_precise}] {bar} {pos:>7}/{len:7} {msg}") {
        pb.set_style(style);
    }
    pb
}

/// Reads a run file and accumulates all of its events.
pub fn accumulate_run(path: &Path, map: &ChannelMap, config: &AnalysisConfig) -> Result<RunFeatures, StorageError> {
    let reader = RunReader::open(path)?;
    let header = *reader.header();
    let mut features = RunFeatures::new(header.run, map, config);

    let pb = progress_bar(header.events);
    pb.set_message(format!("run {:03}", header.run));
    for event in reader {
        features.fill(map, config, &event?);
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!("run {:03}: accumulated {} events", header.run, features.events);
    Ok(features)
}

pub type FeatureCache = CacacheBackend<String, RunFeatures>;

/// Feature cache under `root`; with `refresh` off every lookup misses and
/// the run is accumulated again.
pub fn open_cache(root: PathBuf, refresh: bool) -> FeatureCache {
    let mut cache = FeatureCache::new(root);
    cache.cache_set_refresh(refresh);
    cache
}

fn cache_key(path: &Path, map: &ChannelMap, config: &AnalysisConfig) -> String {
    format!(
        "{}|{:?}|{:?}|{:?}|{:?}|{:?}|{:?}",
        path.display(),
        config.mode,
        map.wiring(),
        config.extraction,
        config.gain.binning,
        config.tot,
        config.spectra
    )
}

/// [`accumulate_run`] through the on-disk cache. The key covers the run
/// path, the wiring and every setting that changes the histograms.
pub async fn get_run_features(
    cache: &FeatureCache,
    path: &Path,
    map: &ChannelMap,
    config: &AnalysisConfig,
) -> eyre::Result<RunFeatures> {
    let key = cache_key(path, map, config);
    if let Some(features) = cache.cache_get(&key).await? {
        info!("run features for {} loaded from cache", path.display());
        return Ok(features);
    }

    let features = {
        let (path, map, config): (PathBuf, _, _) = (path.to_owned(), map.clone(), config.clone());
        tokio::task::spawn_blocking(move || accumulate_run(&path, &map, &config)).await??
    };
    cache.cache_set(key, features.clone()).await?;
    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel_map::{ConnectorLayout, ReadoutMode, Wiring},
        storage::write_run,
        waveform::{Waveform, NUM_SAMPLES},
    };

    fn map() -> ChannelMap {
        let mut wiring = Wiring::desy_2025(ConnectorLayout::Interleaved);
        wiring.asic[22] = 0;
        ChannelMap::new(wiring).unwrap()
    }

    fn event(peak: u32, tot: u32) -> Event {
        let mut event = Event::empty(false);
        for channel in 0..NUM_CHANNELS {
            let mut adc = [50; NUM_SAMPLES];
            adc[4] = 50 + peak;
            event.adc[channel] = Waveform(adc);
            let mut tot_samples = [0; NUM_SAMPLES];
            tot_samples[5] = tot;
            event.tot[channel] = Waveform(tot_samples);
        }
        event
    }

    #[test]
    fn test_fill_only_active_channels() {
        let map = map();
        let config = AnalysisConfig {
            mode: ReadoutMode::Single,
            ..Default::default()
        };
        let mut features = RunFeatures::new(1, &map, &config);
        features.fill(&map, &config, &event(300, 0));
        features.fill(&map, &config, &event(800, 1700));

        assert_eq!(features.active_channels().len(), 25);
        let active = features.active_channels()[0];
        assert_eq!(features.peak[active].entries, 2);
        let inactive = (0..NUM_CHANNELS).find(|c| !features.active_channels().contains(c)).unwrap();
        assert_eq!(features.peak[inactive].entries, 0);

        // only the 800/1700 event lies in the correlation band
        assert_eq!(features.adc_tot[active].as_ref().unwrap().entries, 1);
        assert!(features.adc_tot[inactive].is_none());
        assert_eq!(features.spectra.events, 2);
    }

    #[test]
    fn test_merge_creates_missing_correlations() {
        let map = map();
        let config = AnalysisConfig::default();
        let mut first = RunFeatures::new(1, &map, &config);
        first.fill(&map, &config, &event(300, 0));
        let mut second = RunFeatures::new(2, &map, &config);
        second.fill(&map, &config, &event(800, 1700));

        first.merge(&second).unwrap();
        assert_eq!(first.events, 2);
        let active = first.active_channels()[0];
        assert_eq!(first.peak[active].entries, 2);
        assert!(first.adc_tot[active].is_some());
    }

    #[tokio::test]
    async fn test_cached_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Run004.bin");
        write_run(&path, 4, &[event(300, 0), event(500, 0), event(800, 1700)]).unwrap();

        let map = map();
        let config = AnalysisConfig::default();
        let cache = open_cache(dir.path().join("cache"), true);

        let computed = get_run_features(&cache, &path, &map, &config).await.unwrap();
        assert_eq!(computed.run, 4);
        assert_eq!(computed.events, 3);

        std::fs::remove_file(&path).unwrap();
        let cached = get_run_features(&cache, &path, &map, &config).await.unwrap();
        assert_eq!(cached, computed);

        let other = AnalysisConfig {
            mode: ReadoutMode::Quadrant4,
            ..Default::default()
        };
        assert!(get_run_features(&cache, &path, &map, &other).await.is_err());
    }
}
