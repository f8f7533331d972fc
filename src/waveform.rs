//! Reduction of a 20-sample waveform into calibration features.
//!
//! Baseline is sample 0. All functions are total: unsigned samples below the
//! baseline contribute zero instead of wrapping.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::channel_map::NUM_CHANNELS;

pub const NUM_SAMPLES: usize = 20;

/// Post-trigger window used for the full-charge estimate.
pub const DEFAULT_SUM_WINDOW: Range<usize> = 2..10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Waveform(pub [u32; NUM_SAMPLES]);

impl From<[u32; NUM_SAMPLES]> for Waveform {
    fn from(samples: [u32; NUM_SAMPLES]) -> Self {
        Self(samples)
    }
}

/// Sample where a ToT/ToA marker fired and the ADC amplitude there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedSample {
    /// last marked sample, 0 when nothing is marked
    pub sample: usize,
    /// number of samples carrying a marker
    pub marks: usize,
    pub amplitude: u32,
}

impl Waveform {
    pub fn baseline(&self) -> u32 {
        self.0[0]
    }

    fn subtracted(&self) -> impl Iterator<Item = u32> + '_ {
        let baseline = self.baseline();
        self.0.iter().map(move |sample| sample.saturating_sub(baseline))
    }

    /// Maximum of `sample[i] - sample[0]`, never negative.
    pub fn peak_amplitude(&self) -> u32 {
        self.subtracted().max().unwrap_or(0)
    }

    /// Index of the first sample reaching [`Waveform::peak_amplitude`].
    pub fn peak_sample(&self) -> usize {
        let peak = self.peak_amplitude();
        self.subtracted().position(|amp| amp == peak).unwrap_or(0)
    }

    /// Sum of the baseline-subtracted samples in `window`, each clipped at
    /// zero. The window is clamped to the waveform length.
    pub fn windowed_sum(&self, window: Range<usize>) -> f64 {
        let end = window.end.min(NUM_SAMPLES);
        let start = window.start.min(end);
        self.subtracted()
            .skip(start)
            .take(end - start)
            .map(f64::from)
            .sum()
    }

    /// Maximum sample without baseline subtraction. For ToT arrays this is
    /// the peak ToT count.
    pub fn raw_peak(&self) -> u32 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    pub fn peak_tot(&self) -> u32 {
        self.raw_peak()
    }
}

/// Locates the last sample where `marker` is non-zero and reads the
/// baseline-subtracted ADC value at that position. A marker found only at
/// sample 0 (or not at all) gives amplitude 0.
pub fn decode_marked_sample(adc: &Waveform, marker: &Waveform) -> MarkedSample {
    let marked = marker
        .0
        .iter()
        .enumerate()
        .filter(|&(_, &value)| value > 0)
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>();

    let sample = marked.last().copied().unwrap_or(0);
    let amplitude = if sample == 0 {
        0
    } else {
        adc.0[sample].saturating_sub(adc.baseline())
    };

    MarkedSample {
        sample,
        marks: marked.len(),
        amplitude,
    }
}

/// All waveforms of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub adc: Vec<Waveform>,
    pub tot: Vec<Waveform>,
    /// decoded only for diagnostics
    pub toa: Option<Vec<Waveform>>,
}

impl Event {
    pub fn empty(with_toa: bool) -> Self {
        Self {
            adc: vec![Waveform::default(); NUM_CHANNELS],
            tot: vec![Waveform::default(); NUM_CHANNELS],
            toa: with_toa.then(|| vec![Waveform::default(); NUM_CHANNELS]),
        }
    }

    pub fn peak_amplitude(&self, channel: usize) -> u32 {
        self.adc[channel].peak_amplitude()
    }

    pub fn windowed_sum(&self, channel: usize, window: Range<usize>) -> f64 {
        self.adc[channel].windowed_sum(window)
    }

    pub fn peak_tot(&self, channel: usize) -> u32 {
        self.tot[channel].peak_tot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(offset: u32, peak_at: usize, height: u32) -> Waveform {
        let mut samples = [offset; NUM_SAMPLES];
        samples[peak_at] += height;
        Waveform(samples)
    }

    #[test]
    fn test_baseline_invariance() {
        let shifted = pulse(50, 6, 250);
        let plain = pulse(0, 6, 250);
        assert_eq!(shifted.peak_amplitude(), 250);
        assert_eq!(plain.peak_amplitude(), 250);
        assert_eq!(shifted.peak_sample(), 6);
    }

    #[test]
    fn test_never_negative() {
        // everything below the baseline
        let mut samples = [10; NUM_SAMPLES];
        samples[0] = 900;
        let wf = Waveform(samples);
        assert_eq!(wf.peak_amplitude(), 0);
        assert_eq!(wf.windowed_sum(DEFAULT_SUM_WINDOW), 0.0);
        assert_eq!(wf.peak_sample(), 0);
    }

    #[test]
    fn test_peak_at_first_sample_is_zero() {
        let wf = pulse(0, 0, 400);
        assert_eq!(wf.peak_amplitude(), 0);
        assert_eq!(wf.raw_peak(), 400);
    }

    #[test]
    fn test_windowed_sum() {
        let mut samples = [100; NUM_SAMPLES];
        samples[1] = 1000; // outside the window
        samples[2] = 150;
        samples[3] = 300;
        samples[9] = 110;
        samples[10] = 500; // window end is exclusive
        samples[5] = 20; // clipped
        let wf = Waveform(samples);
        assert_eq!(wf.windowed_sum(DEFAULT_SUM_WINDOW), 50.0 + 200.0 + 10.0);
        assert_eq!(wf.windowed_sum(15..40), 0.0);
        assert_eq!(wf.windowed_sum(12..3), 0.0);
    }

    #[test]
    fn test_decode_marked_sample() {
        let adc = pulse(40, 7, 300);
        let mut marker = Waveform::default();
        assert_eq!(
            decode_marked_sample(&adc, &marker),
            MarkedSample { sample: 0, marks: 0, amplitude: 0 }
        );

        marker.0[4] = 12;
        marker.0[7] = 3;
        assert_eq!(
            decode_marked_sample(&adc, &marker),
            MarkedSample { sample: 7, marks: 2, amplitude: 300 }
        );

        let mut only_first = Waveform::default();
        only_first.0[0] = 1;
        assert_eq!(decode_marked_sample(&adc, &only_first).amplitude, 0);
    }

    #[test]
    fn test_event_accessors() {
        let mut event = Event::empty(false);
        event.adc[17] = pulse(20, 5, 640);
        event.tot[17].0[8] = 1800;
        assert_eq!(event.peak_amplitude(17), 640);
        assert_eq!(event.peak_tot(17), 1800);
        assert_eq!(event.peak_amplitude(18), 0);
        assert!(event.toa.is_none());
    }
}
