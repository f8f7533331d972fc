//! Calibrated amplitudes with the linear-ADC / ToT-recovery switch.

use super::{GainTable, TotConversionTable};
use crate::{
    channel_map::{ChannelMap, ReadoutMode, NUM_CRYSTALS},
    config::ApplyPolicy,
    waveform::{Event, Waveform},
};

/// How a channel's amplitude was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconstruction {
    /// Unsaturated peak times gain.
    Linear(f64),
    /// ADC recovered from ToT through the linear conversion, times gain.
    TotRecovered(f64),
    /// Saturated, and ToT too low to recover.
    Unrecovered { tot: u32 },
    /// Saturated, but there is no usable conversion for the channel.
    ConversionUnavailable { saturated: u32 },
}

impl Reconstruction {
    /// Amplitude fed into spectra; 0 for everything that was not recovered.
    pub fn value(&self) -> f64 {
        match *self {
            Reconstruction::Linear(value) | Reconstruction::TotRecovered(value) => value,
            Reconstruction::Unrecovered { .. } | Reconstruction::ConversionUnavailable { .. } => {
                0.0
            }
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, Reconstruction::TotRecovered(_))
    }
}

/// How many channel amplitudes went through each path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathCounts {
    pub linear: u64,
    pub recovered: u64,
    pub unrecovered: u64,
    pub unavailable: u64,
}

impl PathCounts {
    pub fn count(&mut self, reconstruction: &Reconstruction) {
        match reconstruction {
            Reconstruction::Linear(_) => self.linear += 1,
            Reconstruction::TotRecovered(_) => self.recovered += 1,
            Reconstruction::Unrecovered { .. } => self.unrecovered += 1,
            Reconstruction::ConversionUnavailable { .. } => self.unavailable += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.linear + self.recovered + self.unrecovered + self.unavailable
    }
}

impl std::fmt::Display for PathCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} linear, {} recovered from ToT, {} unrecovered, {} without conversion",
            self.linear, self.recovered, self.unrecovered, self.unavailable
        )
    }
}

/// Calibrated sums of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedEvent {
    /// `(channel, reconstruction)` for every active channel
    pub channels: Vec<(usize, Reconstruction)>,
    pub crystals: [f64; NUM_CRYSTALS],
    pub central: f64,
    pub total: f64,
}

/// Applies loaded calibration tables. Either table may be absent: without
/// gains every factor is 1, without a conversion saturated channels are
/// reported as [`Reconstruction::ConversionUnavailable`].
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    pub gains: Option<GainTable>,
    pub conversion: Option<TotConversionTable>,
    pub policy: ApplyPolicy,
}

impl Calibrator {
    pub fn new(
        gains: Option<GainTable>,
        conversion: Option<TotConversionTable>,
        policy: ApplyPolicy,
    ) -> Self {
        Self {
            gains,
            conversion,
            policy,
        }
    }

    pub fn gain(&self, channel: usize) -> f64 {
        self.gains.as_ref().map_or(1.0, |gains| gains.gain(channel))
    }

    pub fn reconstruct(&self, adc: &Waveform, tot: &Waveform, channel: usize) -> Reconstruction {
        let peak = adc.peak_amplitude();
        if peak < self.policy.saturation {
            return Reconstruction::Linear(peak as f64 * self.gain(channel));
        }

        let peak_tot = tot.peak_tot();
        if peak_tot < self.policy.tot_valid_min {
            return Reconstruction::Unrecovered { tot: peak_tot };
        }

        let conversion = self
            .conversion
            .as_ref()
            .and_then(|table| table.conversion(channel))
            .filter(|(slope, _)| slope.abs() >= self.policy.min_slope);
        match conversion {
            Some((slope, intercept)) => {
                let adc = (peak_tot as f64 - intercept) / slope;
                Reconstruction::TotRecovered(adc * self.gain(channel))
            }
            None => Reconstruction::ConversionUnavailable { saturated: peak },
        }
    }

    pub fn calibrated_amplitude(&self, adc: &Waveform, tot: &Waveform, channel: usize) -> f64 {
        self.reconstruct(adc, tot, channel).value()
    }

    pub fn calibrate_event(&self, map: &ChannelMap, mode: ReadoutMode, event: &Event) -> CalibratedEvent {
        let mut channels = Vec::with_capacity(NUM_CRYSTALS * mode.sipms_per_crystal());
        let mut crystals = [0.0; NUM_CRYSTALS];

        for (crystal, sum) in crystals.iter_mut().enumerate() {
            for channel in map.channels_of(crystal, mode) {
                let reconstruction = self.reconstruct(&event.adc[channel], &event.tot[channel], channel);
                *sum += reconstruction.value();
                channels.push((channel, reconstruction));
            }
        }

        let central = ChannelMap::central_crystals().map(|crystal| crystals[crystal]).sum();
        let total = crystals.iter().sum();
        CalibratedEvent {
            channels,
            crystals,
            central,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        calibration::{CalibrationEntry, TableMetadata},
        channel_map::{ConnectorLayout, NUM_CHANNELS},
        config::{GainPolicy, TotPolicy},
        waveform::NUM_SAMPLES,
    };

    fn pulse(baseline: u32, peak: u32) -> Waveform {
        let mut samples = [baseline; NUM_SAMPLES];
        samples[5] = baseline + peak;
        Waveform(samples)
    }

    fn tot(value: u32) -> Waveform {
        let mut samples = [0; NUM_SAMPLES];
        samples[6] = value;
        Waveform(samples)
    }

    fn metadata() -> TableMetadata {
        TableMetadata::new(1, ReadoutMode::Interleaved16, ConnectorLayout::Interleaved)
    }

    fn calibrator() -> Calibrator {
        let mut gains = GainTable::new(metadata(), GainPolicy::default());
        gains.gains[17] = CalibrationEntry::measured(1.5, 0.01);
        let mut conversion = TotConversionTable::new(metadata(), TotPolicy::default());
        conversion.slopes[17] = CalibrationEntry::measured(2.0, 0.01);
        conversion.intercepts[17] = CalibrationEntry::measured(100.0, 1.0);
        Calibrator::new(Some(gains), Some(conversion), ApplyPolicy::default())
    }

    #[test]
    fn test_linear_path_applies_gain() {
        let calibrator = calibrator();
        assert_eq!(
            calibrator.reconstruct(&pulse(50, 300), &tot(0), 17),
            Reconstruction::Linear(450.0)
        );
        assert_eq!(calibrator.calibrated_amplitude(&pulse(50, 300), &tot(0), 18), 300.0);
    }

    #[test]
    fn test_saturation_boundary() {
        let calibrator = calibrator();
        assert_eq!(
            calibrator.reconstruct(&pulse(10, 699), &tot(900), 17),
            Reconstruction::Linear(699.0 * 1.5)
        );
        assert_eq!(
            calibrator.reconstruct(&pulse(10, 700), &tot(900), 17),
            Reconstruction::TotRecovered(400.0 * 1.5)
        );
    }

    #[test]
    fn test_tot_inversion() {
        let mut calibrator = calibrator();
        calibrator.gains = None;
        let value = calibrator.calibrated_amplitude(&pulse(0, 900), &tot(900), 17);
        assert_abs_diff_eq!(value, 400.0);
    }

    #[test]
    fn test_low_tot_is_unrecovered() {
        let calibrator = calibrator();
        let reconstruction = calibrator.reconstruct(&pulse(0, 900), &tot(199), 17);
        assert_eq!(reconstruction, Reconstruction::Unrecovered { tot: 199 });
        assert_eq!(reconstruction.value(), 0.0);
    }

    #[test]
    fn test_missing_tables_are_identity() {
        let calibrator = Calibrator::default();
        assert_eq!(calibrator.calibrated_amplitude(&pulse(20, 345), &tot(0), 3), 345.0);
        assert_eq!(
            calibrator.reconstruct(&pulse(0, 800), &tot(900), 3),
            Reconstruction::ConversionUnavailable { saturated: 800 }
        );
    }

    #[test]
    fn test_degenerate_slope_is_guarded() {
        let mut calibrator = calibrator();
        if let Some(conversion) = calibrator.conversion.as_mut() {
            conversion.slopes[17] = CalibrationEntry::measured(1e-9, 0.0);
        }
        let reconstruction = calibrator.reconstruct(&pulse(0, 800), &tot(900), 17);
        assert_eq!(reconstruction, Reconstruction::ConversionUnavailable { saturated: 800 });
        assert!(reconstruction.value().is_finite());
    }

    #[test]
    fn test_path_counts() {
        let calibrator = calibrator();
        let mut counts = PathCounts::default();
        for (peak, tot_value) in [(100, 0), (800, 900), (800, 100)] {
            counts.count(&calibrator.reconstruct(&pulse(0, peak), &tot(tot_value), 17));
        }
        counts.count(&calibrator.reconstruct(&pulse(0, 800), &tot(900), 18));
        assert_eq!(
            counts,
            PathCounts {
                linear: 1,
                recovered: 1,
                unrecovered: 1,
                unavailable: 1
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_calibrate_event_sums() {
        let mut wiring = crate::channel_map::Wiring::desy_2025(ConnectorLayout::Interleaved);
        wiring.asic[22] = 0;
        let map = ChannelMap::new(wiring).unwrap();
        let mode = ReadoutMode::Single;

        let mut event = Event::empty(false);
        for crystal in 0..NUM_CRYSTALS {
            let channel = map.channel_for(crystal, 0, mode);
            event.adc[channel] = pulse(5, 100);
        }
        let calibrated = Calibrator::default().calibrate_event(&map, mode, &event);

        assert_eq!(calibrated.channels.len(), NUM_CRYSTALS);
        assert!(calibrated.channels.iter().all(|&(channel, _)| channel < NUM_CHANNELS));
        assert_eq!(calibrated.crystals, [100.0; NUM_CRYSTALS]);
        assert_eq!(calibrated.central, 900.0);
        assert_eq!(calibrated.total, 2500.0);
    }
}
