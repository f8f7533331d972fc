//! Fast offline production of one run: the run is accumulated once and the
//! energy spectra, gain table and ADC↔ToT conversion are all derived from
//! the same features. Tables go to the calibration directory, reports to
//! the run's output directory.

use std::path::PathBuf;

use log::{info, warn};

use crate::{
    calibration::{
        derive::{derive_gains, derive_tot_conversion, GainDerivation, TotDerivation},
        GainTable, PersistedTable, TableMetadata, TotConversionTable,
    },
    channel_map::{ChannelMap, NUM_CRYSTALS},
    config::AnalysisConfig,
    features::{get_run_features, FeatureCache, RunFeatures},
    fit::PeakFitter,
    report::{
        correlation_plot, overlay_plot, write_conversion_tsv, write_gains_tsv, write_spectra_plots,
        write_summary_tsv,
    },
    spectra::SpectraSummary,
    workspace::Workspace,
};

#[derive(Debug, Clone)]
pub struct OfflineProducts {
    pub run: u32,
    /// directory holding the reports
    pub out: PathBuf,
    pub summary: SpectraSummary,
    pub gains: GainDerivation,
    pub conversion: TotDerivation,
    pub gain_table: PathBuf,
    pub conversion_table: PathBuf,
}

pub async fn fast_offline<F: PeakFitter>(
    cache: &FeatureCache,
    workspace: &Workspace,
    map: &ChannelMap,
    config: &AnalysisConfig,
    fitter: &F,
    run: u32,
    plot_crystals: &[usize],
) -> eyre::Result<OfflineProducts> {
    let features = get_run_features(cache, &workspace.run_path(config, run), map, config).await?;
    let out = workspace.run_output_dir(run)?;
    let metadata = TableMetadata::new(run, config.mode, config.layout);

    let summary = features.spectra.summarize(fitter, &config.spectra, map);
    for row in summary.central.iter().chain(&summary.calo) {
        info!("{}", row.tsv_row());
    }
    write_summary_tsv(&out.join("energy_spectra.tsv"), &summary)?;
    write_spectra_plots(&out, "energy_spectra", map, &features.spectra, &summary);

    let gains = derive_gains(
        fitter,
        &features.peak,
        features.active_channels(),
        &config.gain,
        metadata.clone(),
    );
    let gain_table = GainTable::path_in(&workspace.calibration_dir(), run);
    gains.table.save(&gain_table)?;
    write_gains_tsv(&out.join("gains.tsv"), &gains.table)?;

    let conversion = derive_tot_conversion(&features.adc_tot, &config.tot, metadata);
    let conversion_table = TotConversionTable::path_in(&workspace.calibration_dir(), run);
    conversion.table.save(&conversion_table)?;
    write_conversion_tsv(&out.join("tot_conversion.tsv"), &conversion.table)?;

    write_crystal_plots(&out, map, config, &features, &gains, &conversion, plot_crystals);

    info!(
        "run {run:03}: {} events, {} gains and {} ToT conversions written to {}",
        features.events,
        gains.table.valid_channels(),
        conversion.table.valid_channels(),
        out.display()
    );
    Ok(OfflineProducts {
        run,
        out,
        summary,
        gains,
        conversion,
        gain_table,
        conversion_table,
    })
}

fn write_crystal_plots(
    out: &std::path::Path,
    map: &ChannelMap,
    config: &AnalysisConfig,
    features: &RunFeatures,
    gains: &GainDerivation,
    conversion: &TotDerivation,
    crystals: &[usize],
) {
    for &crystal in crystals {
        if crystal >= NUM_CRYSTALS {
            warn!("crystal {crystal} does not exist, no plots written for it");
            continue;
        }
        let display_id = map.display_id(crystal);
        let entries = map.channels_of(crystal, config.mode).enumerate().map(|(sipm, channel)| {
            (
                format!("sipm {sipm} (ch {channel})"),
                &features.peak[channel],
                gains.fits[channel].as_ref(),
            )
        });
        overlay_plot(
            &format!("Run {:03}: crystal {display_id} peak amplitude", features.run),
            "peak ADC",
            entries,
        )
        .write_html(out.join(format!("gains_crystal{display_id:02}.html")));

        for (sipm, channel) in map.channels_of(crystal, config.mode).enumerate() {
            let Some(correlation) = &features.adc_tot[channel] else {
                continue;
            };
            correlation_plot(
                &format!("Run {:03}: crystal {display_id} sipm {sipm} (ch {channel})", features.run),
                correlation,
                conversion.fits[channel].as_ref(),
            )
            .write_html(out.join(format!("adc_tot_crystal{display_id:02}_sipm{sipm:02}.html")));
        }
    }
}
