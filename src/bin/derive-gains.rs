//! Derives per-channel gain factors from the peak-amplitude spectra of one
//! run and stores them as `gains_run<run>.json`.

use clap::Parser;
use log::info;

use eeemcal_analysis::{
    calibration::{derive::derive_gains, GainTable, PersistedTable, TableMetadata},
    channel_map::NUM_CRYSTALS,
    cli::CommonArgs,
    features::{get_run_features, open_cache},
    fit::LevenbergMarquardt,
    init_logging, load_channel_map,
    report::{overlay_plot, write_gains_tsv},
};

#[cfg(target_family = "unix")]
use tikv_jemallocator::Jemalloc;
#[cfg(target_family = "unix")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Run number
    run: u32,
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.config()?;
    let workspace = args.common.workspace()?;
    let map = load_channel_map(&config)?;

    let cache = open_cache(workspace.features_cache(), !args.common.no_cache);
    let features = get_run_features(&cache, &workspace.run_path(&config, args.run), &map, &config).await?;

    let derivation = derive_gains(
        &LevenbergMarquardt::default(),
        &features.peak,
        features.active_channels(),
        &config.gain,
        TableMetadata::new(args.run, config.mode, config.layout),
    );

    let table_path = GainTable::path_in(&workspace.calibration_dir(), args.run);
    derivation.table.save(&table_path)?;
    info!("gain table written to {}", table_path.display());

    let out = workspace.run_output_dir(args.run)?;
    write_gains_tsv(&out.join("gains.tsv"), &derivation.table)?;

    for crystal in 0..NUM_CRYSTALS {
        let display_id = map.display_id(crystal);
        let entries = map.channels_of(crystal, config.mode).enumerate().map(|(sipm, channel)| {
            (
                format!("sipm {sipm} (ch {channel})"),
                &features.peak[channel],
                derivation.fits[channel].as_ref(),
            )
        });
        let plot = overlay_plot(
            &format!("Run {:03}: crystal {display_id} peak amplitude", args.run),
            "peak ADC",
            entries,
        );
        plot.write_html(out.join(format!("gains_crystal{display_id:02}.html")));
    }

    Ok(())
}
