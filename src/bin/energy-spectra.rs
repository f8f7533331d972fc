//! Energy-sum spectra of one run without calibration: per SiPM, per
//! crystal, central 3×3 and whole calorimeter, fitted and summarised.

use clap::Parser;
use log::info;

use eeemcal_analysis::{
    cli::CommonArgs,
    features::{get_run_features, open_cache},
    fit::LevenbergMarquardt,
    init_logging, load_channel_map,
    report::{write_spectra_plots, write_summary_tsv},
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

    let summary = features
        .spectra
        .summarize(&LevenbergMarquardt::default(), &config.spectra, &map);
    for row in summary.central.iter().chain(&summary.calo) {
        info!("{}", row.tsv_row());
    }

    let out = workspace.run_output_dir(args.run)?;
    write_summary_tsv(&out.join("energy_spectra.tsv"), &summary)?;
    write_spectra_plots(&out, "energy_spectra", &map, &features.spectra, &summary);

    Ok(())
}
