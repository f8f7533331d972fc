//! Fits the linear ADC↔ToT relation of every channel and stores it as
//! `tot_conversion_run<run>.json`.

use clap::Parser;
use log::{info, warn};

use eeemcal_analysis::{
    calibration::{derive::derive_tot_conversion, PersistedTable, TableMetadata, TotConversionTable},
    cli::CommonArgs,
    features::{get_run_features, open_cache},
    init_logging, load_channel_map,
    report::{correlation_plot, write_conversion_tsv},
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
    /// Crystals (grid index) whose correlation plots are written
    #[arg(long, num_args = 1.., default_values_t = [12])]
    plot_crystals: Vec<usize>,
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

    let derivation = derive_tot_conversion(
        &features.adc_tot,
        &config.tot,
        TableMetadata::new(args.run, config.mode, config.layout),
    );

    let table_path = TotConversionTable::path_in(&workspace.calibration_dir(), args.run);
    derivation.table.save(&table_path)?;
    info!("ToT conversion table written to {}", table_path.display());

    let out = workspace.run_output_dir(args.run)?;
    write_conversion_tsv(&out.join("tot_conversion.tsv"), &derivation.table)?;

    for &crystal in &args.plot_crystals {
        if crystal >= eeemcal_analysis::channel_map::NUM_CRYSTALS {
            warn!("crystal {crystal} does not exist, no plots written for it");
            continue;
        }
        let display_id = map.display_id(crystal);
        for (sipm, channel) in map.channels_of(crystal, config.mode).enumerate() {
            let Some(correlation) = &features.adc_tot[channel] else {
                continue;
            };
            let plot = correlation_plot(
                &format!("Run {:03}: crystal {display_id} sipm {sipm} (ch {channel})", args.run),
                correlation,
                derivation.fits[channel].as_ref(),
            );
            plot.write_html(out.join(format!("adc_tot_crystal{display_id:02}_sipm{sipm:02}.html")));
        }
    }

    Ok(())
}
