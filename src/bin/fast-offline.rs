//! Fast offline production of one run: energy spectra, gain table and ADC↔ToT
//! conversion from a single pass over the run.

use clap::Parser;

use eeemcal_analysis::{
    cli::CommonArgs,
    features::open_cache,
    fit::LevenbergMarquardt,
    init_logging, load_channel_map,
    offline::fast_offline,
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
    /// Crystals (grid index) whose gain and correlation plots are written
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
    let products = fast_offline(
        &cache,
        &workspace,
        &map,
        &config,
        &LevenbergMarquardt::default(),
        args.run,
        &args.plot_crystals,
    )
    .await?;

    println!("{}", products.out.display());
    Ok(())
}
