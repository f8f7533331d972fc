//! Concatenates several runs into one run file, e.g. to gain statistics for
//! a calibration before deriving gains or ToT conversions from it.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use eeemcal_analysis::{
    cli::CommonArgs,
    find_run_files, init_logging,
    storage::combine_runs,
};

#[cfg(target_family = "unix")]
use tikv_jemallocator::Jemalloc;
#[cfg(target_family = "unix")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Run number of the combined file
    output_run: u32,
    /// Runs to combine
    #[arg(long, num_args = 1.., conflicts_with = "pattern", required_unless_present = "pattern")]
    runs: Vec<u32>,
    /// Glob relative to `$OUTPUT_PATH` selecting the run files to combine
    #[arg(long)]
    pattern: Option<String>,
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.config()?;
    let workspace = args.common.workspace()?;

    let inputs: Vec<PathBuf> = match &args.pattern {
        Some(pattern) => find_run_files(&workspace.data_root, pattern)?,
        None => args.runs.iter().map(|&run| workspace.run_path(&config, run)).collect(),
    };
    let output = workspace.run_path(&config, args.output_run);
    if inputs.is_empty() {
        eyre::bail!("no runs to combine");
    }
    if inputs.contains(&output) {
        eyre::bail!("{} is both an input and the output", output.display());
    }

    let header = combine_runs(&inputs, &output, args.output_run)?;

    info!(
        "{} runs combined into run {:03} ({} events) at {}",
        inputs.len(),
        header.run,
        header.events,
        output.display()
    );
    Ok(())
}
