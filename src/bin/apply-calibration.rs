//! Energy-sum spectra with calibration applied: gain-corrected amplitudes,
//! saturated channels recovered through ToT.

use clap::Parser;
use log::{info, warn};

use eeemcal_analysis::{
    calibration::{
        apply::{Calibrator, PathCounts},
        GainTable, PersistedTable, TotConversionTable,
    },
    cli::CommonArgs,
    features::progress_bar,
    fit::LevenbergMarquardt,
    init_logging, load_channel_map,
    report::{write_spectra_plots, write_summary_tsv},
    spectra::CrystalSums,
    storage::RunReader,
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
    /// Run whose gain table is used; defaults to the analysed run
    #[arg(long)]
    gains_run: Option<u32>,
    /// Run whose ToT conversion table is used; defaults to the analysed run
    #[arg(long)]
    tot_run: Option<u32>,
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = args.common.config()?;
    let workspace = args.common.workspace()?;
    let map = load_channel_map(&config)?;

    let calibration_dir = workspace.calibration_dir();
    let gains = GainTable::load(&GainTable::path_in(
        &calibration_dir,
        args.gains_run.unwrap_or(args.run),
    ))?;
    let conversion = TotConversionTable::load(&TotConversionTable::path_in(
        &calibration_dir,
        args.tot_run.unwrap_or(args.run),
    ))?;
    for (name, mode) in [
        ("gain", gains.as_ref().map(|table| table.metadata.mode)),
        ("ToT conversion", conversion.as_ref().map(|table| table.metadata.mode)),
    ] {
        if let Some(mode) = mode.filter(|&mode| mode != config.mode) {
            warn!("{name} table was derived in {mode} mode, analysing in {}", config.mode);
        }
    }
    let calibrator = Calibrator::new(gains, conversion, config.apply.clone());

    let reader = RunReader::open(&workspace.run_path(&config, args.run))?;
    let pb = progress_bar(reader.header().events);
    let mut sums = CrystalSums::new(config.mode, &config.spectra);
    let mut counts = PathCounts::default();

    for event in reader {
        let event = event?;
        sums.fill(&map, |channel| {
            let reconstruction = calibrator.reconstruct(&event.adc[channel], &event.tot[channel], channel);
            counts.count(&reconstruction);
            let full = event.windowed_sum(channel, config.extraction.sum_window.clone()) * calibrator.gain(channel);
            (reconstruction.value(), full)
        });
        pb.inc(1);
    }
    pb.finish_and_clear();
    info!("run {:03}: {counts}", args.run);

    let summary = sums.summarize(&LevenbergMarquardt::default(), &config.spectra, &map);
    for row in summary.central.iter().chain(&summary.calo) {
        info!("{}", row.tsv_row());
    }

    let out = workspace.run_output_dir(args.run)?;
    write_summary_tsv(&out.join("calibrated_spectra.tsv"), &summary)?;
    write_spectra_plots(&out, "calibrated", &map, &sums, &summary);

    Ok(())
}
