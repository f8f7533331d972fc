//! Beam position scan across one crystal: the peak sum of the crystal is
//! fitted for every scan run and a Gaussian through the fitted means gives
//! the beam position of maximum response.

use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use tokio::sync::Mutex;

use eeemcal_analysis::{
    cli::CommonArgs,
    features::progress_bar,
    fit::LevenbergMarquardt,
    init_logging, load_channel_map,
    report::{fitted_histogram_plot, scan_plot, write_scan_tsv},
    scan::{fit_beam_centre, CrystalPeakSum, ScanMeasurement},
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
    /// Crystal (grid index) to scan, overrides the config
    #[arg(long)]
    crystal: Option<usize>,
    /// Run number the products are stored under
    #[arg(long, default_value_t = 0)]
    label: u32,
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let args = Args::parse();
    let mut config = args.common.config()?;
    if let Some(crystal) = args.crystal {
        config.scan.crystal = crystal;
    }
    if config.scan.crystal >= eeemcal_analysis::channel_map::NUM_CRYSTALS {
        eyre::bail!("crystal {} does not exist", config.scan.crystal);
    }
    let workspace = args.common.workspace()?;
    let map = Arc::new(load_channel_map(&config)?);
    let config = Arc::new(config);

    let pb = Arc::new(Mutex::new(progress_bar(config.scan.points.len() as u64)));
    let handles = config
        .scan
        .points
        .iter()
        .map(|point| {
            let point = *point;
            let path = workspace.run_path(&config, point.run);
            let map = Arc::clone(&map);
            let config = Arc::clone(&config);
            let pb = Arc::clone(&pb);

            tokio::spawn(async move {
                let sum = tokio::task::spawn_blocking(move || {
                    let mut sum = CrystalPeakSum::new(&config.scan);
                    for event in RunReader::open(&path)? {
                        sum.fill(&map, config.mode, &event?);
                    }
                    Ok::<_, eeemcal_analysis::error::StorageError>(sum)
                })
                .await?;
                pb.lock().await.inc(1);
                Ok::<_, eyre::Error>((point, sum?))
            })
        })
        .collect::<Vec<_>>();

    let mut sums = Vec::with_capacity(handles.len());
    for handle in handles {
        sums.push(handle.await??);
    }
    pb.lock().await.finish_and_clear();

    let fitter = LevenbergMarquardt::default();
    let out = workspace.run_output_dir(args.label)?;
    let display_id = map.display_id(config.scan.crystal);

    let mut measurements = vec![];
    for (point, sum) in &sums {
        let fit = sum.fit(&fitter, &config.scan);
        let plot = fitted_histogram_plot(
            &format!("Run {:03}: crystal {display_id} at {} mm", point.run, point.position),
            "peak ADC sum",
            &sum.histogram,
            fit.as_ref(),
        );
        plot.write_html(out.join(format!("scan_run{:03}.html", point.run)));

        match fit {
            Some(fit) => {
                info!(
                    "run {:03} at {} mm: mean {:.1} ± {:.1}",
                    point.run,
                    point.position,
                    fit.mean(),
                    fit.mean_error()
                );
                measurements.push(ScanMeasurement {
                    run: point.run,
                    position: point.position,
                    mean: fit.mean(),
                    mean_error: fit.mean_error(),
                    sigma: fit.sigma(),
                });
            }
            None => warn!("run {:03}: peak fit failed, point left out of the scan", point.run),
        }
    }

    let centre = fit_beam_centre(&measurements, &config.scan);
    match &centre {
        Some(centre) => info!("beam centre at {:.2} ± {:.2} mm", centre.mean(), centre.mean_error()),
        None => warn!("beam centre fit failed"),
    }

    write_scan_tsv(&out.join("scan.tsv"), &measurements)?;
    scan_plot(
        &format!("Position scan of crystal {display_id}"),
        &measurements,
        centre.as_ref(),
    )
    .write_html(out.join("scan.html"));

    Ok(())
}
