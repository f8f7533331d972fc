//! HTML plots and tab-separated summaries.

use std::{io::Write, path::Path};

use plotly::{
    common::{ErrorData, ErrorType, Line, LineShape, Mode, Title},
    layout::Axis,
    HeatMap, Layout, Plot, Scatter,
};
use unzip3::Unzip3;

use crate::{
    calibration::{GainTable, TotConversionTable},
    fit::{FitResult, LineFit},
    histogram::{Histogram1D, Histogram2D},
    scan::ScanMeasurement,
    channel_map::ChannelMap,
    spectra::{CrystalSums, PeakSummary, SpectraSummary},
};

const FIT_CURVE_POINTS: usize = 200;

pub fn histogram_trace(histogram: &Histogram1D, name: &str) -> Box<Scatter<f64, f64>> {
    Scatter::new(histogram.x(), histogram.counts.clone())
        .line(Line::new().shape(LineShape::Hvh))
        .name(name)
}

pub fn fit_trace(fit: &FitResult, name: &str) -> Box<Scatter<f64, f64>> {
    let (low, high) = fit.window;
    let step = (high - low) / (FIT_CURVE_POINTS - 1) as f64;
    let x = (0..FIT_CURVE_POINTS).map(|i| low + step * i as f64).collect::<Vec<_>>();
    let y = x.iter().map(|&x| fit.eval(x)).collect::<Vec<_>>();
    Scatter::new(x, y).mode(Mode::Lines).name(name)
}

fn layout(title: &str, x_title: &str, y_title: &str) -> Layout {
    Layout::new()
        .title(Title::new(title))
        .x_axis(Axis::new().title(Title::new(x_title)))
        .y_axis(Axis::new().title(Title::new(y_title)))
        .height(800)
}

/// One histogram with its fit curve, if any.
pub fn fitted_histogram_plot(title: &str, x_title: &str, histogram: &Histogram1D, fit: Option<&FitResult>) -> Plot {
    let mut plot = Plot::new();
    plot.add_trace(histogram_trace(histogram, "data"));
    if let Some(fit) = fit {
        let name = format!("fit: mean {:.1} ± {:.1}, σ {:.1}", fit.mean(), fit.mean_error(), fit.sigma());
        plot.add_trace(fit_trace(fit, &name));
    }
    plot.set_layout(layout(title, x_title, "counts"));
    plot
}

/// Several histograms overlaid, each with its fit.
pub fn overlay_plot<'a, I>(title: &str, x_title: &str, entries: I) -> Plot
where
    I: IntoIterator<Item = (String, &'a Histogram1D, Option<&'a FitResult>)>,
{
    let mut plot = Plot::new();
    for (name, histogram, fit) in entries {
        plot.add_trace(histogram_trace(histogram, &name));
        if let Some(fit) = fit {
            plot.add_trace(fit_trace(fit, &format!("{name} fit")));
        }
    }
    plot.set_layout(layout(title, x_title, "counts"));
    plot
}

/// ADC↔ToT correlation with the profile and the fitted line.
pub fn correlation_plot(title: &str, correlation: &Histogram2D, line: Option<&LineFit>) -> Plot {
    let mut plot = Plot::new();
    plot.add_trace(HeatMap::new(
        correlation.x_axis.centers(),
        correlation.y_axis.centers(),
        correlation.z_rows(),
    ));

    let profile = correlation.profile_x();
    plot.add_trace(
        Scatter::new(
            profile.iter().map(|p| p.x).collect::<Vec<_>>(),
            profile.iter().map(|p| p.mean).collect::<Vec<_>>(),
        )
        .mode(Mode::Markers)
        .name("profile"),
    );

    if let Some(line) = line {
        let x = vec![correlation.x_axis.low, correlation.x_axis.high];
        let y = x.iter().map(|&x| line.eval(x)).collect::<Vec<_>>();
        plot.add_trace(
            Scatter::new(x, y)
                .mode(Mode::Lines)
                .name(format!("{:.3}·adc + {:.1}", line.slope, line.intercept)),
        );
    }

    plot.set_layout(layout(title, "peak ADC", "peak ToT"));
    plot
}

/// Peak mean versus position with the centre fit.
pub fn scan_plot(title: &str, measurements: &[ScanMeasurement], centre: Option<&FitResult>) -> Plot {
    let (x, y, err) = measurements
        .iter()
        .map(|m| (m.position, m.mean, m.mean_error))
        .unzip3::<Vec<_>, Vec<f64>, Vec<f64>>();

    let mut plot = Plot::new();
    plot.add_trace(
        Scatter::new(x, y)
            .mode(Mode::Markers)
            .error_y(ErrorData::new(ErrorType::Data).array(err))
            .name("peak mean"),
    );
    if let Some(centre) = centre {
        plot.add_trace(fit_trace(
            centre,
            &format!("centre {:.2} ± {:.2} mm", centre.mean(), centre.mean_error()),
        ));
    }
    plot.set_layout(layout(title, "horizontal position, mm", "mean ADC"));
    plot
}

/// Crystal, central and calorimeter spectra as `<prefix>_*.html` in `out`.
pub fn write_spectra_plots(out: &Path, prefix: &str, map: &ChannelMap, sums: &CrystalSums, summary: &SpectraSummary) {
    for (crystal, (pair, [single, full])) in sums.crystal.iter().zip(&summary.crystal).enumerate() {
        let display_id = map.display_id(crystal);
        let entries = [
            ("single".to_owned(), &pair.single, single.fit.as_ref()),
            ("full".to_owned(), &pair.full, full.fit.as_ref()),
        ];
        overlay_plot(&format!("{prefix}: crystal {display_id}"), "ADC sum", entries)
            .write_html(out.join(format!("{prefix}_crystal{display_id:02}.html")));
    }

    for (name, histogram, row) in [
        ("central_single", &sums.central.single, &summary.central[0]),
        ("central_full", &sums.central.full, &summary.central[1]),
        ("calo_single", &sums.calo.single, &summary.calo[0]),
        ("calo_full", &sums.calo.full, &summary.calo[1]),
    ] {
        fitted_histogram_plot(&format!("{prefix}: {}", row.label), "ADC sum", histogram, row.fit.as_ref())
            .write_html(out.join(format!("{prefix}_{name}.html")));
    }
}

fn write_lines<I: IntoIterator<Item = String>>(path: &Path, header: &str, rows: I) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(file, "{header}")?;
    for row in rows {
        writeln!(file, "{row}")?;
    }
    file.flush()
}

pub fn write_summary_tsv(path: &Path, summary: &SpectraSummary) -> std::io::Result<()> {
    write_lines(path, PeakSummary::TSV_HEADER, summary.rows().map(PeakSummary::tsv_row))
}

pub fn write_gains_tsv(path: &Path, table: &GainTable) -> std::io::Result<()> {
    write_lines(
        path,
        "channel\tgain\tgain_err\tvalid",
        table
            .gains
            .iter()
            .enumerate()
            .map(|(channel, entry)| format!("{channel}\t{:.6}\t{:.6}\t{}", entry.value, entry.error, entry.valid)),
    )
}

pub fn write_conversion_tsv(path: &Path, table: &TotConversionTable) -> std::io::Result<()> {
    write_lines(
        path,
        "channel\tslope\tslope_err\tintercept\tintercept_err\tvalid",
        table
            .slopes
            .iter()
            .zip(&table.intercepts)
            .enumerate()
            .map(|(channel, (slope, intercept))| {
                format!(
                    "{channel}\t{:.6}\t{:.6}\t{:.3}\t{:.3}\t{}",
                    slope.value,
                    slope.error,
                    intercept.value,
                    intercept.error,
                    slope.valid && intercept.valid
                )
            }),
    )
}

pub fn write_scan_tsv(path: &Path, measurements: &[ScanMeasurement]) -> std::io::Result<()> {
    write_lines(
        path,
        "run\tposition\tmean\tmean_err\tsigma",
        measurements
            .iter()
            .map(|m| format!("{}\t{}\t{:.3}\t{:.3}\t{:.3}", m.run, m.position, m.mean, m.mean_error, m.sigma)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::{CalibrationEntry, TableMetadata},
        channel_map::{ConnectorLayout, ReadoutMode, NUM_CHANNELS},
        config::GainPolicy,
    };

    #[test]
    fn test_gains_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = GainTable::new(
            TableMetadata::new(9, ReadoutMode::Single, ConnectorLayout::Interleaved),
            GainPolicy::default(),
        );
        table.gains[2] = CalibrationEntry::measured(0.5, 0.25);
        let path = dir.path().join("gains.tsv");
        write_gains_tsv(&path, &table).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), NUM_CHANNELS + 1);
        assert_eq!(lines[3], "2\t0.500000\t0.250000\ttrue");
        assert_eq!(lines[1], "0\t1.000000\t0.000000\tfalse");
    }

    #[test]
    fn test_fit_trace_spans_window() {
        let fit = FitResult {
            model: crate::fit::PeakModel::Gaussian,
            window: (100.0, 300.0),
            params: vec![10.0, 200.0, 20.0],
            errors: vec![0.1, 0.1, 0.1],
            chi2: 0.0,
            ndf: 1,
            converged: true,
        };
        let mut hist = Histogram1D::new(10, 0.0, 400.0);
        hist.fill(210.0);
        let plot = fitted_histogram_plot("test", "adc", &hist, Some(&fit));
        let html = plot.to_html();
        assert!(html.contains("mean 200.0"));
    }
}
