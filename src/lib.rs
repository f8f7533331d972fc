use std::path::{Path, PathBuf};

use env_logger::Env;
use log::warn;

pub mod cache;
pub mod calibration;
pub mod channel_map;
pub mod cli;
pub mod config;
pub mod error;
pub mod features;
pub mod fit;
pub mod histogram;
pub mod offline;
pub mod report;
pub mod scan;
pub mod spectra;
pub mod storage;
pub mod waveform;
pub mod workspace;

use channel_map::{ChannelMap, Wiring};
use config::AnalysisConfig;
use error::ChannelMapError;

/// Logger for the binaries: `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
}

/// Builds the channel map for the configured layout and reports wiring
/// collisions in the configured mode. With `strict_wiring` a collision is
/// an error, otherwise it is logged and the first owner of a channel wins
/// in reverse lookups.
pub fn load_channel_map(config: &AnalysisConfig) -> Result<ChannelMap, ChannelMapError> {
    let map = ChannelMap::new(Wiring::desy_2025(config.layout))?;
    if config.strict_wiring {
        map.check_one_to_one(config.mode)?;
    } else {
        for collision in map.collisions(config.mode) {
            warn!("wiring defect in {} mode: {collision}", config.mode);
        }
    }
    Ok(map)
}

/// Files under `root` matching a glob `pattern`, in natural order
/// (`Run2.bin` before `Run10.bin`). Unreadable entries are skipped.
pub fn find_run_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let full = root.join(pattern);
    let mut files = glob::glob(&full.to_string_lossy())?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("skipping {}: {}", err.path().display(), err.error());
                None
            }
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(files)
}

/// Run number from a file name like `Run042.bin` or `run7.bin`.
pub fn run_number_from_path(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().ok()
}
