//! Errors surfaced by the I/O-adjacent parts of the analysis.
//!
//! Mapping and waveform extraction never fail; only opening runs, reading
//! calibration files, loading configuration and building a wiring can.

use std::path::PathBuf;

use thiserror::Error;

use crate::channel_map::{ChannelCollision, ReadoutMode};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Run file {0} does not exist")]
    MissingRun(PathBuf),

    #[error("Run file {file} declares {expected} events but only {actual} could be read")]
    Truncated {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("Event {event}: expected {expected} {array} waveforms, got {actual}")]
    BadShape {
        event: u64,
        array: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Run writer expected {expected} events, {actual} were written")]
    EventCountMismatch { expected: u64, actual: u64 },

    #[error("Run file {file} has {events} events, no event {event}")]
    NoSuchEvent { file: String, event: u64, events: u64 },

    #[error("No run files to combine")]
    NothingToCombine,

    #[error("{} and {} disagree on carrying ToA waveforms", first.display(), other.display())]
    MixedToa { first: PathBuf, other: PathBuf },

    #[error(transparent)]
    Decode(#[from] bincode::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CalibrationIoError {
    #[error("Calibration table {file} has {actual} entries in '{column}', expected {expected}")]
    BadShape {
        file: String,
        column: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ChannelMapError {
    #[error("Crystal {crystal}: {level} value {value} is outside 0..{limit}")]
    AddressOutOfRange {
        crystal: usize,
        level: &'static str,
        value: u8,
        limit: u8,
    },

    #[error("Connector table '{table}' row {connector} holds channel offset {value}, must be below {limit}")]
    OffsetOutOfRange {
        table: &'static str,
        connector: usize,
        value: u8,
        limit: usize,
    },

    #[error("Wiring is not one-to-one in {mode} mode: {} colliding channel(s), first: {}", .collisions.len(), .collisions[0])]
    Collisions {
        mode: ReadoutMode,
        collisions: Vec<ChannelCollision>,
    },
}

#[derive(Error, Debug)]
pub enum HistogramError {
    #[error("Cannot merge histograms with different binning ({ours} vs {theirs})")]
    BinningMismatch { ours: String, theirs: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set; it must point at the run data directory")]
    MissingDataRoot(&'static str),

    #[error("Could not parse config file {file}: {err}")]
    Parse {
        file: String,
        err: serde_yaml::Error,
    },

    #[error("Binning '{name}' needs at least one bin and low < high, got {bins} bins in [{low}, {high})")]
    BadBinning {
        name: &'static str,
        bins: usize,
        low: f64,
        high: f64,
    },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
