//! Calibration tables: per-channel gain factors and the ADC↔ToT linear
//! conversion.
//!
//! Tables cover the full channel address space and are stored as JSON next
//! to the policy that produced them. A table file that does not exist is
//! not an error: loading yields `None` and the caller runs without that
//! correction.

pub mod apply;
pub mod derive;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    channel_map::{ConnectorLayout, ReadoutMode, NUM_CHANNELS},
    config::{GainPolicy, TotPolicy},
    error::CalibrationIoError,
};

/// One channel's calibration value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    pub value: f64,
    pub error: f64,
    /// false when the value is a default standing in for a failed fit
    pub valid: bool,
}

impl CalibrationEntry {
    pub const IDENTITY: Self = Self {
        value: 1.0,
        error: 0.0,
        valid: false,
    };

    pub const ZERO: Self = Self {
        value: 0.0,
        error: 0.0,
        valid: false,
    };

    pub fn measured(value: f64, error: f64) -> Self {
        Self {
            value,
            error,
            valid: true,
        }
    }
}

/// Where a table came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub run: u32,
    pub created: DateTime<Utc>,
    pub mode: ReadoutMode,
    pub layout: ConnectorLayout,
}

impl TableMetadata {
    pub fn new(run: u32, mode: ReadoutMode, layout: ConnectorLayout) -> Self {
        Self {
            run,
            created: Utc::now(),
            mode,
            layout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainTable {
    pub metadata: TableMetadata,
    pub policy: GainPolicy,
    pub gains: Vec<CalibrationEntry>,
}

impl GainTable {
    pub fn new(metadata: TableMetadata, policy: GainPolicy) -> Self {
        Self {
            metadata,
            policy,
            gains: vec![CalibrationEntry::IDENTITY; NUM_CHANNELS],
        }
    }

    /// Gain factor of a channel; 1 outside the table.
    pub fn gain(&self, channel: usize) -> f64 {
        self.gains.get(channel).map_or(1.0, |entry| entry.value)
    }

    pub fn valid_channels(&self) -> usize {
        self.gains.iter().filter(|entry| entry.valid).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotConversionTable {
    pub metadata: TableMetadata,
    pub policy: TotPolicy,
    pub slopes: Vec<CalibrationEntry>,
    pub intercepts: Vec<CalibrationEntry>,
}

impl TotConversionTable {
    pub fn new(metadata: TableMetadata, policy: TotPolicy) -> Self {
        Self {
            metadata,
            policy,
            slopes: vec![CalibrationEntry::ZERO; NUM_CHANNELS],
            intercepts: vec![CalibrationEntry::ZERO; NUM_CHANNELS],
        }
    }

    /// `(slope, intercept)` of a channel, `None` when no valid fit exists.
    pub fn conversion(&self, channel: usize) -> Option<(f64, f64)> {
        let slope = self.slopes.get(channel)?;
        let intercept = self.intercepts.get(channel)?;
        (slope.valid && intercept.valid).then_some((slope.value, intercept.value))
    }

    pub fn valid_channels(&self) -> usize {
        (0..NUM_CHANNELS)
            .filter(|&channel| self.conversion(channel).is_some())
            .count()
    }
}

/// JSON persistence shared by the calibration tables.
pub trait PersistedTable: Serialize + DeserializeOwned + Sized {
    /// `(column name, length)` of every per-channel column.
    fn columns(&self) -> Vec<(&'static str, usize)>;

    fn file_name(run: u32) -> String;

    fn path_in(dir: &Path, run: u32) -> PathBuf {
        dir.join(Self::file_name(run))
    }

    fn save(&self, path: &Path) -> Result<(), CalibrationIoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Reads a table; a missing file yields `Ok(None)`.
    fn load(path: &Path) -> Result<Option<Self>, CalibrationIoError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "calibration table {} not found, continuing without it",
                    path.display()
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let table: Self = serde_json::from_slice(&bytes)?;

        for (column, actual) in table.columns() {
            if actual != NUM_CHANNELS {
                return Err(CalibrationIoError::BadShape {
                    file: path.display().to_string(),
                    column,
                    expected: NUM_CHANNELS,
                    actual,
                });
            }
        }
        Ok(Some(table))
    }
}

impl PersistedTable for GainTable {
    fn columns(&self) -> Vec<(&'static str, usize)> {
        vec![("gains", self.gains.len())]
    }

    fn file_name(run: u32) -> String {
        format!("gains_run{run:03}.json")
    }
}

impl PersistedTable for TotConversionTable {
    fn columns(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("slopes", self.slopes.len()),
            ("intercepts", self.intercepts.len()),
        ]
    }

    fn file_name(run: u32) -> String {
        format!("tot_conversion_run{run:03}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TableMetadata {
        TableMetadata::new(42, ReadoutMode::Interleaved16, ConnectorLayout::Interleaved)
    }

    #[test]
    fn test_gain_table_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = GainTable::new(metadata(), GainPolicy::default());
        table.gains[146] = CalibrationEntry::measured(0.87, 0.01);

        let path = GainTable::path_in(dir.path(), 42);
        assert!(path.ends_with("gains_run042.json"));
        table.save(&path).unwrap();

        let loaded = GainTable::load(&path).unwrap().unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.gain(146), 0.87);
        assert_eq!(loaded.gain(147), 1.0);
        assert_eq!(loaded.gain(10_000), 1.0);
        assert_eq!(loaded.valid_channels(), 1);
    }

    #[test]
    fn test_missing_table_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = TotConversionTable::path_in(dir.path(), 3);
        assert!(TotConversionTable::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_truncated_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = TotConversionTable::new(metadata(), TotPolicy::default());
        table.intercepts.truncate(100);
        let path = dir.path().join("broken.json");
        table.save(&path).unwrap();

        assert!(matches!(
            TotConversionTable::load(&path),
            Err(CalibrationIoError::BadShape {
                column: "intercepts",
                actual: 100,
                ..
            })
        ));
    }

    #[test]
    fn test_conversion_requires_valid_entries() {
        let mut table = TotConversionTable::new(metadata(), TotPolicy::default());
        assert_eq!(table.conversion(5), None);
        table.slopes[5] = CalibrationEntry::measured(2.0, 0.1);
        assert_eq!(table.conversion(5), None);
        table.intercepts[5] = CalibrationEntry::measured(100.0, 3.0);
        assert_eq!(table.conversion(5), Some((2.0, 100.0)));
        assert_eq!(table.valid_channels(), 1);
    }
}
