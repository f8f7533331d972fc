//! Where runs are read from and where products are written.
//!
//! Only binaries resolve the environment; the library receives a
//! [`Workspace`] value.

use std::path::{Path, PathBuf};

use crate::{config::AnalysisConfig, error::ConfigError};

/// Environment variable pointing at the run data directory.
pub const DATA_ROOT_VAR: &str = "OUTPUT_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub data_root: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Workspace {
    /// Products go to `<data_root>/analysis`, the feature cache to
    /// `<data_root>/.cache`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            output_dir: data_root.join("analysis"),
            cache_dir: data_root.join(".cache"),
            data_root,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        std::env::var_os(DATA_ROOT_VAR)
            .map(Self::new)
            .ok_or(ConfigError::MissingDataRoot(DATA_ROOT_VAR))
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn run_path(&self, config: &AnalysisConfig, run: u32) -> PathBuf {
        self.data_root.join(config.run_file_name(run))
    }

    /// Directory holding the calibration tables.
    pub fn calibration_dir(&self) -> PathBuf {
        self.output_dir.join("calibration")
    }

    /// Directory for the reports of one run; created on demand.
    pub fn run_output_dir(&self, run: u32) -> std::io::Result<PathBuf> {
        let dir = self.output_dir.join(format!("run{run:03}"));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn features_cache(&self) -> PathBuf {
        self.cache_dir.join("run_features")
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.data_root)
    }
}
