//! Arguments shared by the analysis binaries.

use std::path::PathBuf;

use clap::Args;

use crate::{
    channel_map::{ConnectorLayout, ReadoutMode},
    config::AnalysisConfig,
    error::ConfigError,
};

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the config file in yaml format
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Readout mode, overrides the config
    #[arg(short, long, value_enum)]
    pub mode: Option<ReadoutMode>,

    /// 16-SiPM connector layout, overrides the config
    #[arg(long, value_enum)]
    pub layout: Option<ConnectorLayout>,

    /// Write products here instead of `$OUTPUT_PATH/analysis`
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Recompute run features even when they are cached
    #[arg(long)]
    pub no_cache: bool,
}

impl CommonArgs {
    pub fn config(&self) -> Result<AnalysisConfig, ConfigError> {
        let mut config = AnalysisConfig::load_or_default(self.config.as_deref())?;
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(layout) = self.layout {
            config.layout = layout;
        }
        Ok(config)
    }

    pub fn workspace(&self) -> Result<crate::workspace::Workspace, ConfigError> {
        let workspace = crate::workspace::Workspace::from_env()?;
        Ok(match &self.output {
            Some(output) => workspace.with_output_dir(output),
            None => workspace,
        })
    }
}
