//! CLI-facing config resolution: turns `--db-path` and friends into the
//! `CliOverrides` that `orca_core::config::OrcaConfig::resolve` expects.

use orca_core::config::{CliOverrides, ConfigError, OrcaConfig};

#[derive(Debug, Default, Clone, clap::Args)]
pub struct ConfigArgs {
    /// Override the SQLite database path.
    #[arg(long, global = true)]
    pub db_path: Option<String>,
}

impl ConfigArgs {
    pub fn resolve(&self) -> Result<OrcaConfig, ConfigError> {
        OrcaConfig::resolve(CliOverrides {
            db_path: self.db_path.clone(),
            ..Default::default()
        })
    }
}
