use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `ORCA_DB_PATH` environment variable, falling back to
/// `orca.db` in the current directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl DbConfig {
    /// The default database file used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "orca.db";

    /// Build a config from the environment.
    ///
    /// Priority: `ORCA_DB_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let db_path = env::var("ORCA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self { db_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// The `sqlx` connection URL for this config, e.g. `sqlite:///abs/path/orca.db`.
    ///
    /// `mode=rwc` creates the file on first connect if it does not exist.
    pub fn connect_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_PATH);
        assert_eq!(cfg.db_path, PathBuf::from("orca.db"));
    }

    #[test]
    fn connect_url_has_rwc_mode() {
        let cfg = DbConfig::new("/tmp/orca/state.db");
        assert_eq!(cfg.connect_url(), "sqlite:///tmp/orca/state.db?mode=rwc");
    }

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("/var/lib/orca/orca.db");
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/orca/orca.db"));
    }
}
