//! Configuration resolution.
//!
//! Resolution chain, applied field by field: CLI flag > env var > config
//! file > default. Secrets (`tracker_api_key`, `webhook_secret`,
//! `tunnel_token`) read from environment variables in preference to the
//! config file; everything else comes from the TOML file at
//! `$XDG_CONFIG_HOME/orca/config.toml` (falling back to
//! `~/.config/orca/config.toml`).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use orca_db::config::DbConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required configuration fields: {0:?}")]
    MissingFields(Vec<String>),

    #[error("invalid deploy_strategy {0:?}, expected \"none\" or \"github_actions\"")]
    InvalidDeployStrategy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStrategy {
    None,
    GithubActions,
}

impl std::str::FromStr for DeployStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "github_actions" => Ok(Self::GithubActions),
            other => Err(ConfigError::InvalidDeployStrategy(other.to_string())),
        }
    }
}

/// On-disk config file shape, mirroring the table in the external
/// interfaces section. All fields optional: absent fields fall through to
/// env vars, then defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub tracker_api_key: Option<String>,
    pub tracker_base_url: Option<String>,
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub project_ids: Vec<String>,
    pub ready_state_type: Option<String>,

    pub tunnel_hostname: Option<String>,
    pub tunnel_token: Option<String>,
    pub tunnel_bin: Option<String>,

    pub agent_bin: Option<String>,
    pub default_max_turns: Option<i64>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,

    pub implement_prompt: Option<String>,
    pub review_prompt: Option<String>,
    pub fix_prompt: Option<String>,
    pub max_review_cycles: Option<i64>,
    pub review_max_turns: Option<i64>,

    pub concurrency_cap: Option<i64>,
    pub session_timeout_min: Option<i64>,
    pub max_retries: Option<i64>,

    pub budget_window_hours: Option<i64>,
    pub budget_max_cost_usd: Option<f64>,

    pub scheduler_interval_sec: Option<u64>,
    pub cleanup_interval_min: Option<u64>,
    pub cleanup_branch_max_age_min: Option<u64>,

    pub deploy_strategy: Option<String>,
    pub deploy_poll_interval_sec: Option<u64>,
    pub deploy_timeout_min: Option<u64>,

    pub port: Option<u16>,
    pub db_path: Option<String>,

    pub default_cwd: Option<String>,
    #[serde(default)]
    pub repo_path_overrides: HashMap<String, String>,
}

pub const DEFAULT_REVIEW_PROMPT: &str = "Review the changes on this branch. Reply with REVIEW_RESULT:APPROVED \
     or REVIEW_RESULT:CHANGES_REQUESTED as the last line of your response.";
pub const DEFAULT_FIX_PROMPT: &str = "Address the review feedback on this branch and push a fix commit.";

/// Fully resolved, validated configuration.
#[derive(Debug, Clone)]
pub struct OrcaConfig {
    pub tracker_api_key: String,
    pub tracker_base_url: String,
    pub webhook_secret: String,
    pub project_ids: Vec<String>,
    pub ready_state_type: String,

    pub tunnel_hostname: String,
    pub tunnel_token: Option<String>,
    pub tunnel_bin: String,

    pub agent_bin: String,
    pub default_max_turns: i64,
    pub disallowed_tools: Vec<String>,

    pub implement_prompt: Option<String>,
    pub review_prompt: String,
    pub fix_prompt: String,
    pub max_review_cycles: i64,
    pub review_max_turns: i64,

    pub concurrency_cap: i64,
    pub session_timeout_min: i64,
    pub max_retries: i64,

    pub budget_window_hours: i64,
    pub budget_max_cost_usd: f64,

    pub scheduler_interval_sec: u64,
    pub cleanup_interval_min: u64,
    pub cleanup_branch_max_age_min: u64,

    pub deploy_strategy: DeployStrategy,
    pub deploy_poll_interval_sec: u64,
    pub deploy_timeout_min: u64,

    pub port: u16,
    pub db_config: DbConfig,

    pub default_cwd: Option<String>,
    pub repo_path_overrides: HashMap<String, String>,
}

/// CLI-flag overrides, applied ahead of environment and file values.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub tracker_api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub db_path: Option<String>,
    pub concurrency_cap: Option<i64>,
    pub scheduler_interval_sec: Option<u64>,
}

pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("orca");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("orca")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load_config_file() -> Result<Option<ConfigFile>, ConfigError> {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(toml::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

pub fn save_config_file(config: &ConfigFile) -> Result<(), ConfigError> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write { path: dir.clone(), source })?;

    let path = config_path();
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, &contents).map_err(|source| ConfigError::Write { path: path.clone(), source })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .map_err(|source| ConfigError::Write { path, source })?;
    }

    Ok(())
}

macro_rules! resolve_string {
    ($cli:expr, $env_var:expr, $file:expr) => {
        $cli.clone().or_else(|| std::env::var($env_var).ok()).or_else(|| $file.clone())
    };
}

impl OrcaConfig {
    /// Resolve a fully-populated config, collecting every missing required
    /// field into a single aggregated error rather than failing on the
    /// first.
    pub fn resolve(cli: CliOverrides) -> Result<Self, ConfigError> {
        let file = load_config_file()?.unwrap_or_default();
        let mut missing = Vec::new();

        let tracker_api_key = resolve_string!(cli.tracker_api_key, "ORCA_TRACKER_API_KEY", file.tracker_api_key);
        let webhook_secret = resolve_string!(cli.webhook_secret, "ORCA_WEBHOOK_SECRET", file.webhook_secret);
        let tunnel_token = std::env::var("ORCA_TUNNEL_TOKEN").ok().or_else(|| file.tunnel_token.clone());

        if tracker_api_key.is_none() {
            missing.push("tracker_api_key".to_string());
        }
        if webhook_secret.is_none() {
            missing.push("webhook_secret".to_string());
        }
        if file.project_ids.is_empty() {
            missing.push("project_ids".to_string());
        }
        if file.tunnel_hostname.is_none() {
            missing.push("tunnel_hostname".to_string());
        }
        if file.tracker_base_url.is_none() {
            missing.push("tracker_base_url".to_string());
        }

        let ready_state_type = file.ready_state_type.clone().unwrap_or_else(|| "ready".to_string());
        let tunnel_bin = file.tunnel_bin.clone().unwrap_or_else(|| "cloudflared".to_string());
        let agent_bin = file.agent_bin.clone().unwrap_or_else(|| "claude".to_string());

        let deploy_strategy_raw = file.deploy_strategy.clone().unwrap_or_else(|| "none".to_string());
        let deploy_strategy = match deploy_strategy_raw.parse::<DeployStrategy>() {
            Ok(strategy) => strategy,
            Err(_) => {
                missing.push(format!("deploy_strategy (invalid value {deploy_strategy_raw:?})"));
                DeployStrategy::None
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        let db_path = cli
            .db_path
            .or_else(|| std::env::var("ORCA_DB_PATH").ok())
            .or_else(|| file.db_path.clone())
            .unwrap_or_else(|| DbConfig::DEFAULT_PATH.to_string());

        Ok(Self {
            tracker_api_key: tracker_api_key.unwrap(),
            tracker_base_url: file.tracker_base_url.clone().unwrap(),
            webhook_secret: webhook_secret.unwrap(),
            project_ids: file.project_ids,
            ready_state_type,
            tunnel_hostname: file.tunnel_hostname.unwrap(),
            tunnel_token,
            tunnel_bin,
            agent_bin,
            default_max_turns: file.default_max_turns.unwrap_or(50),
            disallowed_tools: file.disallowed_tools,
            implement_prompt: file.implement_prompt,
            review_prompt: file.review_prompt.unwrap_or_else(|| DEFAULT_REVIEW_PROMPT.to_string()),
            fix_prompt: file.fix_prompt.unwrap_or_else(|| DEFAULT_FIX_PROMPT.to_string()),
            max_review_cycles: file.max_review_cycles.unwrap_or(3),
            review_max_turns: file.review_max_turns.unwrap_or(30),
            concurrency_cap: cli.concurrency_cap.or(file.concurrency_cap).unwrap_or(3),
            session_timeout_min: file.session_timeout_min.unwrap_or(45),
            max_retries: file.max_retries.unwrap_or(3),
            budget_window_hours: file.budget_window_hours.unwrap_or(4),
            budget_max_cost_usd: file.budget_max_cost_usd.unwrap_or(1000.0),
            scheduler_interval_sec: cli.scheduler_interval_sec.or(file.scheduler_interval_sec).unwrap_or(10),
            cleanup_interval_min: file.cleanup_interval_min.unwrap_or(10),
            cleanup_branch_max_age_min: file.cleanup_branch_max_age_min.unwrap_or(60),
            deploy_strategy,
            deploy_poll_interval_sec: file.deploy_poll_interval_sec.unwrap_or(30),
            deploy_timeout_min: file.deploy_timeout_min.unwrap_or(30),
            port: file.port.unwrap_or(3000),
            db_config: DbConfig::new(db_path),
            default_cwd: file.default_cwd.clone(),
            repo_path_overrides: file.repo_path_overrides.clone(),
        })
    }
}
