//! Configuration loading and management
//!
//! Process configuration is loaded from `~/.config/errsift/config.toml`.
//! The source inventory (schedule, sources and streams) lives in a separate
//! document, see [`crate::registry::Inventory`].
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/errsift/` (~/.config/errsift/)
//! - Data: `$XDG_DATA_HOME/errsift/` (~/.local/share/errsift/)
//! - State/Logs: `$XDG_STATE_HOME/errsift/` (~/.local/state/errsift/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default mount point for host logs inside a container.
pub const DEFAULT_MOUNT_ROOT: &str = "/app/logs";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Offset store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// LLM configuration for analysis (optional, offline digest otherwise)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Operator notifications
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Execution history
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Filesystem locations
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root that relative local stream paths are joined with
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Where analysis results are written (defaults to the data dir)
    pub results_dir: Option<PathBuf>,
    /// Source inventory document (defaults to the config dir)
    pub sources_file: Option<PathBuf>,
    /// Optional directory of per-source runbooks fed to the analyzer as context
    pub runbooks_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            results_dir: None,
            sources_file: None,
            runbooks_dir: None,
        }
    }
}

fn default_mount_root() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_ROOT)
}

/// Offset store settings
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite file (defaults to the data dir)
    pub path: Option<PathBuf>,
    /// How long a statement waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_busy_timeout() -> u64 {
    5000
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_timeout() -> u64 {
    120
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Claude,
    OpenAI,
}

impl LlmProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::Claude => "https://api.anthropic.com",
            LlmProvider::OpenAI => "https://api.openai.com",
        }
    }

    /// Environment variable consulted when no api_key is configured
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => None,
            LlmProvider::Claude => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also write human-readable logs to stderr
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Operator notification settings
///
/// Without a webhook, notifications are written to the log.
#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    /// Slack-compatible incoming webhook URL
    pub webhook_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notifier_timeout(),
        }
    }
}

fn default_notifier_timeout() -> u64 {
    10
}

/// Execution history settings
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Append every cycle record to `executions.jsonl` in the state dir
    #[serde(default = "default_history_jsonl")]
    pub jsonl: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            jsonl: default_history_jsonl(),
        }
    }
}

fn default_history_jsonl() -> bool {
    true
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Apply `ERRSIFT_*` and provider environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os("ERRSIFT_MOUNT_ROOT") {
            self.paths.mount_root = PathBuf::from(root);
        }
        if let Some(dir) = std::env::var_os("ERRSIFT_RESULTS_DIR") {
            self.paths.results_dir = Some(PathBuf::from(dir));
        }
        if let Some(file) = std::env::var_os("ERRSIFT_SOURCES_FILE") {
            self.paths.sources_file = Some(PathBuf::from(file));
        }
        if let Some(db) = std::env::var_os("ERRSIFT_DATABASE") {
            self.database.path = Some(PathBuf::from(db));
        }
        if self.notifier.webhook_url.is_none() {
            self.notifier.webhook_url = std::env::var("SLACK_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.is_empty());
        }
        if let Some(llm) = self.llm.as_mut() {
            if llm.api_key.is_none() {
                llm.api_key = llm
                    .provider
                    .api_key_env()
                    .and_then(|var| std::env::var(var).ok());
            }
        }
    }

    /// Validate settings that cannot be checked by deserialization alone
    pub fn validate(&self) -> Result<()> {
        if let Some(llm) = &self.llm {
            if llm.model.trim().is_empty() {
                return Err(Error::Config("llm.model must not be empty".to_string()));
            }
            if llm.provider != LlmProvider::Ollama && llm.api_key.is_none() {
                return Err(Error::Config(
                    "llm.api_key (or provider env var) is required".to_string(),
                ));
            }
        }
        if let Some(url) = &self.notifier.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "notifier.webhook_url must be an http(s) URL, got {:?}",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/errsift/config.toml` (~/.config/errsift/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("errsift").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database and results)
    ///
    /// `$XDG_DATA_HOME/errsift/` (~/.local/share/errsift/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("errsift")
    }

    /// Returns the state directory path (for logs and execution history)
    ///
    /// `$XDG_STATE_HOME/errsift/` (~/.local/state/errsift/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("errsift")
    }

    /// Returns the execution history file path
    pub fn history_path() -> PathBuf {
        Self::state_dir().join("executions.jsonl")
    }

    /// Offset store path, honoring `database.path`
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("state.db"))
    }

    /// Results directory, honoring `paths.results_dir`
    pub fn results_dir(&self) -> PathBuf {
        self.paths
            .results_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("results"))
    }

    /// Source inventory path, honoring `paths.sources_file`
    pub fn sources_path(&self) -> PathBuf {
        self.paths
            .sources_file
            .clone()
            .unwrap_or_else(|| xdg_config_home().join("errsift").join("sources.toml"))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
