use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::window::parse_timestamp;

/// Main configuration structure for orgmirror
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// GitHub organization and authentication settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Incremental sync behaviour
    #[serde(default)]
    pub sync: SyncConfig,

    /// Mirror database location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Organization login to mirror
    #[serde(default)]
    pub organization: String,

    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// GraphQL endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Repository exclusion patterns
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Global lower bound (RFC 3339); per-resource watermarks take precedence
    #[serde(default)]
    pub since: Option<String>,

    /// Global upper bound (RFC 3339), exclusive
    #[serde(default)]
    pub until: Option<String>,

    /// Nodes requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Attempts per request for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Project board whose status transitions are recorded as history
    #[serde(default)]
    pub target_project: Option<String>,

    /// Name of the project field holding the status
    #[serde(default = "default_status_field")]
    pub status_field: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite file path
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty"
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com/graphql".to_string()
}
fn default_page_size() -> u32 {
    50
}
fn default_max_attempts() -> u32 {
    crate::executor::DEFAULT_MAX_ATTEMPTS
}
fn default_status_field() -> String {
    "Status".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_database_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/orgmirror/mirror.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/orgmirror/mirror.db", home)
    } else {
        "/tmp/orgmirror/mirror.db".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            organization: String::new(),
            auth_method: default_auth_method(),
            api_url: default_api_url(),
            exclude_patterns: vec!["archived-*".to_string(), "*.github.io".to_string()],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            target_project: None,
            status_field: default_status_field(),
            request_timeout_secs: default_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("orgmirror").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.database.path = shellexpand::full(&self.database.path)
            .context("Failed to expand database path")?
            .into_owned();

        Ok(())
    }

    /// Parsed global lower bound
    pub fn since(&self) -> Result<Option<DateTime<Utc>>> {
        parse_bound("sync.since", self.sync.since.as_deref())
    }

    /// Parsed global upper bound
    pub fn until(&self) -> Result<Option<DateTime<Utc>>> {
        parse_bound("sync.until", self.sync.until.as_deref())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.github.organization.trim().is_empty() {
            return Err(SyncError::validation("github.organization is not set").into());
        }
        if !(1..=100).contains(&self.sync.page_size) {
            return Err(SyncError::validation(format!(
                "sync.page_size must be between 1 and 100, got {}",
                self.sync.page_size
            ))
            .into());
        }
        if self.sync.max_attempts == 0 {
            return Err(SyncError::validation("sync.max_attempts must be at least 1").into());
        }
        if let (Some(since), Some(until)) = (self.since()?, self.until()?) {
            if since >= until {
                return Err(SyncError::validation(format!(
                    "sync.since ({}) must be earlier than sync.until ({})",
                    since, until
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Check if repository name matches any exclusion pattern
    pub fn is_excluded(&self, name: &str) -> bool {
        self.github.exclude_patterns.iter().any(|pattern| {
            // Simple glob pattern matching
            if pattern.contains('*') {
                let pattern_regex = regex::escape(pattern).replace(r"\*", ".*");

                regex::Regex::new(&format!("^{}$", pattern_regex))
                    .map(|re| re.is_match(name))
                    .unwrap_or(false)
            } else {
                name == pattern
            }
        })
    }
}

/// Parse an optional RFC 3339 bound, naming `key` in the error.
pub fn parse_bound(key: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw).map(Some).ok_or_else(|| {
            SyncError::validation(format!("{} is not an RFC 3339 timestamp: {}", key, raw)).into()
        }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            sync: SyncConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
