use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Remote API and sync timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the records API (e.g., "https://api.example.com/api")
    pub api_url: Option<String>,
    /// Bearer token for the API
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// URLs probed to confirm reachability (default: `<api_url>/health`)
    pub probe_urls: Vec<String>,
    /// Per-request timeout for API calls and probes
    pub request_timeout_secs: u64,
    /// Wait after a reconnect before draining, to ride out flapping links
    pub settle_delay_ms: u64,
    /// Period of the background drain timer
    pub periodic_interval_secs: u64,
    /// Minimum spacing between two drain attempts from any trigger
    pub min_spacing_secs: u64,
    /// Extra attempts of the post-reconnect refresh when it fails
    pub refresh_retries: u32,
    /// Fixed delay between refresh attempts
    pub refresh_retry_delay_ms: u64,
    /// How often `watch` probes the API when no platform link events exist
    pub link_poll_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            probe_urls: Vec::new(),
            request_timeout_secs: 10,
            settle_delay_ms: 1_000,
            periodic_interval_secs: 600,
            min_spacing_secs: 300,
            refresh_retries: 2,
            refresh_retry_delay_ms: 2_000,
            link_poll_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Returns true if a remote API is configured
    pub fn is_configured(&self) -> bool {
        self.api_url.is_some()
    }

    /// Probe URLs, falling back to the API health endpoint
    pub fn effective_probe_urls(&self) -> Vec<String> {
        if !self.probe_urls.is_empty() {
            return self.probe_urls.clone();
        }
        match &self.api_url {
            Some(url) => vec![format!("{}/health", url.trim_end_matches('/'))],
            None => Vec::new(),
        }
    }

    /// Resolves the timings. Timeouts and timer periods are at least one second.
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            periodic_interval: Duration::from_secs(self.periodic_interval_secs.max(1)),
            min_spacing: Duration::from_secs(self.min_spacing_secs),
            refresh_retries: self.refresh_retries,
            refresh_retry_delay: Duration::from_millis(self.refresh_retry_delay_ms),
            link_poll: Duration::from_secs(self.link_poll_secs.max(1)),
        }
    }
}

/// Sync timings resolved to durations.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub request_timeout: Duration,
    pub settle_delay: Duration,
    pub periodic_interval: Duration,
    pub min_spacing: Duration,
    pub refresh_retries: u32,
    pub refresh_retry_delay: Duration,
    pub link_poll: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncConfig::default().settings()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Patient profile whose records are read and written
    pub scope_id: ConfigValue<Option<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    scope_id: Option<String>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let default_db_path = Self::default_data_dir().join("medsync.db");

        // Start with defaults
        let mut database_path = ConfigValue::new(default_db_path, ConfigSource::Default);
        let mut scope_id = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(scope) = file_config.scope_id {
                scope_id = ConfigValue::new(Some(scope), ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("MEDSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(scope) = std::env::var("MEDSYNC_SCOPE_ID") {
            scope_id = ConfigValue::new(Some(scope), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("MEDSYNC_API_URL") {
            sync.api_url = Some(url);
        }
        if let Ok(token) = std::env::var("MEDSYNC_API_TOKEN") {
            sync.api_token = Some(token);
        }

        Ok(Self {
            database_path,
            scope_id,
            config_file,
            sync,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/medsync/
    /// - macOS: ~/Library/Application Support/medsync/
    /// - Windows: %APPDATA%/medsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/medsync/
    /// - macOS: ~/Library/Application Support/medsync/
    /// - Windows: %APPDATA%/medsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
