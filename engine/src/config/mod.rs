//! Configuration management
//!
//! This module handles loading, validation, and management of the Harvest configuration.
//! Configuration is stored in TOML format at ~/.harvest/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **connection**: Store DSN and pool limits
//! - **plugins**: Plugin install directory, discovery and lifecycle timeouts
//! - **fetch**: Fetch orchestration limits
//! - **hub**: Provider hub location
//! - **providers**: The providers to fetch with, their versions and resources
//!
//! # Path Expansion
//!
//! `~` is expanded to the user's home directory in every path setting. The
//! data directory is created if it doesn't exist.
//!
//! # Examples
//!
//! ```no_run
//! use harvest_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration from default location
//! let config = Config::load_or_create()?;
//!
//! for provider in &config.providers {
//!     println!("{}/{}@{}", provider.source, provider.name, provider.version);
//! }
//! # Ok(())
//! # }
//! ```

use harvest_sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a reattach manifest, overriding `[plugins]`
pub const REATTACH_ENV: &str = "HARVEST_REATTACH_PROVIDERS";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Store connection
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Plugin discovery and lifecycle
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Fetch orchestration
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Provider hub
    #[serde(default)]
    pub hub: HubConfig,

    /// Configured providers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Store DSN, forwarded untouched to providers.
    /// Defaults to `harvest.db` inside the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,

    /// Upper bound of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection (seconds)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// How long SQLite waits on a locked database (seconds)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

/// Plugin discovery and lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Root of installed plugins: `<directory>/<org>/<name>/<version>/`
    #[serde(default = "default_plugin_dir")]
    pub directory: PathBuf,

    /// Attach to already-running providers listed in this manifest instead
    /// of launching them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reattach_manifest: Option<PathBuf>,

    /// Time allowed for a launched plugin to print its handshake (seconds)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Time allowed for a reattach manifest to become available (seconds)
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout_secs: u64,

    /// Time allowed for the connectivity probe (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Time a managed plugin gets to exit after SIGTERM (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Fetch orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Providers fetched at the same time
    #[serde(default = "default_max_parallel_providers")]
    pub max_parallel_providers: usize,
}

/// Provider hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Base URL of the hosted catalog
    #[serde(default = "default_hub_url")]
    pub url: String,

    /// Skip the hosted catalog and accept every provider
    #[serde(default)]
    pub offline: bool,
}

/// One configured provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name
    pub name: String,

    /// Owning organization
    #[serde(default = "default_source")]
    pub source: String,

    /// Semantic version, `v` prefix accepted
    pub version: String,

    /// Resources to fetch
    #[serde(default)]
    pub resources: Vec<String>,

    /// Provider specific configuration block, forwarded as is
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub configuration: serde_json::Value,
}

impl ProviderConfig {
    /// Provider with no resources selected and an empty configuration
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: default_source(),
            version: version.into(),
            resources: Vec::new(),
            configuration: serde_json::Value::Null,
        }
    }

    /// Select resources to fetch
    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

impl ConnectionConfig {
    /// Connection to an explicit DSN with default limits
    pub fn with_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugin_dir(),
            reattach_manifest: None,
            handshake_timeout_secs: default_handshake_timeout(),
            attach_timeout_secs: default_attach_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl PluginsConfig {
    /// Reattach manifest to use, the environment taking precedence
    pub fn reattach_manifest_path(&self) -> Option<PathBuf> {
        std::env::var_os(REATTACH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.reattach_manifest.clone())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_parallel_providers: default_max_parallel_providers(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            offline: false,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.harvest")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("~/.harvest/plugins")
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_busy_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_attach_timeout() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_max_parallel_providers() -> usize {
    4
}

fn default_hub_url() -> String {
    harvest_hub::registry::DEFAULT_HUB_URL.to_string()
}

fn default_source() -> String {
    "harvest".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            connection: ConnectionConfig::default(),
            plugins: PluginsConfig::default(),
            fetch: FetchConfig::default(),
            hub: HubConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.harvest/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    /// Validates the configuration after loading and returns descriptive errors
    /// if validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate a configuration document
    pub fn from_toml(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable `~` paths
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.harvest/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".harvest").join("config.toml"))
    }

    /// Store DSN, falling back to `harvest.db` in the data directory
    pub fn dsn(&self) -> String {
        match &self.connection.dsn {
            Some(dsn) => dsn.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.core.data_dir.join("harvest.db").display()
            ),
        }
    }

    /// Look up a configured provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level and numeric limits
    /// - Validates provider names and versions
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        // Validate log level
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        // Validate limits
        if self.connection.max_connections == 0 {
            return Err(EngineError::Config(
                "connection.max_connections must be at least 1".to_string(),
            ));
        }
        if self.fetch.max_parallel_providers == 0 {
            return Err(EngineError::Config(
                "fetch.max_parallel_providers must be at least 1".to_string(),
            ));
        }
        if self.plugins.handshake_timeout_secs == 0
            || self.plugins.attach_timeout_secs == 0
            || self.plugins.probe_timeout_secs == 0
        {
            return Err(EngineError::Config(
                "plugin timeouts must be at least 1 second".to_string(),
            ));
        }

        // Validate providers
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() || provider.source.is_empty() {
                return Err(EngineError::Config(
                    "providers need a non-empty name and source".to_string(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "provider '{}' is configured more than once",
                    provider.name
                )));
            }
            parse_version(&provider.version).map_err(|e| {
                EngineError::Config(format!(
                    "provider '{}' has invalid version '{}': {}",
                    provider.name, provider.version, e
                ))
            })?;
        }

        // Expand paths
        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.plugins.directory = expand_path(&self.plugins.directory)?;
        if let Some(manifest) = &self.plugins.reattach_manifest {
            self.plugins.reattach_manifest = Some(expand_path(manifest)?);
        }

        // Create data directory if it doesn't exist
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Parse a provider version, accepting a leading `v`
pub fn parse_version(version: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(version.strip_prefix('v').unwrap_or(version))
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
