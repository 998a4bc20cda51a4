use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub temporary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// How a reconciliation combines the cached and fetched snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// The fetched snapshot replaces the cached one
    #[default]
    ServerAuthority,
    /// Union by id; a cached record survives only if it is newer
    LastWriteWins,
    /// Cached records first, then records only the remote knows
    LocalFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub merge_strategy: MergeStrategy,
    pub tombstone_text: String,
    pub write_log_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: ".workspace_cache".to_string(),
            temporary: false,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321/rest/v1".to_string(),
            api_key: None,
            timeout_secs: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::ServerAuthority,
            tombstone_text: "[message deleted]".to_string(),
            write_log_capacity: 200,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: "local-user".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            format: "text".to_string(),
        }
    }
}

impl RemoteConfig {
    /// Per-call timeout around remote operations
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Self::default())?)
            // Add config files if they exist
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("workspace-sync").required(false))
            // WORKSPACE_SYNC__REMOTE__BASE_URL and friends
            .add_source(Environment::with_prefix("WORKSPACE_SYNC").separator("__"))
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.path.trim().is_empty() && !self.store.temporary {
            return Err(SyncError::InvalidConfig(
                "store.path must be set unless store.temporary is true".to_string(),
            ));
        }

        if self.remote.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote.timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.sync.write_log_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.write_log_capacity must be greater than 0".to_string(),
            ));
        }

        if self.sync.tombstone_text.is_empty() {
            return Err(SyncError::InvalidConfig(
                "sync.tombstone_text cannot be empty".to_string(),
            ));
        }

        if self.session.user_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "session.user_id cannot be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(SyncError::InvalidConfig(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(SyncError::InvalidConfig(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            )));
        }

        Ok(())
    }

    /// Get log level from environment or config
    #[must_use]
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}
