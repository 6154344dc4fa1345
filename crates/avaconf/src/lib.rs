//! Configuration loading for avalink.
//!
//! A [`BridgeConfig`] is an immutable snapshot: components receive an
//! `Arc<BridgeConfig>` at construction and never mutate it. A config update
//! builds a new snapshot and the bridge runs a stop/reconfigure/restart cycle.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, tables are merged key by key):
//! 1. `/etc/avalink/config.toml` (system)
//! 2. `~/.config/avalink/config.toml` (user)
//! 3. `./avalink.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`AVALINK_*`)
//!
//! # Example Config
//!
//! ```toml
//! sendHost = "127.0.0.1"
//! sendPort = 9000
//! receivePort = 9001
//!
//! [messageBatching]
//! batchWindow = 10
//!
//! [discovery]
//! port = 9002
//!
//! [[giftMappings]]
//! giftId = 5655
//! giftName = "Rose"
//! action = "hearts"
//! params = { duration = 2000 }
//!
//! [[avatars]]
//! id = "avtr_c38a1615-5bf5-42b4-84eb-a8b6c37cbd11"
//! name = "Fox"
//! ```

pub mod loader;
pub mod mappings;
pub mod sections;

pub use loader::{discover_config_files, discover_config_files_with_override, ConfigSources};
pub use mappings::{ActionParams, AvatarEntry, ConfigValue, GiftAction, GiftMapping};
pub use sections::{
    AdminConfig, AvatarSwitchConfig, BatchingConfig, CachingConfig, ChatCommandsConfig,
    CooldownType, DiscoveryConfig, ExpressionsConfig, MonitoringConfig, PathsConfig, Permission,
    PhysBonesConfig, TelemetryConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bridge configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// Remote application host that receives our messages.
    pub send_host: String,
    pub send_port: u16,
    /// Local UDP port we listen on; 0 picks an ephemeral port.
    pub receive_port: u16,
    /// Log every inbound and outbound message at debug level.
    pub verbose_mode: bool,
    /// Move to the next port / restart after bind failures.
    pub auto_retry_on_error: bool,
    /// Milliseconds between bind attempts and bridge restarts.
    pub retry_delay: u64,
    /// Bind attempts before the bridge enters the error state.
    pub max_bind_retries: u32,
    pub message_batching: BatchingConfig,
    pub parameter_caching: CachingConfig,
    pub discovery: DiscoveryConfig,
    pub live_monitoring: MonitoringConfig,
    pub physics_bones: PhysBonesConfig,
    pub expressions: ExpressionsConfig,
    pub chat_commands: ChatCommandsConfig,
    pub gift_mappings: Vec<GiftMapping>,
    pub avatars: Vec<AvatarEntry>,
    pub paths: PathsConfig,
    pub admin: AdminConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_host: "127.0.0.1".to_string(),
            send_port: 9000,
            receive_port: 9001,
            verbose_mode: false,
            auto_retry_on_error: true,
            retry_delay: 5_000,
            max_bind_retries: 5,
            message_batching: BatchingConfig::default(),
            parameter_caching: CachingConfig::default(),
            discovery: DiscoveryConfig::default(),
            live_monitoring: MonitoringConfig::default(),
            physics_bones: PhysBonesConfig::default(),
            expressions: ExpressionsConfig::default(),
            chat_commands: ChatCommandsConfig::default(),
            gift_mappings: Vec::new(),
            avatars: Vec::new(),
            paths: PathsConfig::default(),
            admin: AdminConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional CLI path replacing `./avalink.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::table_to_config(merged, sources.files.last())?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document (no discovery, no env overrides).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        let config = loader::table_to_config(table, None)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML, suitable for `avalink config show`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_host.trim().is_empty() {
            return Err(ConfigError::Invalid("sendHost must not be empty".into()));
        }
        if self.send_port == 0 {
            return Err(ConfigError::Invalid("sendPort must be non-zero".into()));
        }
        if self.message_batching.enabled
            && !(1..=1_000).contains(&self.message_batching.batch_window)
        {
            return Err(ConfigError::Invalid(format!(
                "messageBatching.batchWindow must be 1..=1000 ms, got {}",
                self.message_batching.batch_window
            )));
        }
        if self.parameter_caching.enabled && self.parameter_caching.ttl == 0 {
            return Err(ConfigError::Invalid("parameterCaching.ttl must be non-zero".into()));
        }
        if self.live_monitoring.update_interval == 0 {
            return Err(ConfigError::Invalid(
                "liveMonitoring.updateInterval must be non-zero".into(),
            ));
        }
        if self.live_monitoring.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "liveMonitoring.historyLimit must be non-zero".into(),
            ));
        }
        if !(1..=240).contains(&self.physics_bones.tick_rate) {
            return Err(ConfigError::Invalid(format!(
                "physicsBones.tickRate must be 1..=240, got {}",
                self.physics_bones.tick_rate
            )));
        }
        if self.expressions.spam_threshold == 0 {
            return Err(ConfigError::Invalid(
                "expressions.spamThreshold must be non-zero".into(),
            ));
        }
        if self.discovery.enabled && self.discovery.avatar_poll_interval == 0 {
            return Err(ConfigError::Invalid(
                "discovery.avatarPollInterval must be non-zero".into(),
            ));
        }
        for (i, mapping) in self.gift_mappings.iter().enumerate() {
            if mapping.gift_id.is_none() && mapping.gift_name.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "giftMappings[{i}] needs a giftId or giftName"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    /// Look up a configured avatar by name, alias or id.
    pub fn find_avatar(&self, query: &str) -> Option<&AvatarEntry> {
        self.avatars.iter().find(|a| a.matches(query))
    }
}
