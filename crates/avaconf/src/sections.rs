//! Per-component configuration sections.
//!
//! Every window, TTL and threshold the bridge uses lives here so nothing is
//! hard-coded in the components. Durations are stored in milliseconds to match
//! the host-facing JSON surface; use the `*_duration()` helpers at call sites.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Outbound message batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Window in milliseconds during which outbound messages coalesce.
    pub batch_window: u64,
}

impl BatchingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.batch_window)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_window: 10,
        }
    }
}

/// Redundant-send suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachingConfig {
    pub enabled: bool,
    /// Milliseconds a sent value is remembered.
    pub ttl: u64,
}

impl CachingConfig {
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: 5_000,
        }
    }
}

/// Remote self-description (OSCQuery-style) service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Open the push stream of value changes after the first discovery.
    pub auto_subscribe: bool,
    /// Avatar identity poll interval in milliseconds.
    pub avatar_poll_interval: u64,
    /// Per-request HTTP timeout in milliseconds.
    pub request_timeout: u64,
}

impl DiscoveryConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn avatar_poll_duration(&self) -> Duration {
        Duration::from_millis(self.avatar_poll_interval)
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 9002,
            auto_subscribe: true,
            avatar_poll_interval: 5_000,
            request_timeout: 3_000,
        }
    }
}

/// Live state tracking of inbound and outbound traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// Minimum milliseconds between outward state-changed notifications.
    pub update_interval: u64,
    /// Milliseconds of history kept per parameter.
    pub history_duration: u64,
    /// Maximum history entries per parameter.
    pub history_limit: usize,
}

impl MonitoringConfig {
    pub fn update_duration(&self) -> Duration {
        Duration::from_millis(self.update_interval)
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_millis(self.history_duration)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval: 100,
            history_duration: 60_000,
            history_limit: 1_000,
        }
    }
}

/// Procedural physics-bone animation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhysBonesConfig {
    pub enabled: bool,
    /// Animation ticks per second.
    pub tick_rate: u32,
}

impl PhysBonesConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

impl Default for PhysBonesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_rate: 60,
        }
    }
}

/// Expression slot rate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpressionsConfig {
    /// Per-slot cooldown in milliseconds.
    pub cooldown: u64,
    /// Rolling spam window in milliseconds.
    pub spam_window: u64,
    /// Holds allowed inside one spam window.
    pub spam_threshold: usize,
    /// Longest accepted combo.
    pub max_combo_steps: usize,
}

impl ExpressionsConfig {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_millis(self.cooldown)
    }

    pub fn spam_window_duration(&self) -> Duration {
        Duration::from_millis(self.spam_window)
    }
}

impl Default for ExpressionsConfig {
    fn default() -> Self {
        Self {
            cooldown: 1_000,
            spam_window: 10_000,
            spam_threshold: 5,
            max_combo_steps: 32,
        }
    }
}

/// Whose avatar switches share a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownType {
    /// One cooldown shared by every chatter.
    #[default]
    Global,
    /// Each chatter has their own cooldown.
    #[serde(alias = "perUser", alias = "per_user")]
    PerUser,
}

/// Who may use a chat command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    All,
    #[serde(alias = "subscribers")]
    Subscriber,
    #[serde(alias = "moderators", alias = "mod")]
    Moderator,
}

/// Chat-triggered avatar switching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvatarSwitchConfig {
    pub enabled: bool,
    pub cooldown_type: CooldownType,
    pub cooldown_seconds: u64,
    pub permission: Permission,
}

impl Default for AvatarSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_type: CooldownType::Global,
            cooldown_seconds: 60,
            permission: Permission::All,
        }
    }
}

/// Chat command handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatCommandsConfig {
    pub enabled: bool,
    /// Per-user cooldown between any two commands.
    pub cooldown_seconds: u64,
    /// Commands a single user may issue per rolling minute.
    pub rate_limit_per_minute: u32,
    pub avatar_switch: AvatarSwitchConfig,
}

impl Default for ChatCommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_seconds: 3,
            rate_limit_per_minute: 10,
            avatar_switch: AvatarSwitchConfig::default(),
        }
    }
}

/// Filesystem paths for persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
    /// Directory holding `presets.json`.
    /// Default: ~/.local/share/avalink
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.data_dir().join("avalink"))
            .unwrap_or_else(|| PathBuf::from(".local/share/avalink"))
    }

    pub fn presets_file(&self) -> PathBuf {
        self.state_dir.join("presets.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Administrative HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminConfig {
    pub enabled: bool,
    /// Socket address to bind, e.g. "127.0.0.1:8470".
    pub bind: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8470".to_string(),
        }
    }
}

/// Logging and trace export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    /// EnvFilter directive, e.g. "info" or "info,avalink=debug".
    pub log_level: String,
    /// OTLP gRPC endpoint; traces are only exported when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            otlp_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_interval_is_sixty_hertz() {
        let ms = PhysBonesConfig::default().tick_interval().as_secs_f64() * 1000.0;
        assert!((ms - 16.666).abs() < 0.01, "got {ms}");
    }

    #[test]
    fn zero_tick_rate_does_not_divide_by_zero() {
        let cfg = PhysBonesConfig {
            enabled: true,
            tick_rate: 0,
        };
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn cooldown_type_accepts_aliases() {
        let parsed: CooldownType = serde_json::from_str("\"perUser\"").unwrap();
        assert_eq!(parsed, CooldownType::PerUser);
        let parsed: CooldownType = serde_json::from_str("\"per-user\"").unwrap();
        assert_eq!(parsed, CooldownType::PerUser);
    }

    #[test]
    fn permission_orders_by_privilege() {
        assert!(Permission::Moderator > Permission::Subscriber);
        assert!(Permission::Subscriber > Permission::All);
    }
}
