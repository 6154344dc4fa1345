//! Config file discovery, loading, merging and environment variable overlay.

use crate::{BridgeConfig, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/avalink/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("avalink/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("avalink.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load one file as a complete config (defaults fill missing keys).
pub fn load_from_file(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let table = load_table(path)?;
    table_to_config(table, Some(&path.to_path_buf()))
}

/// Deserialize a merged table; missing keys take their defaults.
pub fn table_to_config(
    table: toml::Table,
    origin: Option<&PathBuf>,
) -> Result<BridgeConfig, ConfigError> {
    BridgeConfig::deserialize(toml::Value::Table(table)).map_err(|e| ConfigError::Parse {
        path: origin.cloned().unwrap_or_else(|| PathBuf::from("<merged>")),
        message: e.to_string(),
    })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; everything
/// else, arrays included, is replaced wholesale.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let toml::Value::Table(incoming) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, toml::Value::Table(incoming));
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut BridgeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("AVALINK_SEND_HOST") {
        config.send_host = v;
        sources.env_overrides.push("AVALINK_SEND_HOST".to_string());
    }
    if let Ok(v) = env::var("AVALINK_SEND_PORT") {
        if let Ok(port) = v.parse() {
            config.send_port = port;
            sources.env_overrides.push("AVALINK_SEND_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("AVALINK_RECEIVE_PORT") {
        if let Ok(port) = v.parse() {
            config.receive_port = port;
            sources.env_overrides.push("AVALINK_RECEIVE_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("AVALINK_DISCOVERY_HOST") {
        config.discovery.host = v;
        sources.env_overrides.push("AVALINK_DISCOVERY_HOST".to_string());
    }
    if let Ok(v) = env::var("AVALINK_DISCOVERY_PORT") {
        if let Ok(port) = v.parse() {
            config.discovery.port = port;
            sources.env_overrides.push("AVALINK_DISCOVERY_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("AVALINK_ADMIN_BIND") {
        config.admin.bind = v;
        sources.env_overrides.push("AVALINK_ADMIN_BIND".to_string());
    }
    if let Ok(v) = env::var("AVALINK_STATE_DIR") {
        config.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("AVALINK_STATE_DIR".to_string());
    }

    if let Ok(v) = env::var("AVALINK_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("AVALINK_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
    // Also support standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
}

/// Expand `~` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
sendHost = "10.0.0.5"
receivePort = 9011

[parameterCaching]
ttl = 2500

[chatCommands.avatarSwitch]
cooldownType = "per-user"
permission = "subscriber"
"#
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.send_host, "10.0.0.5");
        assert_eq!(config.receive_port, 9011);
        assert_eq!(config.parameter_caching.ttl, 2500);
        assert!(config.parameter_caching.enabled);
        assert_eq!(
            config.chat_commands.avatar_switch.permission,
            crate::Permission::Subscriber
        );
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sendPort = \"not a port\"").unwrap();

        match load_from_file(file.path()) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_tables_nested_and_replace() {
        let mut base: toml::Table = r#"
sendPort = 9000
[discovery]
host = "127.0.0.1"
port = 9002
[[avatars]]
id = "a"
name = "A"
"#
        .parse()
        .unwrap();

        let overlay: toml::Table = r#"
[discovery]
port = 9400
[[avatars]]
id = "b"
name = "B"
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = table_to_config(base, None).unwrap();

        assert_eq!(config.send_port, 9000);
        assert_eq!(config.discovery.host, "127.0.0.1");
        assert_eq!(config.discovery.port, 9400);
        assert_eq!(config.avatars.len(), 1);
        assert_eq!(config.avatars[0].id, "b");
    }

    #[test]
    fn test_cli_override_is_last() {
        let file = NamedTempFile::new().unwrap();
        let files = discover_config_files_with_override(Some(file.path()));
        assert_eq!(files.last().map(PathBuf::as_path), Some(file.path()));
    }

    #[test]
    fn test_expand_path_leaves_absolute_alone() {
        assert_eq!(expand_path("/var/lib/avalink"), PathBuf::from("/var/lib/avalink"));
    }
}
