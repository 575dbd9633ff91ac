//! Multi-tier TOML configuration for Conduit.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use conduit_broker::BrokerConfig;
use conduit_mcp::McpServerConfig;
use conduit_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Resolved configuration for a Conduit process.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub broker: BrokerConfig,
    pub servers: HashMap<String, McpServerConfig>,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// `[broker]` section of the config file. Unset keys fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub uri: Option<String>,
    pub reply_timeout_ms: Option<u64>,
    pub task_queue: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub broker_uri: Option<String>,
    pub reply_timeout_ms: Option<u64>,
    pub config_dir: Option<PathBuf>,
}

/// The environment variables Conduit reads, captured once.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub broker_uri: Option<String>,
    pub reply_timeout_ms: Option<String>,
    pub config_dir: Option<String>,
}

impl Environment {
    /// Read `CONDUIT_BROKER_URI`, `CONDUIT_REPLY_TIMEOUT_MS` and
    /// `CONDUIT_CONFIG_DIR` from the process environment.
    pub fn from_process() -> Self {
        Self {
            broker_uri: std::env::var("CONDUIT_BROKER_URI").ok(),
            reply_timeout_ms: std::env::var("CONDUIT_REPLY_TIMEOUT_MS").ok(),
            config_dir: std::env::var("CONDUIT_CONFIG_DIR").ok(),
        }
    }
}

impl ConduitConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (~/.conduit/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, Environment::from_process())
    }

    /// [`ConduitConfig::load`] against an explicit environment.
    pub fn resolve(overrides: CliOverrides, env: Environment) -> Result<Self, ConfigError> {
        let config_dir = overrides
            .config_dir
            .or_else(|| env.config_dir.map(PathBuf::from))
            .unwrap_or_else(default_config_dir);
        let settings = load_settings_file(&config_dir.join(CONFIG_FILE));
        let defaults = BrokerConfig::default();

        // Resolve broker URI: CLI > env > config file
        let uri = overrides
            .broker_uri
            .or(env.broker_uri)
            .or(settings.broker.uri)
            .unwrap_or(defaults.uri);

        // Resolve reply timeout: CLI > env > config file
        let env_timeout = env
            .reply_timeout_ms
            .map(|raw| parse_timeout("CONDUIT_REPLY_TIMEOUT_MS", &raw))
            .transpose()?;
        let reply_timeout_ms = overrides
            .reply_timeout_ms
            .or(env_timeout)
            .or(settings.broker.reply_timeout_ms)
            .unwrap_or(defaults.reply_timeout_ms);
        if reply_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reply_timeout_ms".into(),
                message: "must be greater than zero".into(),
            });
        }

        let task_queue = settings.broker.task_queue.unwrap_or(defaults.task_queue);

        Ok(ConduitConfig {
            broker: BrokerConfig {
                uri,
                reply_timeout_ms,
                task_queue,
            },
            servers: settings.servers,
            config_dir,
        })
    }

    /// The configured MCP server called `name`.
    pub fn server(&self, name: &str) -> Result<&McpServerConfig, ConfigError> {
        self.servers.get(name).ok_or_else(|| ConfigError::MissingKey {
            key: format!(
                "servers.{name} (add a [servers.{name}] table to {})",
                self.config_dir.join(CONFIG_FILE).display()
            ),
        })
    }
}

fn parse_timeout(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a number of milliseconds: {e}"),
    })
}

/// Get the default Conduit config directory path (~/.conduit/).
pub fn default_config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conduit")
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dir_with_config(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), content).unwrap();
        dir
    }

    fn overrides_for(dir: &tempfile::TempDir) -> CliOverrides {
        CliOverrides {
            config_dir: Some(dir.path().to_path_buf()),
            ..CliOverrides::default()
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConduitConfig::resolve(overrides_for(&dir), Environment::default()).unwrap();
        assert_eq!(config.broker, BrokerConfig::default());
        assert!(config.servers.is_empty());
        assert_eq!(config.config_dir, dir.path());
    }

    #[test]
    fn test_settings_toml_parse() {
        let dir = dir_with_config(
            r#"
[broker]
uri = "amqp://rabbit:5672/%2f"
reply_timeout_ms = 5000
task_queue = "batch"

[servers.graph]
command = "bun"
args = ["run", "graph-server.ts"]
timeout_ms = 0
"#,
        );
        let config = ConduitConfig::resolve(overrides_for(&dir), Environment::default()).unwrap();
        assert_eq!(config.broker.uri, "amqp://rabbit:5672/%2f");
        assert_eq!(config.broker.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.broker.task_queue, "batch");

        let graph = config.server("graph").unwrap();
        assert_eq!(graph.command, "bun");
        assert_eq!(graph.args, vec!["run", "graph-server.ts"]);
        assert!(graph.request_timeout().is_none());
    }

    #[test]
    fn test_env_beats_file_and_cli_beats_env() {
        let dir = dir_with_config(
            r#"
[broker]
uri = "amqp://from-file"
reply_timeout_ms = 1000
"#,
        );
        let env = Environment {
            broker_uri: Some("amqp://from-env".into()),
            reply_timeout_ms: Some("2000".into()),
            config_dir: None,
        };

        let config = ConduitConfig::resolve(overrides_for(&dir), env.clone()).unwrap();
        assert_eq!(config.broker.uri, "amqp://from-env");
        assert_eq!(config.broker.reply_timeout_ms, 2000);

        let overrides = CliOverrides {
            broker_uri: Some("amqp://from-cli".into()),
            reply_timeout_ms: Some(3000),
            ..overrides_for(&dir)
        };
        let config = ConduitConfig::resolve(overrides, env).unwrap();
        assert_eq!(config.broker.uri, "amqp://from-cli");
        assert_eq!(config.broker.reply_timeout_ms, 3000);
    }

    #[test]
    fn test_config_dir_from_env() {
        let dir = dir_with_config("[servers.echo]\ncommand = \"cat\"\n");
        let env = Environment {
            config_dir: Some(dir.path().display().to_string()),
            ..Environment::default()
        };
        let config = ConduitConfig::resolve(CliOverrides::default(), env).unwrap();
        assert_eq!(config.config_dir, dir.path());
        assert_eq!(config.server("echo").unwrap().command, "cat");
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = dir_with_config("[broker\nuri = ");
        let config = ConduitConfig::resolve(overrides_for(&dir), Environment::default()).unwrap();
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_malformed_env_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment {
            reply_timeout_ms: Some("soon".into()),
            ..Environment::default()
        };
        match ConduitConfig::resolve(overrides_for(&dir), env) {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "CONDUIT_REPLY_TIMEOUT_MS");
            }
            other => panic!("Expected InvalidValue, got: {other:?}"),
        }
    }

    #[test]
    fn test_zero_reply_timeout_is_rejected() {
        let dir = dir_with_config("[broker]\nreply_timeout_ms = 0\n");
        assert!(matches!(
            ConduitConfig::resolve(overrides_for(&dir), Environment::default()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_server_is_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConduitConfig::resolve(overrides_for(&dir), Environment::default()).unwrap();
        match config.server("nope") {
            Err(ConfigError::MissingKey { key }) => assert!(key.starts_with("servers.nope")),
            other => panic!("Expected MissingKey, got: {other:?}"),
        }
    }
}
