//! Daemon configuration.
//!
//! Loaded from a TOML file, then overridden by environment variables and
//! CLI flags. Every field has a default, so an empty (or missing) file is a
//! valid configuration.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::OverflowPolicy;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "KUCHAT_CONFIG";

/// Environment variable overriding `server.listen`
pub const LISTEN_ENV: &str = "KUCHAT_LISTEN";

/// Default listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8731";

/// Top-level daemon config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP address to accept connections on
    pub listen: String,

    /// Time allowed for the identify frame after accept
    pub handshake_timeout_ms: u64,
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound queue
    pub queue_capacity: usize,

    /// Largest accepted inbound message body, in bytes
    pub max_frame_len: usize,

    /// Deadline for a single socket write
    pub write_timeout_ms: u64,

    /// How long a closing writer keeps flushing already-queued payloads
    pub close_drain_ms: u64,

    /// What `Connection::send` does when the queue is full
    pub overflow: OverflowPolicy,
}

/// Registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Maximum number of simultaneously online users
    pub max_connections: usize,

    /// Close connections with no inbound frame for this long (0 = never)
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            handshake_timeout_ms: 5_000,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_frame_len: kuchat_protocol::DEFAULT_MAX_FRAME_LEN,
            write_timeout_ms: 10_000,
            close_drain_ms: 500,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            idle_timeout_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "server.listen: {:?} is not a socket address",
                self.listen
            ))
        })
    }
}

impl ConnectionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn close_drain(&self) -> Duration {
        Duration::from_millis(self.close_drain_ms)
    }
}

impl RegistryConfig {
    /// Returns `None` when idle reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// Lookup order for the file: `path`, then `$KUCHAT_CONFIG`, then
    /// `<config dir>/kuchat/kuchatd.toml` if it exists. Without a file the
    /// defaults are used. `$KUCHAT_LISTEN` is applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file without env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    fn apply_env(&mut self) {
        if let Some(listen) = env::var(LISTEN_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        {
            self.server.listen = listen;
        }
    }

    /// Rejects values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.listen_addr()?;
        if self.connection.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.connection.max_frame_len < kuchat_protocol::KIND_LEN {
            return Err(ConfigError::Invalid(format!(
                "connection.max_frame_len must be at least {}",
                kuchat_protocol::KIND_LEN
            )));
        }
        if self.registry.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "registry.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kuchat").join("kuchatd.toml"))
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_toml(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            handshake_timeout_ms = 1500

            [connection]
            queue_capacity = 8
            overflow = { mode = "block", timeout_ms = 250 }

            [registry]
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.handshake_timeout(), Duration::from_millis(1500));
        assert_eq!(config.connection.queue_capacity, 8);
        assert_eq!(
            config.connection.overflow,
            OverflowPolicy::Block { timeout_ms: 250 }
        );
        assert_eq!(config.registry.idle_timeout(), None);
        assert_eq!(config.registry.max_connections, 10_000);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_toml("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::default();
        config.connection.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let mut config = Config::default();
        config.server.listen = "not-an-address".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.listen"));
    }

    #[test]
    fn test_from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nqueue_capacity = \"many\"").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&rendered).unwrap(), config);
    }
}
