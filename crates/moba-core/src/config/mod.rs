//! Configuration types for the Moba MCP server.
//!
//! Configuration is read from an optional YAML file (`moba.yaml`) and then
//! overridden by command-line flags and environment variables in the CLI.
//! Every section falls back to defaults, so an empty file is a valid config.

pub mod limits;
pub mod transport;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use limits::LimitsConfig;
pub use transport::{Framing, TransportConfig, TransportKind};

/// Complete Moba configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MobaConfig {
    /// Server identity reported during the handshake.
    #[serde(default)]
    pub server: ServerIdentity,

    /// Transport selection and HTTP behaviour.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Database collaborator settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Metadata catalog settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Concurrency, timeout and query limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Tool argument validation policy.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Name and version reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

/// SQLite database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Open the database read-only.
    #[serde(default = "default_true")]
    pub read_only: bool,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            read_only: true,
            max_connections: default_max_connections(),
        }
    }
}

/// Metadata catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path to the metadata JSON file.
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Tool argument validation policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Reject argument properties that the input schema does not declare.
    #[serde(default)]
    pub strict: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level: trace, debug, info, warn or error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}': use text or json", other)),
        }
    }
}

impl LoggingConfig {
    /// Normalized `tracing` level name, accepting the `warning` and `critical` aliases.
    pub fn normalized_level(&self) -> Result<&'static str, ConfigError> {
        normalize_log_level(&self.level)
    }
}

/// Map a user-supplied level onto a `tracing` level name.
pub fn normalize_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        _ => Err(ConfigError::Invalid {
            field: "logging.level",
            reason: format!(
                "'{}' is not one of trace, debug, info, warn, error",
                level
            ),
        }),
    }
}

impl MobaConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })
    }

    /// Check every value the server relies on at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(invalid("database.path", "cannot be empty"));
        }
        if self.metadata.path.as_os_str().is_empty() {
            return Err(invalid("metadata.path", "cannot be empty"));
        }
        if self.transport.port == 0 {
            return Err(invalid("transport.port", "must be between 1 and 65535"));
        }
        if self.transport.max_message_bytes == 0 {
            return Err(invalid("transport.max_message_bytes", "must be positive"));
        }
        if self.limits.max_query_length == 0 {
            return Err(invalid("limits.max_query_length", "must be positive"));
        }
        if self.limits.max_result_rows == 0 {
            return Err(invalid("limits.max_result_rows", "must be positive"));
        }
        if self.limits.max_concurrent_per_session == 0 {
            return Err(invalid("limits.max_concurrent_per_session", "must be positive"));
        }
        if self.limits.max_concurrent_global == 0 {
            return Err(invalid("limits.max_concurrent_global", "must be positive"));
        }
        if self.limits.replay_buffer_size == 0 {
            return Err(invalid("limits.replay_buffer_size", "must be positive"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections", "must be positive"));
        }
        self.logging.normalized_level()?;
        Ok(())
    }

    /// Absolute database path, resolving relative paths against `base`.
    pub fn resolve_database_path(&self, base: &Path) -> PathBuf {
        resolve(&self.database.path, base)
    }

    /// Absolute metadata path, resolving relative paths against `base`.
    pub fn resolve_metadata_path(&self, base: &Path) -> PathBuf {
        resolve(&self.metadata.path, base)
    }

    /// Override host and port from a server URL such as `http://0.0.0.0:9000/mcp`.
    ///
    /// Returns `false` when the URL cannot be parsed; the config is left untouched.
    pub fn apply_server_url(&mut self, raw: &str) -> bool {
        match url::Url::parse(raw) {
            Ok(parsed) => {
                if let Some(host) = parsed.host_str() {
                    self.transport.host = host.to_string();
                }
                if let Some(port) = parsed.port() {
                    self.transport.port = port;
                }
                true
            }
            Err(e) => {
                tracing::warn!(url = raw, error = %e, "Failed to parse MCP_SERVER_URL");
                false
            }
        }
    }
}

fn resolve(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn default_server_name() -> String {
    "moba-mcp".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("test_data/sample.db")
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("resources/metadata.json")
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
