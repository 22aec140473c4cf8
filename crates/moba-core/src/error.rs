//! Error types for the core crate.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the expected shape.
    #[error("failed to parse config{}: {source}", describe_path(.path))]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value failed validation.
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" file {:?}", p))
        .unwrap_or_default()
}

/// Errors raised while loading the metadata catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The metadata file could not be read.
    #[error("failed to read metadata file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The metadata file is not valid JSON for the catalog shape.
    #[error("failed to parse metadata file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors reported by a database collaborator.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database could not be opened.
    #[error("failed to open database: {0}")]
    Connection(String),

    /// The query was rejected or failed during execution.
    #[error("query failed: {0}")]
    Query(String),

    /// The requested table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A parameter could not be bound.
    #[error("unsupported parameter at position {position}: {reason}")]
    Parameter { position: usize, reason: String },
}

impl DatabaseError {
    /// Short classification string preserved on the wire.
    pub fn classification(&self) -> &'static str {
        match self {
            DatabaseError::Connection(_) => "DatabaseUnavailable",
            DatabaseError::Query(_) => "QueryFailed",
            DatabaseError::TableNotFound(_) => "TableNotFound",
            DatabaseError::Parameter { .. } => "InvalidParameter",
        }
    }
}
