//! # moba-core
//!
//! Types shared by every Moba crate: configuration, the metadata catalog and
//! the database collaborator interface consumed by tool handlers.

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;

pub use catalog::{Catalog, TableMetadata};
pub use config::{
    DatabaseConfig, Framing, LimitsConfig, LogFormat, LoggingConfig, MetadataConfig, MobaConfig,
    ServerIdentity, TransportConfig, TransportKind, ValidationConfig,
};
pub use database::{ColumnInfo, Database, QueryRows, TableInfo};
pub use error::{CatalogError, ConfigError, DatabaseError};
