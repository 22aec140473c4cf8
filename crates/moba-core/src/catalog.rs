//! Metadata catalog.
//!
//! The catalog is a JSON document describing the tables of the database
//! (descriptions, column lists, row counts, cross-server references). It is
//! loaded once at startup and treated as a read-only lookup table.

use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Structured catalog loaded from the metadata file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub business_use_cases: Vec<String>,

    /// Table descriptions keyed by table name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableMetadata>,

    /// Free-form notes.
    #[serde(default)]
    pub notes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Catalog entry for one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key_reference: Option<String>,
}

impl Catalog {
    /// Load the catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog: Catalog =
            serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!(
            path = %path.display(),
            table_count = catalog.tables.len(),
            "Loaded metadata catalog"
        );
        Ok(catalog)
    }

    /// Look up a table entry.
    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.get(name)
    }

    /// Description of a table, if the catalog has one.
    pub fn describe(&self, name: &str) -> Option<&str> {
        self.table(name).and_then(|t| t.description.as_deref())
    }

    /// Table names known to the catalog, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "server_name": "metadata-mcp-server",
        "description": "Metadata-only database",
        "business_use_cases": ["User behavior analytics"],
        "tables": {
            "user_behavior_metadata": {
                "description": "User behavioral analytics and engagement metrics",
                "columns": ["id", "user_id", "session_count"],
                "row_count": 5,
                "foreign_key_reference": "user_id -> users.id (in another MCP server)"
            }
        },
        "notes": {"data_separation": "metadata only"},
        "last_updated": "2024-05-01T10:00:00",
        "unexpected": true
    }"#;

    #[test]
    fn test_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, SAMPLE).unwrap();

        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.server_name.as_deref(), Some("metadata-mcp-server"));
        assert_eq!(
            catalog.describe("user_behavior_metadata"),
            Some("User behavioral analytics and engagement metrics")
        );
        let table = catalog.table("user_behavior_metadata").unwrap();
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.row_count, Some(5));
        assert!(catalog.describe("missing").is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = Catalog::load("/nonexistent/metadata.json").unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Catalog::load(&path).unwrap_err(),
            CatalogError::Parse { .. }
        ));
    }

    #[test]
    fn test_empty_object_is_valid() {
        let catalog: Catalog = serde_json::from_str("{}").unwrap();
        assert!(catalog.tables.is_empty());
        assert_eq!(catalog.table_names().count(), 0);
    }
}
