//! Database collaborator interface.
//!
//! Tool handlers talk to storage exclusively through [`Database`]. Query text
//! and parameters are opaque here; the adapter executes them as given.

use crate::error::DatabaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rows produced by a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryRows {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    pub rows: Vec<Map<String, Value>>,
    /// Whether more rows were available than the limit allowed.
    pub truncated: bool,
}

impl QueryRows {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Column description from schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(rename = "primaryKey")]
    pub primary_key: bool,
}

/// Table description from schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Read/execute interface over the storage engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute a query with positional parameters, returning at most `max_rows` rows.
    async fn execute(
        &self,
        query: &str,
        params: &[Value],
        max_rows: usize,
    ) -> Result<QueryRows, DatabaseError>;

    /// Names of user tables, sorted.
    async fn list_tables(&self) -> Result<Vec<String>, DatabaseError>;

    /// Column layout of one table.
    async fn describe_table(&self, table: &str) -> Result<TableInfo, DatabaseError>;
}
