//! Test doubles shared by the handler tests.

use async_trait::async_trait;
use moba_core::{Catalog, ColumnInfo, Database, DatabaseError, QueryRows, TableInfo, TableMetadata};
use moba_mcp::{InvocationContext, RequestId};
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeDatabase {
    pub fail_with: Option<fn() -> DatabaseError>,
    pub delay: Option<Duration>,
    pub(crate) executions: AtomicUsize,
}

impl FakeDatabase {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn execute(
        &self,
        _query: &str,
        _params: &[Value],
        max_rows: usize,
    ) -> Result<QueryRows, DatabaseError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fail) = self.fail_with {
            return Err(fail());
        }
        let rows: Vec<Map<String, Value>> = (1..=2)
            .map(|id| {
                let mut row = Map::new();
                row.insert("id".into(), json!(id));
                row
            })
            .collect();
        Ok(QueryRows {
            columns: vec!["id".into()],
            truncated: rows.len() > max_rows,
            rows: rows.into_iter().take(max_rows).collect(),
        })
    }

    async fn list_tables(&self) -> Result<Vec<String>, DatabaseError> {
        Ok(vec!["events".into(), "user_behavior_metadata".into()])
    }

    async fn describe_table(&self, table: &str) -> Result<TableInfo, DatabaseError> {
        if table != "events" && table != "user_behavior_metadata" {
            return Err(DatabaseError::TableNotFound(table.to_string()));
        }
        Ok(TableInfo {
            name: table.to_string(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                    primary_key: true,
                },
                ColumnInfo {
                    name: "user_id".into(),
                    data_type: "INTEGER".into(),
                    nullable: true,
                    primary_key: false,
                },
            ],
        })
    }
}

pub fn sample_catalog() -> Catalog {
    let mut catalog = Catalog {
        server_name: Some("metadata-mcp-server".into()),
        description: Some("Metadata-only database".into()),
        ..Catalog::default()
    };
    catalog.tables.insert(
        "user_behavior_metadata".into(),
        TableMetadata {
            description: Some("User behavioral analytics".into()),
            columns: vec!["id".into(), "user_id".into()],
            row_count: Some(5),
            foreign_key_reference: Some("user_id -> users.id (in another MCP server)".into()),
        },
    );
    catalog
}

pub fn context(id: i32) -> InvocationContext {
    cancellable_context(id).0
}

pub fn cancellable_context(id: i32) -> (InvocationContext, CancellationToken) {
    let token = CancellationToken::new();
    (
        InvocationContext::new(RequestId::from(id), None, token.clone()),
        token,
    )
}
