//! Tool handlers over the database and the metadata catalog.

use crate::guard::check_query;
use crate::{ToolOptions, database_error};
use async_trait::async_trait;
use moba_core::{Catalog, Database};
use moba_mcp::{HandlerError, InvocationContext, ToolHandler};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

pub const LIST_TABLES: &str = "listTables";
pub const DESCRIBE_TABLE: &str = "describeTable";
pub const RUN_QUERY: &str = "runQuery";
pub const GET_METADATA: &str = "getMetadata";

pub fn list_tables_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn describe_table_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "table": {
                "type": "string",
                "minLength": 1,
                "description": "Name of the table to describe"
            }
        },
        "required": ["table"]
    })
}

pub fn run_query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "minLength": 1,
                "description": "A single SELECT, WITH, EXPLAIN, PRAGMA or VALUES statement"
            },
            "params": {
                "type": "array",
                "description": "Positional parameters bound to ? placeholders",
                "items": { "type": ["string", "number", "integer", "boolean", "null"] }
            }
        },
        "required": ["sql"]
    })
}

pub fn get_metadata_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Lists database tables annotated with catalog descriptions.
pub struct ListTables {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) catalog: Arc<Catalog>,
}

#[async_trait]
impl ToolHandler for ListTables {
    async fn invoke(&self, _arguments: Value, ctx: InvocationContext) -> Result<Value, HandlerError> {
        let names = self.db.list_tables().await.map_err(database_error)?;
        ctx.check_cancelled()?;

        let tables: Vec<Value> = names
            .iter()
            .map(|name| {
                let mut entry = Map::new();
                entry.insert("name".into(), Value::from(name.as_str()));
                if let Some(meta) = self.catalog.table(name) {
                    if let Some(description) = &meta.description {
                        entry.insert("description".into(), Value::from(description.as_str()));
                    }
                    if let Some(rows) = meta.row_count {
                        entry.insert("rowCount".into(), Value::from(rows));
                    }
                }
                Value::Object(entry)
            })
            .collect();

        debug!(table_count = tables.len(), "Listed tables");
        Ok(Value::Array(tables))
    }
}

#[derive(Debug, Deserialize)]
struct DescribeTableArgs {
    table: String,
}

/// Column layout of one table plus its catalog entry.
pub struct DescribeTable {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) catalog: Arc<Catalog>,
}

#[async_trait]
impl ToolHandler for DescribeTable {
    async fn invoke(&self, arguments: Value, _ctx: InvocationContext) -> Result<Value, HandlerError> {
        let args: DescribeTableArgs = parse_arguments(arguments)?;
        let info = self
            .db
            .describe_table(&args.table)
            .await
            .map_err(database_error)?;

        let mut result = Map::new();
        result.insert("table".into(), Value::from(info.name));
        let meta = self.catalog.table(&args.table);
        if let Some(description) = meta.and_then(|m| m.description.as_deref()) {
            result.insert("description".into(), Value::from(description));
        }
        result.insert(
            "columns".into(),
            serde_json::to_value(&info.columns)
                .map_err(|e| HandlerError::new("Internal", e.to_string()))?,
        );
        if let Some(reference) = meta.and_then(|m| m.foreign_key_reference.as_deref()) {
            result.insert("foreignKeyReference".into(), Value::from(reference));
        }
        Ok(Value::Object(result))
    }
}

#[derive(Debug, Deserialize)]
struct RunQueryArgs {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// Executes one read statement.
pub struct RunQuery {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) options: ToolOptions,
}

#[async_trait]
impl ToolHandler for RunQuery {
    async fn invoke(&self, arguments: Value, ctx: InvocationContext) -> Result<Value, HandlerError> {
        let args: RunQueryArgs = parse_arguments(arguments)?;
        check_query(&args.sql, self.options.max_query_length)?;

        let rows = tokio::select! {
            _ = ctx.cancelled() => return Err(HandlerError::cancelled()),
            result = self.db.execute(&args.sql, &args.params, self.options.max_result_rows) => {
                result.map_err(database_error)?
            }
        };

        debug!(
            request_id = %ctx.request_id,
            row_count = rows.row_count(),
            truncated = rows.truncated,
            elapsed_ms = ctx.started_at.elapsed().as_millis() as u64,
            "Query executed"
        );
        Ok(json!({
            "columns": rows.columns,
            "rowCount": rows.rows.len(),
            "truncated": rows.truncated,
            "rows": rows.rows,
        }))
    }
}

/// Summary of the metadata catalog.
pub struct GetMetadata {
    pub(crate) catalog: Arc<Catalog>,
}

#[async_trait]
impl ToolHandler for GetMetadata {
    async fn invoke(&self, _arguments: Value, _ctx: InvocationContext) -> Result<Value, HandlerError> {
        Ok(catalog_summary(&self.catalog))
    }
}

pub(crate) fn catalog_summary(catalog: &Catalog) -> Value {
    json!({
        "serverName": catalog.server_name,
        "description": catalog.description,
        "businessUseCases": catalog.business_use_cases,
        "tables": catalog.table_names().collect::<Vec<_>>(),
        "tableCount": catalog.tables.len(),
        "notes": catalog.notes,
        "lastUpdated": catalog.last_updated,
    })
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, HandlerError> {
    serde_json::from_value(arguments).map_err(|e| HandlerError::new("InvalidArguments", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDatabase, context, sample_catalog};
    use moba_core::DatabaseError;

    fn db() -> Arc<dyn Database> {
        Arc::new(FakeDatabase::default())
    }

    #[tokio::test]
    async fn test_list_tables_merges_catalog() {
        let tool = ListTables {
            db: db(),
            catalog: Arc::new(sample_catalog()),
        };
        let result = tool.invoke(json!({}), context(1)).await.unwrap();
        assert_eq!(
            result,
            json!([
                { "name": "events" },
                {
                    "name": "user_behavior_metadata",
                    "description": "User behavioral analytics",
                    "rowCount": 5
                }
            ])
        );
    }

    #[tokio::test]
    async fn test_describe_table() {
        let tool = DescribeTable {
            db: db(),
            catalog: Arc::new(sample_catalog()),
        };
        let result = tool
            .invoke(json!({ "table": "user_behavior_metadata" }), context(1))
            .await
            .unwrap();
        assert_eq!(result["table"], "user_behavior_metadata");
        assert_eq!(result["columns"][0]["name"], "id");
        assert_eq!(result["columns"][0]["primaryKey"], true);
        assert_eq!(
            result["foreignKeyReference"],
            "user_id -> users.id (in another MCP server)"
        );

        let err = tool
            .invoke(json!({ "table": "missing" }), context(2))
            .await
            .unwrap_err();
        assert_eq!(err.classification, "TableNotFound");
    }

    #[tokio::test]
    async fn test_run_query_shapes_rows() {
        let tool = RunQuery {
            db: db(),
            options: ToolOptions::default(),
        };
        let result = tool
            .invoke(json!({ "sql": "SELECT id FROM events", "params": [1] }), context(1))
            .await
            .unwrap();
        assert_eq!(result["columns"], json!(["id"]));
        assert_eq!(result["rowCount"], 2);
        assert_eq!(result["truncated"], false);
        assert_eq!(result["rows"][1]["id"], 2);
    }

    #[tokio::test]
    async fn test_run_query_rejects_before_execution() {
        let fake = Arc::new(FakeDatabase::default());
        let tool = RunQuery {
            db: fake.clone(),
            options: ToolOptions {
                max_query_length: 20,
                ..ToolOptions::default()
            },
        };

        let err = tool
            .invoke(json!({ "sql": "DELETE FROM events" }), context(1))
            .await
            .unwrap_err();
        assert_eq!(err.classification, "QueryRejected");

        let err = tool
            .invoke(
                json!({ "sql": "SELECT * FROM events WHERE id > 100" }),
                context(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.classification, "QueryRejected");
        assert_eq!(fake.executions(), 0);
    }

    #[tokio::test]
    async fn test_run_query_propagates_database_classification() {
        let fake = FakeDatabase {
            fail_with: Some(|| DatabaseError::Query("no such table: nope".into())),
            ..FakeDatabase::default()
        };
        let tool = RunQuery {
            db: Arc::new(fake),
            options: ToolOptions::default(),
        };
        let err = tool
            .invoke(json!({ "sql": "SELECT * FROM nope" }), context(1))
            .await
            .unwrap_err();
        assert_eq!(err.classification, "QueryFailed");
        assert!(err.message.contains("no such table"));
    }

    #[tokio::test]
    async fn test_run_query_observes_cancellation() {
        let fake = FakeDatabase {
            delay: Some(std::time::Duration::from_secs(30)),
            ..FakeDatabase::default()
        };
        let tool = RunQuery {
            db: Arc::new(fake),
            options: ToolOptions::default(),
        };
        let (ctx, token) = crate::testing::cancellable_context(1);
        let call = tokio::spawn(async move { tool.invoke(json!({ "sql": "SELECT 1" }), ctx).await });
        tokio::task::yield_now().await;
        token.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_get_metadata_summary() {
        let tool = GetMetadata {
            catalog: Arc::new(sample_catalog()),
        };
        let result = tool.invoke(json!({}), context(1)).await.unwrap();
        assert_eq!(result["serverName"], "metadata-mcp-server");
        assert_eq!(result["tableCount"], 1);
        assert_eq!(result["tables"], json!(["user_behavior_metadata"]));
    }
}
