//! Resource handlers.
//!
//! | URI | Contents |
//! |-----|----------|
//! | `metadata://catalog` | the whole catalog document |
//! | `metadata://tables/{table}` | one catalog entry (subscribable) |
//! | `schema://tables/{table}` | live column layout from the database |

use crate::database_error;
use async_trait::async_trait;
use moba_core::{Catalog, Database};
use moba_mcp::{HandlerError, InvocationContext, ResourceContents, ResourceHandler, TemplateVars};
use serde_json::Value;
use std::sync::Arc;

pub const CATALOG_URI: &str = "metadata://catalog";
pub const TABLE_METADATA_TEMPLATE: &str = "metadata://tables/{table}";
pub const TABLE_SCHEMA_TEMPLATE: &str = "schema://tables/{table}";

pub struct CatalogResource {
    pub(crate) catalog: Arc<Catalog>,
}

#[async_trait]
impl ResourceHandler for CatalogResource {
    async fn read(
        &self,
        uri: &str,
        _vars: TemplateVars,
        _ctx: InvocationContext,
    ) -> Result<Vec<ResourceContents>, HandlerError> {
        Ok(vec![ResourceContents::json(uri, &to_json(&*self.catalog)?)])
    }
}

pub struct TableMetadataResource {
    pub(crate) catalog: Arc<Catalog>,
}

#[async_trait]
impl ResourceHandler for TableMetadataResource {
    async fn read(
        &self,
        uri: &str,
        vars: TemplateVars,
        _ctx: InvocationContext,
    ) -> Result<Vec<ResourceContents>, HandlerError> {
        let table = table_var(&vars)?;
        let meta = self.catalog.table(table).ok_or_else(|| {
            HandlerError::new("TableNotFound", format!("no catalog entry for table {}", table))
        })?;
        Ok(vec![ResourceContents::json(uri, &to_json(meta)?)])
    }
}

pub struct TableSchemaResource {
    pub(crate) db: Arc<dyn Database>,
}

#[async_trait]
impl ResourceHandler for TableSchemaResource {
    async fn read(
        &self,
        uri: &str,
        vars: TemplateVars,
        ctx: InvocationContext,
    ) -> Result<Vec<ResourceContents>, HandlerError> {
        let table = table_var(&vars)?;
        let info = self.db.describe_table(table).await.map_err(database_error)?;
        ctx.check_cancelled()?;
        Ok(vec![ResourceContents::json(uri, &to_json(&info)?)])
    }
}

fn table_var(vars: &TemplateVars) -> Result<&str, HandlerError> {
    vars.get("table")
        .map(String::as_str)
        .ok_or_else(|| HandlerError::new("InvalidUri", "missing table name"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| HandlerError::new("Internal", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDatabase, context, sample_catalog};

    fn vars(table: &str) -> TemplateVars {
        TemplateVars::from([("table".to_string(), table.to_string())])
    }

    #[tokio::test]
    async fn test_catalog_resource() {
        let resource = CatalogResource {
            catalog: Arc::new(sample_catalog()),
        };
        let contents = resource
            .read(CATALOG_URI, TemplateVars::new(), context(1))
            .await
            .unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].uri, CATALOG_URI);
        assert_eq!(contents[0].mime_type.as_deref(), Some("application/json"));
        let doc: Value = serde_json::from_str(&contents[0].text).unwrap();
        assert_eq!(doc["server_name"], "metadata-mcp-server");
    }

    #[tokio::test]
    async fn test_table_metadata_resource() {
        let resource = TableMetadataResource {
            catalog: Arc::new(sample_catalog()),
        };
        let uri = "metadata://tables/user_behavior_metadata";
        let contents = resource
            .read(uri, vars("user_behavior_metadata"), context(1))
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&contents[0].text).unwrap();
        assert_eq!(doc["row_count"], 5);

        let err = resource
            .read("metadata://tables/nope", vars("nope"), context(2))
            .await
            .unwrap_err();
        assert_eq!(err.classification, "TableNotFound");
    }

    #[tokio::test]
    async fn test_table_schema_resource() {
        let resource = TableSchemaResource {
            db: Arc::new(FakeDatabase::default()),
        };
        let contents = resource
            .read("schema://tables/events", vars("events"), context(1))
            .await
            .unwrap();
        let doc: Value = serde_json::from_str(&contents[0].text).unwrap();
        assert_eq!(doc["name"], "events");
        assert_eq!(doc["columns"][0]["type"], "INTEGER");
    }
}
