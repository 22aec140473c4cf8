//! # moba-tools
//!
//! Tools and resources served by Moba: read access to the SQLite database
//! and to the metadata catalog that describes it.
//!
//! | Tool | Arguments | Result |
//! |------|-----------|--------|
//! | `listTables` | none | `[{name, description?, rowCount?}]` |
//! | `describeTable` | `{table}` | `{table, description?, columns, foreignKeyReference?}` |
//! | `runQuery` | `{sql, params?}` | `{columns, rows, rowCount, truncated}` |
//! | `getMetadata` | none | catalog summary |
//!
//! All tools are read-only.

pub mod guard;
pub mod resources;
pub mod tools;

#[cfg(test)]
mod testing;

use moba_core::{Catalog, Database, DatabaseError, MobaConfig};
use moba_mcp::{HandlerError, Registry, RegistryError, ResourceDescriptor, ToolDescriptor};
use resources::{
    CATALOG_URI, CatalogResource, TABLE_METADATA_TEMPLATE, TABLE_SCHEMA_TEMPLATE,
    TableMetadataResource, TableSchemaResource,
};
use std::sync::Arc;
use tools::{DescribeTable, GetMetadata, ListTables, RunQuery};

/// Limits applied by the tools.
#[derive(Debug, Clone, Copy)]
pub struct ToolOptions {
    pub max_query_length: usize,
    pub max_result_rows: usize,
    /// Reject argument properties the schemas do not declare.
    pub strict: bool,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            max_query_length: 10_000,
            max_result_rows: 1_000,
            strict: false,
        }
    }
}

impl From<&MobaConfig> for ToolOptions {
    fn from(config: &MobaConfig) -> Self {
        Self {
            max_query_length: config.limits.max_query_length,
            max_result_rows: config.limits.max_result_rows,
            strict: config.validation.strict,
        }
    }
}

/// Build the registry of every Moba tool and resource.
pub fn build_registry(
    db: Arc<dyn Database>,
    catalog: Arc<Catalog>,
    options: ToolOptions,
) -> Result<Registry, RegistryError> {
    let mut builder = Registry::builder().strict(options.strict);

    builder
        .register_tool(
            ToolDescriptor::new(
                tools::LIST_TABLES,
                tools::list_tables_schema(),
                Arc::new(ListTables {
                    db: Arc::clone(&db),
                    catalog: Arc::clone(&catalog),
                }),
            )
            .with_description("List the tables in the database with their catalog descriptions"),
        )?
        .register_tool(
            ToolDescriptor::new(
                tools::DESCRIBE_TABLE,
                tools::describe_table_schema(),
                Arc::new(DescribeTable {
                    db: Arc::clone(&db),
                    catalog: Arc::clone(&catalog),
                }),
            )
            .with_description("Describe the columns of a table"),
        )?
        .register_tool(
            ToolDescriptor::new(
                tools::RUN_QUERY,
                tools::run_query_schema(),
                Arc::new(RunQuery {
                    db: Arc::clone(&db),
                    options,
                }),
            )
            .with_description("Run a read-only SQL query with positional parameters"),
        )?
        .register_tool(
            ToolDescriptor::new(
                tools::GET_METADATA,
                tools::get_metadata_schema(),
                Arc::new(GetMetadata {
                    catalog: Arc::clone(&catalog),
                }),
            )
            .with_description("Summarize the metadata catalog"),
        )?;

    builder
        .register_resource(
            ResourceDescriptor::new(
                CATALOG_URI,
                "catalog",
                Arc::new(CatalogResource {
                    catalog: Arc::clone(&catalog),
                }),
            )?
            .with_description("Complete metadata catalog")
            .with_mime_type("application/json"),
        )?
        .register_resource(
            ResourceDescriptor::new(
                TABLE_METADATA_TEMPLATE,
                "table-metadata",
                Arc::new(TableMetadataResource {
                    catalog: Arc::clone(&catalog),
                }),
            )?
            .with_description("Catalog entry for one table")
            .with_mime_type("application/json")
            .subscribable(true),
        )?
        .register_resource(
            ResourceDescriptor::new(
                TABLE_SCHEMA_TEMPLATE,
                "table-schema",
                Arc::new(TableSchemaResource { db }),
            )?
            .with_description("Live column layout of one table")
            .with_mime_type("application/json"),
        )?;

    let registry = builder.build();
    tracing::info!(
        tool_count = registry.tool_count(),
        resource_count = registry.resource_count(),
        "Registry built"
    );
    Ok(registry)
}

/// Carry the collaborator's classification to the client.
pub(crate) fn database_error(e: DatabaseError) -> HandlerError {
    HandlerError::new(e.classification(), e.to_string())
}
