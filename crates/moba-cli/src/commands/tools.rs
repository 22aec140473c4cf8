//! `moba tools` - print what `tools/list`, `resources/list` and
//! `resources/templates/list` will return.

use super::{LoadedConfig, open_collaborators};
use anyhow::{Context, Result};
use moba_core::Database;
use moba_mcp::Registry;
use moba_tools::{ToolOptions, build_registry};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn run(loaded: LoadedConfig) -> Result<()> {
    let (db, catalog) = open_collaborators(&loaded).await?;
    let db: Arc<dyn Database> = db;
    let registry = build_registry(db, catalog, ToolOptions::from(&loaded.config))
        .context("Failed to build tool registry")?;

    println!("{}", serde_json::to_string_pretty(&definitions(&registry))?);
    Ok(())
}

fn definitions(registry: &Registry) -> Value {
    json!({
        "tools": registry.tool_definitions(),
        "resources": registry.resource_definitions(),
        "resourceTemplates": registry.template_definitions(),
    })
}
