//! `moba serve` - run the MCP server until a shutdown signal arrives.

use super::{LoadedConfig, open_collaborators};
use anyhow::{Context, Result};
use moba_core::Database;
use moba_mcp::{McpServer, ServerHandle};
use moba_tools::{ToolOptions, build_registry};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

pub async fn run(loaded: LoadedConfig) -> Result<()> {
    let config = &loaded.config;
    let (db, catalog) = open_collaborators(&loaded).await?;

    let db: Arc<dyn Database> = db;
    let registry = build_registry(db, catalog, ToolOptions::from(config))
        .context("Failed to build tool registry")?;

    let server = McpServer::new(Arc::new(registry), config);
    info!(
        transport = %config.transport.kind,
        address = %config.transport.bind_addr(),
        stateless = config.transport.stateless,
        "Starting MCP server"
    );

    tokio::spawn(drain_on_signal(server.handle()));
    server
        .serve(&config.transport)
        .await
        .context("MCP server failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then drain every session.
async fn drain_on_signal(handle: ServerHandle) {
    let sigint = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = sigint => info!("Received SIGINT"),
        _ = sigterm => info!("Received SIGTERM"),
    }
    info!("Draining sessions");
    handle.shutdown();
}
