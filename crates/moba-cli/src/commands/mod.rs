//! CLI command implementations for the Moba MCP server.

pub mod check;
pub mod serve;
pub mod tools;

use anyhow::{Context, Result};
use clap::Args;
use moba_adapter_sqlite::{SqliteDatabase, SqliteOptions};
use moba_core::{Catalog, Framing, LogFormat, MobaConfig, TransportKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "moba.yaml";

/// Configuration flags shared by every command. Flags override environment
/// variables, which override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Configuration file (YAML).
    #[arg(short, long, env = "MOBA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport: pipe, push-stream or stateless-http.
    #[arg(long, env = "MOBA_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// Bind host for network transports.
    #[arg(long, env = "MOBA_HOST")]
    pub host: Option<String>,

    /// Bind port for network transports.
    #[arg(long, env = "MOBA_PORT")]
    pub port: Option<u16>,

    /// Serve every HTTP request as an independent session.
    #[arg(long, env = "MOBA_STATELESS")]
    pub stateless: bool,

    /// Answer HTTP requests with one JSON body instead of an event stream.
    #[arg(long, env = "MOBA_JSON_RESPONSE")]
    pub json_response: bool,

    /// Pipe framing: newline or length-delimited.
    #[arg(long, env = "MOBA_FRAMING")]
    pub framing: Option<Framing>,

    /// SQLite database file.
    #[arg(long, env = "MOBA_DATABASE")]
    pub database: Option<PathBuf>,

    /// Metadata catalog JSON file.
    #[arg(long, env = "MOBA_METADATA")]
    pub metadata: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, env = "MOBA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: text or json.
    #[arg(long, env = "MOBA_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

/// Configuration with every override applied, plus the directory relative
/// paths resolve against.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: MobaConfig,
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    pub fn database_path(&self) -> PathBuf {
        self.config.resolve_database_path(&self.base_dir)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.config.resolve_metadata_path(&self.base_dir)
    }
}

/// Read the config file (if any) and apply flag and environment overrides.
pub fn load_config(args: &ConfigArgs) -> Result<LoadedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let file = match &args.config {
        Some(path) => Some(path.clone()),
        None => Some(cwd.join(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };

    let (mut config, base_dir) = match file {
        Some(path) => {
            let config = MobaConfig::from_file(&path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?;
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cwd.clone());
            (config, base)
        }
        None => (MobaConfig::default(), cwd),
    };

    apply_overrides(&mut config, args);
    Ok(LoadedConfig { config, base_dir })
}

fn apply_overrides(config: &mut MobaConfig, args: &ConfigArgs) {
    if let Some(kind) = args.transport {
        config.transport.kind = kind;
    }
    if let Some(host) = &args.host {
        config.transport.host = host.clone();
    }
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    if args.stateless {
        config.transport.stateless = true;
    }
    if args.json_response {
        config.transport.json_response = true;
    }
    if let Some(framing) = args.framing {
        config.transport.framing = framing;
    }
    if let Some(path) = &args.database {
        config.database.path = path.clone();
    }
    if let Some(path) = &args.metadata {
        config.metadata.path = path.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
}

/// Apply `MCP_SERVER_URL` and validate. Runs after logging is installed so a
/// bad URL is reported.
pub fn finalize(loaded: &mut LoadedConfig) -> Result<()> {
    if let Ok(url) = std::env::var("MCP_SERVER_URL") {
        if !url.trim().is_empty() {
            loaded.config.apply_server_url(url.trim());
        }
    }
    loaded
        .config
        .validate()
        .context("Invalid configuration")?;
    Ok(())
}

/// Load the catalog and open the database. Both are startup requirements.
pub async fn open_collaborators(loaded: &LoadedConfig) -> Result<(Arc<SqliteDatabase>, Arc<Catalog>)> {
    let metadata_path = loaded.metadata_path();
    let catalog = Catalog::load(&metadata_path)
        .with_context(|| format!("Failed to load metadata catalog from {:?}", metadata_path))?;

    let database_path = loaded.database_path();
    let db = SqliteDatabase::open(&database_path, SqliteOptions::from(&loaded.config.database))
        .await
        .with_context(|| format!("Failed to open database {:?}", database_path))?;

    info!(
        database = %database_path.display(),
        metadata = %metadata_path.display(),
        catalog_tables = catalog.tables.len(),
        "Collaborators ready"
    );
    Ok((Arc::new(db), Arc::new(catalog)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moba.yaml");
        fs::write(
            &path,
            "transport:\n  kind: push-stream\n  port: 9000\ndatabase:\n  path: data/app.db\n",
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(path),
            port: Some(9100),
            ..ConfigArgs::default()
        };
        let loaded = load_config(&args).unwrap();
        assert_eq!(loaded.config.transport.kind, TransportKind::PushStream);
        assert_eq!(loaded.config.transport.port, 9100);
        assert_eq!(loaded.base_dir, dir.path());
        assert_eq!(loaded.database_path(), dir.path().join("data/app.db"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/moba.yaml")),
            ..ConfigArgs::default()
        };
        assert!(load_config(&args).is_err());
    }
}
