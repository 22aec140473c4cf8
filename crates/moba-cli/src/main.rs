use clap::{Parser, Subcommand};
use moba_core::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ConfigArgs, LoadedConfig};

#[derive(Parser, Debug)]
#[command(name = "moba", version, about = "Moba MCP server")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the database and metadata catalog over the configured transport.
    Serve(ConfigArgs),

    /// Print the tool and resource definitions clients will see, as JSON.
    Tools(ConfigArgs),

    /// Validate the configuration and open every collaborator.
    Check(ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve(args) => commands::serve::run(prepare(&args)?).await?,
        Command::Tools(args) => commands::tools::run(prepare(&args)?).await?,
        Command::Check(args) => commands::check::run(prepare(&args)?).await?,
    }

    Ok(())
}

fn prepare(args: &ConfigArgs) -> anyhow::Result<LoadedConfig> {
    let mut loaded = commands::load_config(args)?;
    init_logging(&loaded.config.logging)?;
    commands::finalize(&mut loaded)?;
    Ok(loaded)
}

/// Install the global subscriber. Logs go to stderr; stdout belongs to the
/// pipe transport.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = config.normalized_level()?;
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(default_directives(level)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

fn default_directives(level: &str) -> String {
    if matches!(level, "debug" | "trace") {
        level.to_string()
    } else {
        format!("{level},sqlx=warn,tower_http=warn,hyper=warn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noisy_crates_capped_above_debug() {
        assert_eq!(
            default_directives("info"),
            "info,sqlx=warn,tower_http=warn,hyper=warn"
        );
        assert_eq!(default_directives("trace"), "trace");
    }

    #[test]
    fn test_cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "moba",
            "serve",
            "--transport",
            "stateless-http",
            "--port",
            "9001",
            "--stateless",
            "--json-response",
        ])
        .unwrap();
        let Command::Serve(args) = cli.cmd else {
            panic!("expected serve");
        };
        assert_eq!(args.port, Some(9001));
        assert!(args.stateless);
        assert!(args.json_response);
    }
}
