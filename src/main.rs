use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use querytail::config::resolve_config_path;

#[derive(Parser)]
#[command(name = "querytail")]
#[command(about = "Incremental fetcher for remote JSON line logs", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new entries from the remote host
    Fetch {
        /// Only fetch this source
        #[arg(long)]
        source: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show fetch history per source
    Status,
    /// Serve the REST API
    Serve,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,

        /// Write here instead of ~/.config/querytail/config.yml
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "querytail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Fetch { source, yes }) => {
            querytail::cli::run::fetch(config_path, source, yes).await?;
        }
        Some(Commands::Status) | None => {
            querytail::cli::run::status(config_path).await?;
        }
        Some(Commands::Serve) => {
            querytail::cli::run::serve(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout, output } => {
                querytail::cli::config::init(stdout, output)?;
            }
            ConfigAction::Validate => {
                querytail::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
