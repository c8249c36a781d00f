use crate::config::parse::load_config;
use crate::config::Config;
use crate::remote::channel_from_config;
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::Storage;
use crate::tail::{FetchConfig, FetchSummary, FileStatus, TailOrchestrator};
use crate::web::{run_server, AppState};
use chrono::{DateTime, Local, Utc};
use console::style;
use dialoguer::Confirm;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::traits::StorageError),

    #[error("fetch error: {0}")]
    Fetch(#[from] crate::tail::FetchError),

    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("web server error: {0}")]
    WebServer(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{failed} of {total} source(s) failed to fetch")]
    FetchFailed { failed: usize, total: usize },
}

/// Loaded config plus the storage and orchestrator built from it
struct Runtime {
    config: Config,
    storage: Arc<dyn Storage>,
    orchestrator: Arc<TailOrchestrator>,
}

fn require_config_path(config_path: Option<PathBuf>) -> PathBuf {
    match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/querytail/config.yml");
            eprintln!("  /etc/querytail/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'querytail config init' to generate one.");
            std::process::exit(1);
        }
    }
}

async fn load_runtime(config_path: &Path) -> Result<Runtime, RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage: Arc<dyn Storage> = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;

    let channel = channel_from_config(&config.remote);
    let orchestrator = Arc::new(TailOrchestrator::new(
        FetchConfig::from_config(&config),
        channel,
        storage.clone(),
    ));

    Ok(Runtime {
        config,
        storage,
        orchestrator,
    })
}

/// `querytail fetch`: show status, confirm, fetch, show status again
pub async fn fetch(
    config_path: Option<PathBuf>,
    source: Option<String>,
    yes: bool,
) -> Result<(), RunError> {
    let config_path = require_config_path(config_path);
    let runtime = load_runtime(&config_path).await?;

    display_status(&runtime.orchestrator).await?;

    if !yes {
        println!("{}", "-".repeat(60));
        let proceed = Confirm::new()
            .with_prompt("Do you want to fetch logs now?")
            .default(false)
            .interact()?;
        if !proceed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let results = match source {
        Some(source_id) => {
            let result = runtime.orchestrator.run_fetch(&source_id).await;
            vec![(source_id, result)]
        }
        None => runtime.orchestrator.run_fetch_all().await,
    };

    let total = results.len();
    let mut failed = 0;
    let mut fetched = 0;
    for (source_id, result) in results {
        let summary = result.unwrap_or_else(|e| {
            error!(source_id = %source_id, error = %e, "Fetch failed");
            e.into_summary(&source_id)
        });
        if !summary.success {
            failed += 1;
        }
        fetched += summary.entries_fetched;
        print_summary(&summary);
    }

    if runtime.orchestrator.client_names_configured() {
        match runtime.orchestrator.refresh_client_names().await {
            Ok(stored) => println!("\n  Loaded {} IP-to-hostname mappings from DHCP leases", stored),
            Err(e) => {
                // Missing client names never fail a fetch
                warn!(error = %e, "Failed to refresh client names");
                println!("\n  {}", style(format!("Warning: {}", e)).yellow());
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("{}", style(format!("Fetch complete: {} new entries", fetched)).green().bold());
    println!("{}", "=".repeat(60));

    display_status(&runtime.orchestrator).await?;

    if failed > 0 {
        return Err(RunError::FetchFailed { failed, total });
    }
    Ok(())
}

/// `querytail status`
pub async fn status(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = require_config_path(config_path);
    let runtime = load_runtime(&config_path).await?;
    display_status(&runtime.orchestrator).await?;

    let streams = runtime.storage.stats().await?;
    if !streams.is_empty() {
        println!("{}", style("Stored streams:").bold());
        for stream in streams {
            println!(
                "  {:<20} {:>10} events  {} .. {}",
                stream.destination,
                stream.events,
                format_timestamp(stream.first_timestamp.as_deref()),
                format_timestamp(stream.last_timestamp.as_deref()),
            );
        }
        println!();
    }

    if runtime.orchestrator.client_names_configured() {
        let clients = runtime.storage.client_names().await?;
        println!("Known client names: {}\n", clients.len());
    }
    Ok(())
}

/// `querytail serve`: REST API until Ctrl+C
pub async fn serve(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = require_config_path(config_path);
    let runtime = load_runtime(&config_path).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        orchestrator: runtime.orchestrator.clone(),
        storage: runtime.storage.clone(),
        summaries: runtime.config.summaries.clone(),
    });

    let web_config = runtime.config.web.clone();
    let mut server = tokio::spawn(async move { run_server(state, &web_config, shutdown_rx).await });

    info!("Press Ctrl+C to shut down");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
        result = &mut server => {
            // Server stopped on its own, e.g. the listen address was taken
            result??;
            return Ok(());
        }
    }

    server.await??;
    info!("Shutdown complete");
    Ok(())
}

async fn display_status(orchestrator: &TailOrchestrator) -> Result<(), RunError> {
    println!("\n{}", "=".repeat(60));
    println!("{}", style(format!("querytail @ {}", orchestrator.host())).bold());
    println!("{}", "=".repeat(60));
    println!("\nConfigured sources:\n");

    for (source_id, source) in orchestrator.sources() {
        let state = orchestrator.source_state(source_id).await?;
        let description = source.description.as_deref().unwrap_or(&source.destination);

        println!("  [{}] {}", style(source_id).cyan(), description);
        println!(
            "      Last fetch:      {}",
            format_datetime(state.last_fetch_time.as_ref())
        );
        println!(
            "      Last entry:      {}",
            format_timestamp(state.last_entry_timestamp.as_deref())
        );
        println!("      Total fetched:   {} entries", state.total_entries_fetched);
        for path in &source.remote_files {
            if let Some(file) = state.file(crate::tail::file_key(path)) {
                println!("      {} @ {} bytes", style(path).dim(), file.offset);
            }
        }
        println!();
    }
    Ok(())
}

fn print_summary(summary: &FetchSummary) {
    println!("\n{}", style(format!("[{}]", summary.source_id)).cyan().bold());
    for file in &summary.files {
        let status = match file.status {
            FileStatus::NotFound => style("not found".to_string()).yellow(),
            FileStatus::Empty => style("empty".to_string()).dim(),
            FileStatus::Unchanged => style("unchanged".to_string()).dim(),
            FileStatus::Resumed => style(format!("+{} entries (resumed)", file.entries)).green(),
            FileStatus::FullRead => style(format!("+{} entries (full read)", file.entries)).green(),
        };
        println!("  {}  {}", file.path, status);
        if let Some(error) = &file.error {
            println!("      {}", style(error).yellow());
        }
    }

    let d = &summary.discarded;
    if d.malformed > 0 || d.duplicates > 0 {
        println!(
            "  discarded: {} malformed, {} duplicate",
            d.malformed, d.duplicates
        );
    }

    let message = if summary.success {
        style(summary.message.as_str()).green()
    } else {
        style(summary.message.as_str()).red()
    };
    println!("  {}", message);
}

fn format_datetime(ts: Option<&DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => "Never".to_string(),
    }
}

/// Render an entry timestamp; values that are not RFC 3339 are shown as-is
fn format_timestamp(ts: Option<&str>) -> String {
    match ts {
        None => "Never".to_string(),
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => format_datetime(Some(&dt.with_timezone(&Utc))),
            Err(_) => raw.to_string(),
        },
    }
}
