//! Estate application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the snapshot database and restore the latest inventory
//! 4. Run the requested subcommand

mod cli;
mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;

use estate_core::config::EstateConfig;
use estate_storage::{Database, SnapshotRepository};

use cli::{CliArgs, Command};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = if config_file.exists() {
        EstateConfig::load(&config_file)?
    } else {
        EstateConfig::default()
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    // Storage.
    let data_dir = resolve_data_dir(&config.general.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("estate.db");
    let db = Arc::new(Database::new(&db_path)?);
    let repo = Arc::new(SnapshotRepository::new(db));

    match args.command {
        Command::Ingest(ingest) => {
            let inventory = Arc::new(commands::load_inventory(&config, &repo).await?);
            let report = commands::ingest(inventory, repo, &ingest).await?;
            print_json(&report)?;
        }
        Command::Query(query) => {
            let inventory = Arc::new(commands::load_inventory(&config, &repo).await?);
            let page = commands::query(inventory, &query).await?;
            print_json(&page)?;
        }
        Command::Export { file } => {
            let inventory = Arc::new(commands::load_inventory(&config, &repo).await?);
            let snapshot = commands::export(inventory, &file).await?;
            println!(
                "Exported {} clusters ({} listings) to {}",
                snapshot.clusters.len(),
                snapshot.listing_count(),
                file.display()
            );
        }
        Command::Import { file } => {
            let stats = commands::import(&config, repo, &file).await?;
            print_json(&stats)?;
        }
        Command::Stats => {
            let inventory = Arc::new(commands::load_inventory(&config, &repo).await?);
            let report = commands::stats(inventory, repo).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
