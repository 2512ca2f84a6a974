//! Backup daemon entry point.
//!
//! Loads `config.json`, connects the catalog database, bootstraps the
//! schema, and runs the scheduler and retention loops until Ctrl-C.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use backupvault::catalog::pg::PgCatalog;
use backupvault::config::{AppConfig, PgSettingsStore};
use backupvault::engine::PgEngine;
use backupvault::retention::spawn_retention_loop;
use backupvault::scheduler::spawn_scheduler_loop;
use backupvault::service::BackupService;
use backupvault::sync::S3RemoteStorage;

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Shutdown complete.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // Expects config.json next to the executable, or the project root when
    // running with `cargo run`.
    let config_path = PathBuf::from("config.json");
    let config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    println!(
        "🚀 Starting backup daemon (backup dir: {})",
        config.backup_dir.display()
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.catalog_database_url)
        .await
        .context("Failed to connect to the catalog database")?;

    let catalog = Arc::new(PgCatalog::new(pool.clone()));
    catalog
        .ensure_schema()
        .await
        .context("Failed to bootstrap the catalog schema")?;
    let settings = Arc::new(PgSettingsStore::new(pool));
    settings
        .ensure_schema()
        .await
        .context("Failed to bootstrap the settings schema")?;

    let engine = Arc::new(
        PgEngine::from_url(&config.source_database_url)
            .context("Invalid source database URL in config.json")?,
    );

    let service = BackupService::new(
        catalog,
        settings,
        Arc::new(S3RemoteStorage),
        engine,
        config.backup_dir.clone(),
    );

    let retention = spawn_retention_loop(
        service.clone(),
        Duration::from_secs(config.retention_tick_secs),
    );
    let scheduler = spawn_scheduler_loop(
        service.clone(),
        Duration::from_secs(config.scheduler_tick_secs),
    );
    println!("⏰ Scheduler and retention loops running; press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    println!("🔻 Shutting down...");
    scheduler.abort();
    retention.abort();
    Ok(())
}
