//! Scanwarden -- continuous network inventory.
//!
//! This crate provides the core library for cron-scheduled host discovery
//! and port scanning: the job scheduler and execution engine, the host
//! inventory, scan profiles, and the TCP probes the jobs drive.

pub mod config;
pub mod inventory;
pub mod logging;
pub mod probes;
pub mod profiles;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::inventory::SqliteInventory;
use crate::probes::{TcpConnectScanner, TcpSweepDiscovery};
use crate::profiles::SqliteProfileStore;
use crate::scheduler::{Collaborators, Scheduler, SqliteJobStore};
use crate::storage::Pool;

/// Wire a scheduler to the SQLite-backed store and the TCP probes.
pub fn build_scheduler(config: &Config, pool: Pool) -> Scheduler {
    let inventory = SqliteInventory::new(pool.clone());
    let collaborators = Collaborators {
        discovery: Arc::new(TcpSweepDiscovery::new(inventory.clone(), &config.scanning)),
        scanner: Arc::new(TcpConnectScanner::new(pool.clone(), &config.scanning)),
        inventory: Arc::new(inventory),
        profiles: Arc::new(SqliteProfileStore::new(pool.clone())),
    };
    let store =
        SqliteJobStore::new(pool).with_history_retention(config.scheduler.history_retention);
    Scheduler::new(
        Arc::new(store),
        collaborators,
        config.scheduler.clone(),
    )
}

/// Start the Scanwarden daemon: open the database, run the scheduler until
/// Ctrl-C, then drain in-flight jobs.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.database.path, "Initializing database");
    let pool = storage::open_pool(&config.database.path, config.database.pool_size)?;

    // 2. Start Scheduler
    let scheduler = build_scheduler(&config, pool);
    scheduler
        .start()
        .await
        .context("failed to start scheduler")?;
    tracing::info!("Scanwarden running, press Ctrl-C to stop");

    // 3. Wait for shutdown
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, waiting for running jobs");
    scheduler.shutdown().await;

    Ok(())
}
