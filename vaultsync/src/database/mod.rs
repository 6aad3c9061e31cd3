//! Database module
//!
//! This module provides all database functionality including:
//! - Connection options shared by the registry and per-user databases
//! - Registry migrations and per-entity table initialization
//! - The per-user `SpaceRouter`
//! - Model definitions and the repository layer

pub mod models;
pub mod repository;
pub mod router;
pub mod schema;

pub use models::*;
pub use router::{EntityKind, SpaceRouter};
pub use schema::initialize_database;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// Build connection options shared by the registry and per-user databases.
pub(crate) fn connect_options(db_path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .busy_timeout(busy_timeout)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
}

/// Create and initialize the global registry pool.
///
/// Migrations run on a dedicated single-connection pool that is closed
/// before the long-lived pool is created, so every pooled connection
/// sees the final schema.
pub async fn create_pool(
    db_path: &Path,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<SqlitePool> {
    tracing::info!("Creating registry connection pool at: {:?}", db_path);

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let migration_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path, busy_timeout))
        .await?;

    initialize_database(&migration_pool).await?;
    migration_pool.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_options(db_path, busy_timeout))
        .await?;

    tracing::info!("Registry pool created successfully");

    Ok(pool)
}
