// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for dataspace-core.
//!
//! # Example
//!
//! ```ignore
//! use dataspace_core::migrations;
//!
//! let pool = migrations::open_sqlite("sqlite:.data/connector.db").await?;
//! ```

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::error::Result;

/// SQLite migrator with all store migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &SqlitePool) -> std::result::Result<(), MigrateError> {
    SQLITE.run(pool).await
}

/// Connect to `url`, creating the database file if needed, and migrate it.
///
/// In-memory databases are limited to one connection so every handle sees
/// the same data.
pub async fn open_sqlite(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_sqlite(&pool).await?;
    info!(url = %url, "SQLite store migrated");

    Ok(pool)
}
