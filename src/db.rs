//! Per-project SQLite connection management.
//!
//! Each project owns exactly one index file. Pools are opened in WAL mode
//! so readers can overlap the single writer, which is how the store keeps
//! searches live during an ingest.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open (or create) the index file for a project.
pub async fn connect(index_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = index_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", index_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
