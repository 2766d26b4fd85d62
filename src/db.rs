use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::migrate;

fn options(config: &Config, create: bool) -> Result<SqliteConnectOptions> {
    let db_path = config.db_path();
    Ok(
        SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.db.busy_timeout_secs)),
    )
}

/// Open the index store, creating the file if needed.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options(config, true)?)
        .await?;

    Ok(pool)
}

/// Open an index that must already exist with its schema in place.
///
/// Missing files, unreadable files, and files without the record tables all
/// map to [`ArchiveError::IndexUnavailable`] so the caller can fall back.
pub async fn open_existing(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();
    if !db_path.is_file() {
        return Err(ArchiveError::IndexUnavailable(format!(
            "no index at {}",
            db_path.display()
        )));
    }

    let unavailable = |e: sqlx::Error| ArchiveError::IndexUnavailable(e.to_string());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options(config, false)?)
        .await
        .map_err(unavailable)?;

    match migrate::schema_present(&pool).await {
        Ok(true) => Ok(pool),
        Ok(false) => {
            pool.close().await;
            Err(ArchiveError::IndexUnavailable(format!(
                "index at {} has no records; run `sarc ingest`",
                db_path.display()
            )))
        }
        Err(e) => {
            pool.close().await;
            Err(ArchiveError::IndexUnavailable(e.to_string()))
        }
    }
}
