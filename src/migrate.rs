use sqlx::{SqliteConnection, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::Result;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    create_schema(&mut conn).await?;
    drop(conn);
    pool.close().await;
    Ok(())
}

/// Create every table and index that is missing.
///
/// Takes a connection so it can run inside the full-rebuild transaction.
pub async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    // Create records table; `branch` is '' for unbranched snapshots
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY,
            project TEXT NOT NULL,
            branch TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL,
            dir_type TEXT NOT NULL,
            path TEXT NOT NULL,
            line INTEGER,
            field TEXT,
            is_latest INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // One row per project from its most recent ingestion
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            project TEXT PRIMARY KEY,
            snapshots INTEGER NOT NULL,
            documents INTEGER NOT NULL,
            records INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // FTS5 over record content and field paths, rowid = records.id
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
            content,
            field,
            tokenize = 'porter unicode61'
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_project ON records(project)")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_snapshot ON records(project, branch, timestamp)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Drop every index table. Used by full rebuilds inside their transaction.
pub async fn drop_schema(conn: &mut SqliteConnection) -> Result<()> {
    for table in ["records_fts", "records", "ingest_runs"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// True when both the record table and its FTS table exist.
pub async fn schema_present(pool: &SqlitePool) -> Result<bool> {
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('records', 'records_fts')",
    )
    .fetch_one(pool)
    .await?;
    Ok(tables == 2)
}
