//! Index statistics.
//!
//! A quick summary of what is searchable: record totals, the per-project
//! breakdown with each project's last ingestion, and counts per dir_type.
//! Used by `sarc stats` to confirm that background ingestion keeps up.

use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::snapshot::format_bytes;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub project: String,
    pub records: i64,
    pub latest_records: i64,
    pub snapshots: i64,
    pub skipped: i64,
    pub indexed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub db_path: String,
    pub db_size: u64,
    pub total_records: i64,
    pub latest_records: i64,
    pub projects: Vec<ProjectStats>,
    pub dir_types: Vec<(String, i64)>,
}

pub async fn collect_stats(config: &Config) -> Result<IndexStats> {
    let pool = db::open_existing(config).await?;

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
        .fetch_one(&pool)
        .await?;
    let latest_records: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE is_latest = 1")
            .fetch_one(&pool)
            .await?;

    let project_rows = sqlx::query(
        r#"
        SELECT r.project,
               COUNT(*) AS records,
               SUM(r.is_latest) AS latest_records,
               COALESCE(ir.snapshots, 0) AS snapshots,
               COALESCE(ir.skipped, 0) AS skipped,
               ir.indexed_at AS indexed_at
        FROM records r
        LEFT JOIN ingest_runs ir ON ir.project = r.project
        GROUP BY r.project
        ORDER BY r.project
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let projects: Vec<ProjectStats> = project_rows
        .iter()
        .map(|row| ProjectStats {
            project: row.get("project"),
            records: row.get("records"),
            latest_records: row.get("latest_records"),
            snapshots: row.get("snapshots"),
            skipped: row.get("skipped"),
            indexed_at: row.get("indexed_at"),
        })
        .collect();

    let dir_types: Vec<(String, i64)> = sqlx::query(
        "SELECT dir_type, COUNT(*) AS n FROM records GROUP BY dir_type ORDER BY n DESC, dir_type",
    )
    .fetch_all(&pool)
    .await?
    .iter()
    .map(|row| (row.get("dir_type"), row.get("n")))
    .collect();

    pool.close().await;

    let db_path = config.db_path();
    Ok(IndexStats {
        db_size: std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0),
        db_path: db_path.display().to_string(),
        total_records,
        latest_records,
        projects,
        dir_types,
    })
}

pub fn print_stats(stats: &IndexStats) {
    println!("Scratch Archive — Index Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", stats.db_path);
    println!("  Size:        {}", format_bytes(stats.db_size));
    println!();
    println!("  Records:     {}", stats.total_records);
    println!("  Latest only: {}", stats.latest_records);

    if !stats.projects.is_empty() {
        println!();
        println!("  By project:");
        println!(
            "  {:<24} {:>8} {:>8} {:>9} {:>7}   {}",
            "PROJECT", "RECORDS", "LATEST", "SNAPSHOTS", "SKIPPED", "LAST INGEST"
        );
        println!("  {}", "-".repeat(80));
        for p in &stats.projects {
            let ingested = match p.indexed_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>8} {:>9} {:>7}   {}",
                p.project, p.records, p.latest_records, p.snapshots, p.skipped, ingested
            );
        }
    }

    if !stats.dir_types.is_empty() {
        println!();
        println!("  By type:");
        for (dir_type, n) in &stats.dir_types {
            println!("  {:<24} {:>8}", dir_type, n);
        }
    }
    println!();
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
