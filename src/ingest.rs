//! Index writer.
//!
//! Re-extracts the on-disk snapshots of one or all projects and replaces
//! their records in the full-text index. Each project is rewritten inside a
//! single transaction (delete all of its rows, insert the fresh set), so
//! concurrent readers see either the old or the new record set and a failed
//! attempt leaves the previous state intact. A full rebuild drops and
//! recreates the schema inside one transaction.
//!
//! Writers are serialized by SQLite's write lock. A writer that stays
//! blocked past the busy timeout is retried with backoff before the attempt
//! is reported as [`ArchiveError::ConcurrentWriteConflict`].

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::{ArchiveError, Result};
use crate::extract::Extractor;
use crate::migrate;
use crate::models::{IndexRecord, Locator};
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectCounts {
    pub project: String,
    pub snapshots: u64,
    pub documents: u64,
    pub records: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub full_rebuild: bool,
    pub projects: Vec<ProjectCounts>,
    /// Projects whose records were dropped because they left the archive.
    pub purged: Vec<String>,
}

impl IngestReport {
    pub fn records(&self) -> u64 {
        self.projects.iter().map(|p| p.records).sum()
    }

    pub fn documents(&self) -> u64 {
        self.projects.iter().map(|p| p.documents).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.projects.iter().map(|p| p.skipped).sum()
    }

    /// Some documents were skipped but the index was written.
    pub fn is_partial(&self) -> bool {
        self.skipped() > 0
    }
}

/// Records extracted for one project, ready to be written.
#[derive(Debug, Default)]
struct ProjectExtraction {
    counts: ProjectCounts,
    records: Vec<IndexRecord>,
    /// `(branch, timestamp)` of every snapshot `latest` points at.
    latest: HashSet<(String, String)>,
}

impl ProjectExtraction {
    fn is_latest(&self, record: &IndexRecord) -> bool {
        let key = (
            record.branch.clone().unwrap_or_default(),
            record.timestamp.clone(),
        );
        self.latest.contains(&key)
    }
}

/// Re-index `project`, or every project when `None`.
///
/// `full_rebuild` always rebuilds every project; a named project is only
/// checked for existence.
pub async fn run_ingest(
    config: &Config,
    project: Option<&str>,
    full_rebuild: bool,
) -> Result<IngestReport> {
    let store = SnapshotStore::new(config)?;
    if !store.root().is_dir() {
        return Err(ArchiveError::not_found(
            "archive root",
            store.root().display().to_string(),
        ));
    }

    if let Some(p) = project {
        if !store.project_dir(p).is_dir() {
            return Err(ArchiveError::not_found("project", p));
        }
    }

    // a full rebuild drops the whole schema, so it must re-extract everything
    let projects = match project {
        Some(p) if !full_rebuild => vec![p.to_string()],
        Some(p) => {
            info!(project = p, "full rebuild covers every project");
            store.list_projects()?
        }
        None => store.list_projects()?,
    };

    let extractor = Extractor::new(config);
    let mut extractions = Vec::with_capacity(projects.len());
    for name in projects {
        let store = store.clone();
        let extractor = extractor.clone();
        let extraction =
            tokio::task::spawn_blocking(move || extract_project(&store, &extractor, &name))
                .await
                .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))??;
        extractions.push(extraction);
    }

    let pool = db::connect(config).await?;
    let now = chrono::Utc::now().timestamp();
    let mut report = IngestReport {
        full_rebuild,
        ..Default::default()
    };

    let written = if full_rebuild {
        with_retry(config, "*", || rebuild_all(&pool, &extractions, now)).await
    } else {
        write_additive(config, &pool, &extractions, project.is_none(), now).await
    };

    match written {
        Ok(purged) => report.purged = purged,
        Err(err) => {
            pool.close().await;
            return Err(err);
        }
    }

    for extraction in extractions {
        let c = &extraction.counts;
        info!(
            project = %c.project,
            snapshots = c.snapshots,
            documents = c.documents,
            records = c.records,
            skipped = c.skipped,
            "project indexed"
        );
        report.projects.push(extraction.counts);
    }

    pool.close().await;
    Ok(report)
}

fn extract_project(
    store: &SnapshotStore,
    extractor: &Extractor,
    project: &str,
) -> Result<ProjectExtraction> {
    let snapshots = store.list_snapshots(Some(project))?;
    let mut out = ProjectExtraction {
        counts: ProjectCounts {
            project: project.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    for snapshot in &snapshots {
        if snapshot.is_latest {
            out.latest.insert((
                snapshot.branch.clone().unwrap_or_default(),
                snapshot.timestamp.clone(),
            ));
        }
        let mut extraction = extractor.extract(snapshot);
        for skipped in &extraction.skipped {
            warn!(snapshot = %snapshot.label(), error = %skipped, "document skipped");
        }
        out.counts.snapshots += 1;
        out.counts.documents += extraction.documents;
        out.counts.skipped += extraction.skipped.len() as u64;
        out.records.append(&mut extraction.records);
    }
    out.counts.records = out.records.len() as u64;
    Ok(out)
}

async fn write_additive(
    config: &Config,
    pool: &SqlitePool,
    extractions: &[ProjectExtraction],
    purge_missing: bool,
    now: i64,
) -> Result<Vec<String>> {
    with_retry(config, "*", || async {
        let mut conn = pool.acquire().await?;
        migrate::create_schema(&mut conn).await
    })
    .await?;

    for extraction in extractions {
        let project = extraction.counts.project.as_str();
        with_retry(config, project, || replace_project(pool, extraction, now)).await?;
    }

    if !purge_missing {
        return Ok(Vec::new());
    }

    let on_disk: HashSet<&str> = extractions
        .iter()
        .map(|e| e.counts.project.as_str())
        .collect();
    let indexed: Vec<String> = sqlx::query_scalar("SELECT DISTINCT project FROM records")
        .fetch_all(pool)
        .await?;

    let mut purged = Vec::new();
    for project in indexed {
        if on_disk.contains(project.as_str()) {
            continue;
        }
        with_retry(config, &project, || purge_project(pool, &project)).await?;
        info!(project = %project, "purged records of removed project");
        purged.push(project);
    }
    Ok(purged)
}

/// Swap one project's records in a single transaction.
async fn replace_project(pool: &SqlitePool, extraction: &ProjectExtraction, now: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    delete_project_rows(&mut tx, &extraction.counts.project).await?;
    insert_extraction(&mut tx, extraction, now).await?;
    tx.commit().await?;
    debug!(project = %extraction.counts.project, "records replaced");
    Ok(())
}

async fn purge_project(pool: &SqlitePool, project: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    delete_project_rows(&mut tx, project).await?;
    tx.commit().await?;
    Ok(())
}

async fn rebuild_all(
    pool: &SqlitePool,
    extractions: &[ProjectExtraction],
    now: i64,
) -> Result<Vec<String>> {
    let mut tx = pool.begin().await?;
    migrate::drop_schema(&mut tx).await?;
    migrate::create_schema(&mut tx).await?;
    for extraction in extractions {
        insert_extraction(&mut tx, extraction, now).await?;
    }
    tx.commit().await?;
    Ok(Vec::new())
}

async fn delete_project_rows(conn: &mut SqliteConnection, project: &str) -> Result<()> {
    sqlx::query("DELETE FROM records_fts WHERE rowid IN (SELECT id FROM records WHERE project = ?)")
        .bind(project)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM records WHERE project = ?")
        .bind(project)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM ingest_runs WHERE project = ?")
        .bind(project)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_extraction(
    conn: &mut SqliteConnection,
    extraction: &ProjectExtraction,
    now: i64,
) -> Result<()> {
    for record in &extraction.records {
        let (line, field) = match &record.locator {
            Locator::Line(n) => (Some(*n), None),
            Locator::Field(path) => (None, Some(path.as_str())),
        };

        let id = sqlx::query(
            r#"
            INSERT INTO records (project, branch, timestamp, dir_type, path, line, field, is_latest, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.project)
        .bind(record.branch.as_deref().unwrap_or(""))
        .bind(&record.timestamp)
        .bind(&record.dir_type)
        .bind(&record.path)
        .bind(line)
        .bind(field)
        .bind(extraction.is_latest(record))
        .bind(now)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        sqlx::query("INSERT INTO records_fts (rowid, content, field) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&record.content)
            .bind(field.unwrap_or(""))
            .execute(&mut *conn)
            .await?;
    }

    let c = &extraction.counts;
    sqlx::query(
        r#"
        INSERT INTO ingest_runs (project, snapshots, documents, records, skipped, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(project) DO UPDATE SET
            snapshots = excluded.snapshots,
            documents = excluded.documents,
            records = excluded.records,
            skipped = excluded.skipped,
            indexed_at = excluded.indexed_at
        "#,
    )
    .bind(&c.project)
    .bind(c.snapshots as i64)
    .bind(c.documents as i64)
    .bind(c.records as i64)
    .bind(c.skipped as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Re-run `op` while SQLite reports the database as locked.
async fn with_retry<T, F, Fut>(config: &Config, project: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.ingest.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(err) if err.is_busy() && attempt < attempts => {
                warn!(project, attempt, "index locked by another writer, retrying");
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            Err(err) if err.is_busy() => {
                return Err(ArchiveError::ConcurrentWriteConflict {
                    project: project.to_string(),
                    attempts,
                })
            }
            other => return other,
        }
    }
}
