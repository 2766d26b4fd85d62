//! Dedup reconciler.
//!
//! Groups every file of a project's snapshots by its snapshot-relative path.
//! The copy in the newest snapshot stays; older copies are moved (never
//! deleted) to `{project}/_review/[{branch}/]{their timestamp}/{path}`, so
//! lineages sharing a timestamp keep separate review copies. Anything under
//! a `features` directory has its own lifecycle and is never considered.
//!
//! Reconciliation works on the snapshot tree, not the index. A second run
//! over an unchanged tree plans nothing.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::Result;
use crate::extract::{relative_string, Extractor};
use crate::fallback;
use crate::models::{SnapshotInfo, FLAT_INDEX_FILE};
use crate::queue::{IngestDispatcher, IngestJob};
use crate::snapshot::SnapshotStore;

/// Subtrees with an independent archival lifecycle.
const PRESERVED_DIR: &str = "features";

const IGNORED_FILES: [&str; 2] = [FLAT_INDEX_FILE, ".DS_Store"];

#[derive(Debug, Clone, Serialize)]
pub struct PlannedMove {
    pub relative_path: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Snapshot whose copy stays active.
    pub kept_timestamp: String,
    pub from: PathBuf,
    pub to: PathBuf,
    /// Byte-identical to the kept copy.
    pub identical: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub project: String,
    pub dry_run: bool,
    pub moves: Vec<PlannedMove>,
    pub moved: usize,
    /// Planned moves whose destination already existed.
    pub skipped: usize,
    pub failed: usize,
    pub ingest_queued: bool,
}

/// One occurrence of a relative path.
struct Occurrence<'a> {
    snapshot: &'a SnapshotInfo,
    path: PathBuf,
}

pub fn reconcile(
    config: &Config,
    project: &str,
    dry_run: bool,
    dispatcher: &dyn IngestDispatcher,
) -> Result<ReconcileReport> {
    let store = SnapshotStore::new(config)?;
    let snapshots = store.list_snapshots(Some(project))?;

    let mut groups: BTreeMap<String, Vec<Occurrence>> = BTreeMap::new();
    for snapshot in &snapshots {
        for path in candidate_files(&snapshot.path)? {
            let Ok(relative) = path.strip_prefix(&snapshot.path) else {
                continue;
            };
            groups
                .entry(relative_string(relative))
                .or_default()
                .push(Occurrence { snapshot, path });
        }
    }

    let review = store.review_dir(project);
    let mut moves = Vec::new();
    for (relative_path, mut occurrences) in groups {
        if occurrences.len() < 2 {
            continue;
        }
        occurrences.sort_by(|a, b| {
            b.snapshot
                .timestamp
                .cmp(&a.snapshot.timestamp)
                .then(a.snapshot.branch.cmp(&b.snapshot.branch))
        });
        let kept = &occurrences[0];
        let kept_hash = file_hash(&kept.path)?;

        for older in &occurrences[1..] {
            moves.push(PlannedMove {
                relative_path: relative_path.clone(),
                timestamp: older.snapshot.timestamp.clone(),
                branch: older.snapshot.branch.clone(),
                kept_timestamp: kept.snapshot.timestamp.clone(),
                from: older.path.clone(),
                to: review_destination(&review, older.snapshot, &relative_path),
                identical: file_hash(&older.path)? == kept_hash,
            });
        }
    }

    let mut report = ReconcileReport {
        project: project.to_string(),
        dry_run,
        moves,
        moved: 0,
        skipped: 0,
        failed: 0,
        ingest_queued: false,
    };
    if dry_run {
        return Ok(report);
    }

    let mut touched: Vec<&SnapshotInfo> = Vec::new();
    for planned in &report.moves {
        if planned.to.exists() {
            warn!(to = %planned.to.display(), "review destination exists, leaving file in place");
            report.skipped += 1;
            continue;
        }
        match move_file(&planned.from, &planned.to) {
            Ok(()) => {
                report.moved += 1;
                if let Some(s) = snapshots.iter().find(|s| planned.from.starts_with(&s.path)) {
                    if !touched.iter().any(|t| t.path == s.path) {
                        touched.push(s);
                    }
                }
            }
            Err(err) => {
                warn!(from = %planned.from.display(), error = %err, "move failed");
                report.failed += 1;
            }
        }
    }

    // keep each touched snapshot's flat listing in step with its files
    let extractor = Extractor::new(config);
    for snapshot in touched {
        if snapshot.path.join(FLAT_INDEX_FILE).exists() {
            if let Err(err) = fallback::build_flat_index(&extractor, snapshot) {
                warn!(snapshot = %snapshot.label(), error = %err, "flat index not refreshed");
            }
        }
    }

    info!(
        project,
        moved = report.moved,
        skipped = report.skipped,
        failed = report.failed,
        "reconciliation finished"
    );

    if report.moved > 0 {
        dispatcher.dispatch(IngestJob::project(project));
        report.ingest_queued = true;
    }
    Ok(report)
}

/// `_review/{timestamp}/{path}`, or `_review/{branch}/{timestamp}/{path}`
/// for a branch lineage. Branch names never look like timestamps, so the
/// two forms cannot collide.
fn review_destination(review: &Path, snapshot: &SnapshotInfo, relative_path: &str) -> PathBuf {
    let lineage = match &snapshot.branch {
        Some(branch) => review.join(branch),
        None => review.to_path_buf(),
    };
    lineage.join(&snapshot.timestamp).join(relative_path)
}

/// Regular files of a snapshot that take part in reconciliation.
fn candidate_files(snapshot_dir: &Path) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(snapshot_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && (e.file_name() == PRESERVED_DIR || e.file_name() == ".git"))
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if IGNORED_FILES.iter().any(|f| *f == name) {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

fn file_hash(path: &Path) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // rename cannot cross filesystems; copy then remove instead
        Err(err) if err.kind() != ErrorKind::NotFound => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}

pub fn print_report(report: &ReconcileReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.moves.is_empty() {
        println!("No duplicates found for {}.", report.project);
        return Ok(());
    }

    let verb = if report.dry_run { "would move" } else { "move" };
    for m in &report.moves {
        println!(
            "{} {}  [{} -> kept {}]{}",
            verb,
            m.relative_path,
            m.timestamp,
            m.kept_timestamp,
            if m.identical { "" } else { "  (differs)" }
        );
        println!("    {} -> {}", m.from.display(), m.to.display());
    }
    println!();
    if report.dry_run {
        println!("{} moves planned (dry run, nothing changed).", report.moves.len());
    } else {
        println!(
            "moved: {}  skipped: {}  failed: {}",
            report.moved, report.skipped, report.failed
        );
        if report.ingest_queued {
            println!("Index update queued for {}.", report.project);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NoIngest;

    fn archive_twice(tmp: &tempfile::TempDir) -> (Config, SnapshotStore) {
        let ws = tmp.path().join("ws");
        fs::create_dir_all(ws.join("context")).unwrap();
        fs::create_dir_all(ws.join("features/login")).unwrap();
        fs::write(ws.join("context/notes.md"), "auth notes\n").unwrap();
        fs::write(ws.join("features/login/plan.md"), "feature plan\n").unwrap();

        let config = Config::with_root(tmp.path().join("archive"));
        let store = SnapshotStore::new(&config).unwrap();
        store
            .create_snapshot(&ws, "demo", None, Some("20260101_090000"))
            .unwrap();
        store
            .create_snapshot(&ws, "demo", None, Some("20260101_100000"))
            .unwrap();
        (config, store)
    }

    #[test]
    fn dry_run_plans_without_touching_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, store) = archive_twice(&tmp);

        let report = reconcile(&config, "demo", true, &NoIngest).unwrap();
        assert_eq!(report.moves.len(), 1);
        let m = &report.moves[0];
        assert_eq!(m.relative_path, "context/notes.md");
        assert_eq!(m.timestamp, "20260101_090000");
        assert_eq!(m.kept_timestamp, "20260101_100000");
        assert!(m.identical);
        assert!(m.from.exists());
        assert!(!store.review_dir("demo").exists());
    }

    #[test]
    fn moves_older_copy_to_review_and_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, store) = archive_twice(&tmp);

        let report = reconcile(&config, "demo", false, &NoIngest).unwrap();
        assert_eq!(report.moved, 1);
        assert!(report.ingest_queued);

        let project = store.project_dir("demo");
        assert!(store
            .review_dir("demo")
            .join("20260101_090000/context/notes.md")
            .is_file());
        assert!(!project.join("20260101_090000/context/notes.md").exists());
        assert!(project.join("20260101_100000/context/notes.md").is_file());
        // feature subtrees are never touched
        assert!(project.join("20260101_090000/features/login/plan.md").is_file());

        let again = reconcile(&config, "demo", false, &NoIngest).unwrap();
        assert!(again.moves.is_empty());
        assert!(!again.ingest_queued);
    }

    #[test]
    fn existing_review_destination_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (config, store) = archive_twice(&tmp);
        let dest = store
            .review_dir("demo")
            .join("20260101_090000/context/notes.md");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "earlier review copy").unwrap();

        let report = reconcile(&config, "demo", false, &NoIngest).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.moved, 0);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "earlier review copy");
    }

    #[test]
    fn branches_sharing_a_timestamp_get_separate_review_copies() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(ws.join("plans")).unwrap();
        fs::write(ws.join("plans/todo.md"), "fix login bug\n").unwrap();

        let config = Config::with_root(tmp.path().join("archive"));
        let store = SnapshotStore::new(&config).unwrap();
        for (branch, ts) in [
            ("a", "20260101_090000"),
            ("b", "20260101_090000"),
            ("c", "20260101_100000"),
        ] {
            store.create_snapshot(&ws, "demo", Some(branch), Some(ts)).unwrap();
        }

        let report = reconcile(&config, "demo", false, &NoIngest).unwrap();
        assert_eq!(report.moves.len(), 2);
        assert_eq!(report.moved, 2);
        assert_eq!(report.skipped, 0);

        let review = store.review_dir("demo");
        assert!(review.join("a/20260101_090000/plans/todo.md").is_file());
        assert!(review.join("b/20260101_090000/plans/todo.md").is_file());

        let active: Vec<_> = store
            .list_snapshots(Some("demo"))
            .unwrap()
            .into_iter()
            .filter(|s| s.path.join("plans/todo.md").exists())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].branch.as_deref(), Some("c"));

        let again = reconcile(&config, "demo", false, &NoIngest).unwrap();
        assert!(again.moves.is_empty());
    }

    #[test]
    fn unknown_project_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let err = reconcile(&config, "ghost", true, &NoIngest).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
