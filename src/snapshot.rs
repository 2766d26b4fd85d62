//! Snapshot store: on-disk layout and the snapshot creation protocol.
//!
//! ```text
//! {root}/{project}/{timestamp}/...            unbranched snapshot
//! {root}/{project}/latest -> {timestamp}
//! {root}/{project}/{branch}/{timestamp}/...   branch-scoped snapshot
//! {root}/{project}/{branch}/latest -> {timestamp}
//! {root}/{project}/_review/{timestamp}/...    dedup-relocated files
//! {root}/{project}/_review/{branch}/{timestamp}/...
//! {root}/archives.db                          full-text index
//! ```
//!
//! A snapshot directory is claimed with a non-recursive `create_dir`, so an
//! existing timestamp is a collision rather than an overwrite. The tree is
//! copied, the copy is verified against the source manifest, and only then
//! is `latest` replaced through a staged symlink and `rename(2)`. A failed
//! copy is removed and never becomes `latest`.

use chrono::{Local, NaiveDateTime};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::models::SnapshotInfo;

pub const LATEST: &str = "latest";
pub const REVIEW_DIR: &str = "_review";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// True for `YYYYMMDD_HHMMSS` names that parse as a real date and time.
pub fn is_timestamp(name: &str) -> bool {
    name.len() == 15 && NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT).is_ok()
}

/// Current local wall-clock time at second resolution.
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub snapshot: SnapshotInfo,
    pub files: u64,
    pub bytes: u64,
}

/// Files and bytes observed while walking a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Manifest {
    files: u64,
    bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    exclude: GlobSet,
}

impl SnapshotStore {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.archive.exclude {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            root: config.archive_root(),
            exclude: builder.build()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    pub fn review_dir(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(REVIEW_DIR)
    }

    /// Directory holding the snapshots and `latest` pointer of one lineage.
    pub fn lineage_dir(&self, project: &str, branch: Option<&str>) -> PathBuf {
        match branch {
            Some(branch) => self.project_dir(project).join(branch),
            None => self.project_dir(project),
        }
    }

    /// Copy `source_dir` into a new snapshot and point `latest` at it.
    pub fn create_snapshot(
        &self,
        source_dir: &Path,
        project: &str,
        branch: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<SnapshotOutcome> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::not_found(
                "source directory",
                source_dir.display().to_string(),
            ));
        }

        let timestamp = match timestamp {
            Some(ts) if is_timestamp(ts) => ts.to_string(),
            Some(ts) => return Err(ArchiveError::InvalidTimestamp(ts.to_string())),
            None => now_timestamp(),
        };

        let lineage = self.lineage_dir(project, branch);
        fs::create_dir_all(&lineage)?;

        let snapshot_dir = lineage.join(&timestamp);
        if let Err(err) = fs::create_dir(&snapshot_dir) {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(ArchiveError::SnapshotCollision {
                    project: project.to_string(),
                    timestamp,
                });
            }
            return Err(err.into());
        }

        let copied = self
            .copy_tree(source_dir, &snapshot_dir)
            .and_then(|expected| {
                let actual = measure_tree(&snapshot_dir)?;
                if actual != expected {
                    return Err(ArchiveError::IncompleteCopy {
                        path: snapshot_dir.clone(),
                        detail: format!(
                            "expected {} files / {} bytes, found {} / {}",
                            expected.files, expected.bytes, actual.files, actual.bytes
                        ),
                    });
                }
                Ok(actual)
            });

        let manifest = match copied {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(snapshot = %snapshot_dir.display(), error = %err, "snapshot copy failed");
                if let Err(cleanup) = fs::remove_dir_all(&snapshot_dir) {
                    warn!(
                        snapshot = %snapshot_dir.display(),
                        error = %cleanup,
                        "partial snapshot left for inspection"
                    );
                }
                return Err(err);
            }
        };

        swap_latest(&lineage, &timestamp)?;
        info!(
            project,
            branch = branch.unwrap_or(""),
            timestamp = %timestamp,
            files = manifest.files,
            bytes = manifest.bytes,
            "snapshot created"
        );

        Ok(SnapshotOutcome {
            snapshot: SnapshotInfo {
                project: project.to_string(),
                branch: branch.map(String::from),
                timestamp,
                path: snapshot_dir,
                is_latest: true,
            },
            files: manifest.files,
            bytes: manifest.bytes,
        })
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        // never recurse into the archive itself when it lives under the source
        let archive_root = self.root.canonicalize().ok();

        let walker = WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if let Ok(rel) = e.path().strip_prefix(source) {
                    if !rel.as_os_str().is_empty() && self.exclude.is_match(rel) {
                        return false;
                    }
                }
                match &archive_root {
                    Some(root) if e.file_type().is_dir() => {
                        e.path().canonicalize().map_or(true, |p| &p != root)
                    }
                    _ => true,
                }
            });

        for entry in walker {
            let entry = entry?;
            let relative = match entry.path().strip_prefix(source) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };

            let target = dest.join(relative);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())?;
                make_symlink(&link, &target)?;
                manifest.files += 1;
            } else if file_type.is_file() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                manifest.bytes += fs::copy(entry.path(), &target)?;
                manifest.files += 1;
            }
        }

        debug!(files = manifest.files, bytes = manifest.bytes, "tree copied");
        Ok(manifest)
    }

    /// All snapshots, newest first. `None` lists every project.
    pub fn list_snapshots(&self, project: Option<&str>) -> Result<Vec<SnapshotInfo>> {
        let projects = match project {
            Some(p) => {
                if !self.project_dir(p).is_dir() {
                    return Err(ArchiveError::not_found("project", p));
                }
                vec![p.to_string()]
            }
            None => self.list_projects()?,
        };

        let mut snapshots = Vec::new();
        for project in &projects {
            let project_dir = self.project_dir(project);
            collect_lineage(project, None, &project_dir, &mut snapshots)?;

            for entry in fs::read_dir(&project_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !is_branch_dir_name(&name) || !entry.file_type()?.is_dir() {
                    continue;
                }
                collect_lineage(project, Some(&name), &entry.path(), &mut snapshots)?;
            }
        }

        snapshots.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(a.project.cmp(&b.project))
                .then(a.branch.cmp(&b.branch))
        });
        Ok(snapshots)
    }

    /// Project directory names under the archive root, sorted.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut projects = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with('_') || !entry.file_type()?.is_dir() {
                continue;
            }
            projects.push(name);
        }
        projects.sort();
        Ok(projects)
    }

    /// Timestamp `latest` resolves to for a lineage, if any.
    pub fn latest_timestamp(&self, project: &str, branch: Option<&str>) -> Option<String> {
        read_latest(&self.lineage_dir(project, branch))
    }
}

fn is_branch_dir_name(name: &str) -> bool {
    !(name == LATEST || name.starts_with('.') || name.starts_with('_') || is_timestamp(name))
}

fn collect_lineage(
    project: &str,
    branch: Option<&str>,
    lineage: &Path,
    out: &mut Vec<SnapshotInfo>,
) -> Result<()> {
    let latest = read_latest(lineage);
    for entry in fs::read_dir(lineage)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_timestamp(&name) || !entry.file_type()?.is_dir() {
            continue;
        }
        out.push(SnapshotInfo {
            project: project.to_string(),
            branch: branch.map(String::from),
            is_latest: latest.as_deref() == Some(name.as_str()),
            timestamp: name,
            path: entry.path(),
        });
    }
    Ok(())
}

fn read_latest(lineage: &Path) -> Option<String> {
    let target = fs::read_link(lineage.join(LATEST)).ok()?;
    let name = target.file_name()?.to_string_lossy().to_string();
    (is_timestamp(&name) && lineage.join(&name).is_dir()).then_some(name)
}

/// Replace `{lineage}/latest` so it names `timestamp`.
///
/// The new link is staged beside the old one and renamed over it; readers
/// see either the previous or the new target.
fn swap_latest(lineage: &Path, timestamp: &str) -> Result<()> {
    let link = lineage.join(LATEST);
    let staged = lineage.join(format!(".{}.{}", LATEST, std::process::id()));
    let _ = fs::remove_file(&staged);

    make_symlink(Path::new(timestamp), &staged)?;
    if let Err(err) = fs::rename(&staged, &link) {
        let _ = fs::remove_file(&staged);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

fn measure_tree(dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::default();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            manifest.files += 1;
        } else if file_type.is_file() {
            manifest.files += 1;
            manifest.bytes += entry.metadata()?.len();
        }
    }
    Ok(manifest)
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
