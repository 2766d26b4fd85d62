//! The `archive` command: snapshot a knowledge directory and queue its
//! re-indexing.
//!
//! Only the snapshot itself can fail the command. The flat listing and the
//! ingest dispatch that follow are best effort and logged on failure.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::extract::Extractor;
use crate::fallback;
use crate::models::SnapshotInfo;
use crate::project::{infer_project, resolve_source, sanitize_segment};
use crate::queue::{IngestDispatcher, IngestJob};
use crate::snapshot::{format_bytes, SnapshotStore};

#[derive(Debug, Clone, Default)]
pub struct ArchiveRequest {
    /// Defaults to the workspace directory under the current directory.
    pub source: Option<PathBuf>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub timestamp: Option<String>,
    /// Skip the post-archive ingest dispatch.
    pub no_index: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub snapshot: SnapshotInfo,
    pub source: PathBuf,
    pub files: u64,
    pub bytes: u64,
    pub flat_index: Option<PathBuf>,
    pub ingest_queued: bool,
}

impl ArchiveReport {
    pub fn summary(&self) -> String {
        format!(
            "Archived {} ({} files, {})",
            self.snapshot.label(),
            self.files,
            format_bytes(self.bytes)
        )
    }
}

pub fn run_archive(
    config: &Config,
    cwd: &Path,
    request: &ArchiveRequest,
    dispatcher: &dyn IngestDispatcher,
) -> Result<ArchiveReport> {
    let source = resolve_source(cwd, request.source.as_deref())?;

    let wants_inferred_branch = request.branch.is_none() && config.archive.branch_scoped;
    let identity = if request.project.is_none() || wants_inferred_branch {
        Some(infer_project(&source)?)
    } else {
        None
    };

    let project_name = request
        .project
        .clone()
        .or_else(|| identity.as_ref().map(|id| id.name.clone()))
        .unwrap_or_default();
    let project = sanitize_segment("project", &project_name)?;
    let branch = match (&request.branch, &identity) {
        (Some(b), _) => Some(sanitize_segment("branch", b)?),
        (None, Some(id)) if config.archive.branch_scoped => id
            .branch
            .as_deref()
            .map(|b| sanitize_segment("branch", b))
            .transpose()?,
        _ => None,
    };

    let store = SnapshotStore::new(config)?;
    let outcome = store.create_snapshot(
        &source,
        &project,
        branch.as_deref(),
        request.timestamp.as_deref(),
    )?;

    let flat_index = match fallback::build_flat_index(&Extractor::new(config), &outcome.snapshot) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(snapshot = %outcome.snapshot.label(), error = %err, "flat index not written");
            None
        }
    };

    let ingest_queued = !request.no_index;
    if ingest_queued {
        dispatcher.dispatch(IngestJob::project(&project));
    }

    Ok(ArchiveReport {
        snapshot: outcome.snapshot,
        source,
        files: outcome.files,
        bytes: outcome.bytes,
        flat_index,
        ingest_queued,
    })
}
