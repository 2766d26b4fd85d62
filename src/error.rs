//! Error taxonomy for the archive, index, and search layers.
//!
//! Library entry points return [`Result<T>`]; the `sarc` binary maps each
//! variant onto an exit code via [`ArchiveError::exit_code`]. Errors confined
//! to a single document or a background ingestion are logged by their caller
//! and never escalate to the archiving command.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("snapshot already exists: {project}/{timestamp}")]
    SnapshotCollision { project: String, timestamp: String },

    #[error("skipped {}: {reason}", .path.display())]
    PartialExtraction { path: PathBuf, reason: String },

    #[error("search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("index writer for '{project}' still blocked after {attempts} attempts")]
    ConcurrentWriteConflict { project: String, attempts: u32 },

    #[error("invalid {kind} name: '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("incomplete snapshot copy at {}: {detail}", .path.display())]
    IncompleteCopy { path: PathBuf, detail: String },

    #[error("invalid timestamp '{0}' (expected YYYYMMDD_HHMMSS)")]
    InvalidTimestamp(String),

    #[error("invalid search query: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("glob error: {0}")]
    Glob(#[from] globset::Error),

    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl ArchiveError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Process exit code: 1 fatal, 2 not found, 3 partial failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound { .. } => 2,
            Self::PartialExtraction { .. } => 3,
            _ => 1,
        }
    }

    /// True when SQLite reported a lock held by another writer.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(err) => sqlite_busy(err),
            _ => false,
        }
    }
}

fn sqlite_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
    let busy_code = matches!(
        db_err.code().as_deref(),
        Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
    );
    busy_code || db_err.message().contains("database is locked")
}
