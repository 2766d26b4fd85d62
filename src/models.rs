//! Core data models shared by the snapshot store, extractor, index, and
//! query engine.

use serde::Serialize;
use std::path::PathBuf;

/// Subdirectory kind holding structured JSON domain records.
pub const DOMAIN_DIR_TYPE: &str = "domains";

/// Per-snapshot flat listing used as the first search fallback.
pub const FLAT_INDEX_FILE: &str = ".scratch-index";

/// One immutable snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub project: String,
    pub branch: Option<String>,
    pub timestamp: String,
    pub path: PathBuf,
    pub is_latest: bool,
}

impl SnapshotInfo {
    /// `project/timestamp` or `project/branch/timestamp`.
    pub fn label(&self) -> String {
        match &self.branch {
            Some(branch) => format!("{}/{}/{}", self.project, branch, self.timestamp),
            None => format!("{}/{}", self.project, self.timestamp),
        }
    }
}

/// Where inside a document a record points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// 1-based line number in a free-text document.
    Line(i64),
    /// Dotted field path in a domain record, e.g. `key_files[0].purpose`.
    Field(String),
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Line(n) => write!(f, "{}", n),
            Locator::Field(path) => write!(f, "{}", path),
        }
    }
}

/// One row of the full-text index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub project: String,
    pub branch: Option<String>,
    pub timestamp: String,
    pub dir_type: String,
    /// Path relative to the snapshot directory, `/`-separated.
    pub path: String,
    pub locator: Locator,
    pub content: String,
}

/// A ranked search match.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub score: f64,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub timestamp: String,
    pub dir_type: String,
    pub path: String,
    pub line_or_field: String,
    #[serde(skip)]
    pub line: Option<i64>,
    #[serde(skip)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Absolute path of the document inside its snapshot.
    pub file: PathBuf,
}

impl SearchHit {
    /// `project[/branch]/timestamp/path:loc`
    pub fn display_path(&self) -> String {
        let mut out = self.project.clone();
        if let Some(branch) = &self.branch {
            out.push('/');
            out.push_str(branch);
        }
        format!(
            "{}/{}/{}:{}",
            out, self.timestamp, self.path, self.line_or_field
        )
    }

    /// File reference suitable for an external viewer (`file:line`).
    pub fn reference(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.file.display(), line),
            None => self.file.display().to_string(),
        }
    }
}
