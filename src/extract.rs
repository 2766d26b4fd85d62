//! Document extraction: snapshot tree → index records.
//!
//! Each file is classified by the nearest enclosing directory whose name is a
//! recognized kind (`plans`, `context`, … `domains`); files outside any such
//! directory are not indexed. Markdown yields one record per non-empty line.
//! JSON under `domains/` is flattened into one record per leaf field.
//!
//! Extraction never fails as a whole. A document that cannot be read or
//! parsed is reported in [`Extraction::skipped`] and the walk continues.

use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::flatten::flatten;
use crate::models::{IndexRecord, Locator, SnapshotInfo, DOMAIN_DIR_TYPE, FLAT_INDEX_FILE};

/// Entries never treated as documents.
const SKIP_FILES: [&str; 2] = [FLAT_INDEX_FILE, ".DS_Store"];
const SKIP_DIRS: [&str; 1] = [".git"];

#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<IndexRecord>,
    pub documents: u64,
    pub skipped: Vec<ArchiveError>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    dir_types: Vec<String>,
    text_extensions: Vec<String>,
}

/// How a classified document is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentKind {
    Text,
    Domain,
}

impl Extractor {
    pub fn new(config: &Config) -> Self {
        Self {
            dir_types: config.extract.dir_types.clone(),
            text_extensions: config
                .extract
                .text_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// dir_type of a snapshot-relative path: its nearest recognized ancestor.
    pub fn classify(&self, relative: &Path) -> Option<String> {
        relative
            .parent()?
            .components()
            .rev()
            .filter_map(|c| c.as_os_str().to_str())
            .find(|name| self.dir_types.iter().any(|t| t == *name))
            .map(String::from)
    }

    fn kind_of(&self, relative: &Path, dir_type: &str) -> Option<DocumentKind> {
        let ext = relative.extension()?.to_str()?.to_ascii_lowercase();
        if dir_type == DOMAIN_DIR_TYPE && ext == "json" {
            Some(DocumentKind::Domain)
        } else if self.text_extensions.contains(&ext) {
            Some(DocumentKind::Text)
        } else {
            None
        }
    }

    pub fn extract(&self, snapshot: &SnapshotInfo) -> Extraction {
        let mut extraction = Extraction::default();
        let walker = WalkDir::new(&snapshot.path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir() && SKIP_DIRS.iter().any(|d| *d == name))
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(&snapshot.path).to_path_buf();
                    extraction.skipped.push(ArchiveError::PartialExtraction {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if SKIP_FILES.iter().any(|f| *f == name) {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&snapshot.path) else {
                continue;
            };
            let Some(dir_type) = self.classify(relative) else {
                continue;
            };
            let Some(kind) = self.kind_of(relative, &dir_type) else {
                continue;
            };

            match extract_document(snapshot, entry.path(), relative, &dir_type, kind) {
                Ok(mut records) => {
                    extraction.documents += 1;
                    extraction.records.append(&mut records);
                }
                Err(err) => {
                    debug!(error = %err, "document skipped");
                    extraction.skipped.push(err);
                }
            }
        }

        extraction
    }
}

/// `/`-separated form of a snapshot-relative path.
pub fn relative_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn extract_document(
    snapshot: &SnapshotInfo,
    path: &Path,
    relative: &Path,
    dir_type: &str,
    kind: DocumentKind,
) -> Result<Vec<IndexRecord>> {
    let skipped = |reason: String| ArchiveError::PartialExtraction {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| skipped(e.to_string()))?;
    let rel = relative_string(relative);

    let record = |locator: Locator, content: String| IndexRecord {
        project: snapshot.project.clone(),
        branch: snapshot.branch.clone(),
        timestamp: snapshot.timestamp.clone(),
        dir_type: dir_type.to_string(),
        path: rel.clone(),
        locator,
        content,
    };

    let records = match kind {
        DocumentKind::Text => text_lines(&String::from_utf8_lossy(&bytes))
            .map(|(line, text)| record(Locator::Line(line), text.to_string()))
            .collect(),
        DocumentKind::Domain => {
            let value: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(|e| skipped(e.to_string()))?;
            flatten(&value)
                .into_iter()
                .map(|f| record(Locator::Field(f.path), f.text))
                .collect()
        }
    };
    Ok(records)
}

/// Non-empty lines with their 1-based line numbers.
pub fn text_lines(text: &str) -> impl Iterator<Item = (i64, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i as i64 + 1, line.trim_end()))
        .filter(|(_, line)| !line.trim().is_empty())
}
