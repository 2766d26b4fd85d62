//! Search without the index.
//!
//! Every snapshot carries a `.scratch-index` listing written when it was
//! archived, one `path:loc:content` line per record. When the FTS store is
//! missing or corrupt, search reads those listings; snapshots without one
//! are extracted on the fly. Matching requires every query term to appear
//! in the record (case-insensitive substring) and hits are ranked with a
//! small tf-idf scorer computed over the scanned records.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::extract::Extractor;
use crate::models::{IndexRecord, Locator, SearchHit, SnapshotInfo, FLAT_INDEX_FILE};
use crate::search::{self, Backend, SearchOutcome, SearchQuery};
use crate::snapshot::SnapshotStore;

/// Write the flat listing for `snapshot` and return its path.
pub fn write_flat_index(snapshot: &SnapshotInfo, records: &[IndexRecord]) -> Result<PathBuf> {
    let path = snapshot.path.join(FLAT_INDEX_FILE);
    let staged = snapshot.path.join(format!("{}.tmp", FLAT_INDEX_FILE));

    let mut out = std::io::BufWriter::new(fs::File::create(&staged)?);
    for record in records {
        writeln!(
            out,
            "{}:{}:{}",
            record.path,
            record.locator,
            record.content.replace(['\r', '\n'], " ")
        )?;
    }
    out.flush()?;
    drop(out);
    fs::rename(&staged, &path)?;
    Ok(path)
}

/// Extract `snapshot` and write its flat listing.
pub fn build_flat_index(extractor: &Extractor, snapshot: &SnapshotInfo) -> Result<PathBuf> {
    let extraction = extractor.extract(snapshot);
    write_flat_index(snapshot, &extraction.records)
}

/// Split one listing line into `(path, locator, content)`.
fn parse_flat_line(line: &str) -> Option<(&str, Locator, &str)> {
    let mut parts = line.splitn(3, ':');
    let path = parts.next().filter(|p| !p.is_empty())?;
    let loc = parts.next().filter(|l| !l.is_empty())?;
    let content = parts.next()?;
    let locator = match loc.parse::<i64>() {
        Ok(n) => Locator::Line(n),
        Err(_) => Locator::Field(loc.to_string()),
    };
    Some((path, locator, content))
}

fn read_flat_index(
    extractor: &Extractor,
    snapshot: &SnapshotInfo,
    listing: &Path,
) -> Result<Vec<IndexRecord>> {
    let text = fs::read_to_string(listing)?;
    let records = text
        .lines()
        .filter_map(parse_flat_line)
        .filter_map(|(path, locator, content)| {
            let dir_type = extractor.classify(Path::new(path))?;
            Some(IndexRecord {
                project: snapshot.project.clone(),
                branch: snapshot.branch.clone(),
                timestamp: snapshot.timestamp.clone(),
                dir_type,
                path: path.to_string(),
                locator,
                content: content.to_string(),
            })
        })
        .collect();
    Ok(records)
}

pub fn search(
    config: &Config,
    store: &SnapshotStore,
    query: &SearchQuery,
    limit: i64,
) -> Result<SearchOutcome> {
    let extractor = Extractor::new(config);
    let scorer = TermScorer::new(&query.pattern);
    let mut backend = Backend::FlatIndex;

    let snapshots = if query.latest_only {
        search::latest_snapshots(store, query.project.as_deref())?
    } else {
        match store.list_snapshots(query.project.as_deref()) {
            Ok(all) => all,
            Err(ArchiveError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        }
    };

    let mut records = Vec::new();
    for snapshot in snapshots
        .iter()
        .filter(|s| query.branch.is_none() || s.branch == query.branch)
    {
        let listing = snapshot.path.join(FLAT_INDEX_FILE);
        let mut found = match read_flat_index(&extractor, snapshot, &listing) {
            Ok(found) => found,
            Err(err) => {
                if listing.exists() {
                    warn!(snapshot = %snapshot.label(), error = %err, "unreadable flat index");
                }
                debug!(snapshot = %snapshot.label(), "scanning snapshot files");
                backend = Backend::RawScan;
                extractor.extract(snapshot).records
            }
        };
        if let Some(dir_type) = &query.dir_type {
            found.retain(|r| &r.dir_type == dir_type);
        }
        records.append(&mut found);
    }

    let mut hits: Vec<SearchHit> = scorer
        .score(&records)
        .into_iter()
        .map(|(idx, score)| to_hit(store, &records[idx], score))
        .collect();
    search::sort_hits(&mut hits, config.search.tie_break);
    hits.truncate(limit as usize);

    Ok(SearchOutcome { backend, hits })
}

fn to_hit(store: &SnapshotStore, record: &IndexRecord, score: f64) -> SearchHit {
    let file = store
        .lineage_dir(&record.project, record.branch.as_deref())
        .join(&record.timestamp)
        .join(&record.path);
    let line = match record.locator {
        Locator::Line(n) => Some(n),
        Locator::Field(_) => None,
    };
    SearchHit {
        score,
        project: record.project.clone(),
        branch: record.branch.clone(),
        timestamp: record.timestamp.clone(),
        dir_type: record.dir_type.clone(),
        path: record.path.clone(),
        line_or_field: record.locator.to_string(),
        line,
        content: record.content.clone(),
        snippet: None,
        file,
    }
}

/// tf-idf over lowercase query terms.
#[derive(Debug, Clone)]
pub struct TermScorer {
    terms: Vec<String>,
}

impl TermScorer {
    pub fn new(pattern: &str) -> Self {
        let mut terms: Vec<String> = pattern
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .filter(|t| !matches!(*t, "AND" | "OR" | "NOT" | "NEAR"))
            .map(|t| t.to_lowercase())
            .collect();
        terms.sort();
        terms.dedup();
        Self { terms }
    }

    /// `(index, score)` of every record containing all terms.
    pub fn score(&self, records: &[IndexRecord]) -> Vec<(usize, f64)> {
        if self.terms.is_empty() || records.is_empty() {
            return Vec::new();
        }

        let counts: Vec<Vec<usize>> = records
            .iter()
            .map(|r| {
                let text = r.content.to_lowercase();
                self.terms.iter().map(|t| text.matches(t.as_str()).count()).collect()
            })
            .collect();

        let n = records.len() as f64;
        let idf: Vec<f64> = (0..self.terms.len())
            .map(|t| {
                let df = counts.iter().filter(|c| c[t] > 0).count() as f64;
                (1.0 + n / df.max(1.0)).ln()
            })
            .collect();

        counts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.iter().all(|&tf| tf > 0))
            .map(|(i, c)| {
                let score = c
                    .iter()
                    .zip(&idf)
                    .map(|(&tf, idf)| {
                        let tf = tf as f64;
                        tf / (tf + 1.0) * idf
                    })
                    .sum();
                (i, score)
            })
            .collect()
    }
}
