//! Query engine.
//!
//! Ranked keyword search over the FTS5 index with project, dir_type, branch
//! and latest-only filters. Relevance is SQLite's BM25 (negated so higher is
//! better); equal scores are ordered by [`TieBreak`].
//!
//! When the index is missing or unreadable the engine degrades instead of
//! failing: first to the per-snapshot flat listings, then to scanning the
//! snapshot files directly (see [`crate::fallback`]).

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::{Config, TieBreak};
use crate::db;
use crate::error::{ArchiveError, Result};
use crate::fallback;
use crate::models::{SearchHit, SnapshotInfo};
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub pattern: String,
    pub project: Option<String>,
    pub dir_type: Option<String>,
    pub branch: Option<String>,
    pub latest_only: bool,
    /// Falls back to `[search] default_limit`.
    pub limit: Option<i64>,
    /// Pass the pattern to FTS5 unmodified.
    pub raw: bool,
    /// Attach surrounding lines from the snapshot file to each hit.
    pub snippets: bool,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }
}

/// Which layer answered the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Index,
    FlatIndex,
    RawScan,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Index => "index",
            Backend::FlatIndex => "flat-index",
            Backend::RawScan => "raw-scan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub backend: Backend,
    pub hits: Vec<SearchHit>,
}

pub async fn search(config: &Config, query: &SearchQuery) -> Result<SearchOutcome> {
    let limit = query.limit.unwrap_or(config.search.default_limit).max(1);
    let empty = SearchOutcome {
        backend: Backend::Index,
        hits: Vec::new(),
    };

    let fts_query = if query.raw {
        query.pattern.trim().to_string()
    } else {
        to_fts_query(&query.pattern)
    };
    if fts_query.is_empty() {
        return Ok(empty);
    }

    let store = SnapshotStore::new(config)?;
    let from_index = match db::open_existing(config).await {
        Ok(pool) => {
            let result = search_index(config, &store, &pool, query, &fts_query, limit).await;
            pool.close().await;
            result
        }
        Err(err) => Err(err),
    };

    let mut outcome = match from_index {
        Ok(hits) => SearchOutcome {
            backend: Backend::Index,
            hits,
        },
        Err(ArchiveError::IndexUnavailable(reason)) => {
            warn!(%reason, "index unavailable, searching snapshot files");
            fallback::search(config, &store, query, limit)?
        }
        Err(err) => return Err(err),
    };

    if query.snippets {
        attach_snippets(&mut outcome.hits, config.search.snippet_context);
    }
    debug!(backend = %outcome.backend, hits = outcome.hits.len(), "search finished");
    Ok(outcome)
}

async fn search_index(
    config: &Config,
    store: &SnapshotStore,
    pool: &SqlitePool,
    query: &SearchQuery,
    fts_query: &str,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let mut sql = String::from(
        r#"
        SELECT r.project, r.branch, r.timestamp, r.dir_type, r.path, r.line, r.field,
               records_fts.content AS content,
               -bm25(records_fts) AS score
        FROM records_fts
        JOIN records r ON r.id = records_fts.rowid
        WHERE records_fts MATCH ?
        "#,
    );
    let mut binds: Vec<String> = vec![fts_query.to_string()];

    if let Some(project) = &query.project {
        sql.push_str(" AND r.project = ?");
        binds.push(project.clone());
    }
    if let Some(dir_type) = &query.dir_type {
        sql.push_str(" AND r.dir_type = ?");
        binds.push(dir_type.clone());
    }
    if let Some(branch) = &query.branch {
        sql.push_str(" AND r.branch = ?");
        binds.push(branch.clone());
    }
    if query.latest_only {
        let latest = latest_snapshots(store, query.project.as_deref())?;
        if latest.is_empty() {
            return Ok(Vec::new());
        }
        let tuples = vec!["(?, ?, ?)"; latest.len()].join(", ");
        sql.push_str(&format!(
            " AND (r.project, r.branch, r.timestamp) IN (VALUES {})",
            tuples
        ));
        for s in latest {
            binds.push(s.project);
            binds.push(s.branch.unwrap_or_default());
            binds.push(s.timestamp);
        }
    }

    sql.push_str(" ORDER BY score DESC, ");
    sql.push_str(match config.search.tie_break {
        TieBreak::Recency => "r.timestamp DESC, r.path, COALESCE(r.line, 0)",
        TieBreak::Position => "COALESCE(r.line, 0), r.timestamp DESC, r.path",
    });
    sql.push_str(" LIMIT ?");

    let mut q = sqlx::query(&sql);
    for value in &binds {
        q = q.bind(value);
    }
    let rows = q
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| classify_query_error(e, query.raw))?;

    let hits = rows
        .iter()
        .map(|row| {
            let project: String = row.get("project");
            let branch: String = row.get("branch");
            let branch = (!branch.is_empty()).then_some(branch);
            let timestamp: String = row.get("timestamp");
            let path: String = row.get("path");
            let line: Option<i64> = row.get("line");
            let field: Option<String> = row.get("field");

            let file = store
                .lineage_dir(&project, branch.as_deref())
                .join(&timestamp)
                .join(&path);
            SearchHit {
                score: row.get("score"),
                line_or_field: match line {
                    Some(n) => n.to_string(),
                    None => field.unwrap_or_default(),
                },
                line,
                project,
                branch,
                timestamp,
                dir_type: row.get("dir_type"),
                path,
                content: row.get("content"),
                snippet: None,
                file,
            }
        })
        .collect();
    Ok(hits)
}

/// Snapshots the live `latest` pointers name, optionally for one project.
pub(crate) fn latest_snapshots(
    store: &SnapshotStore,
    project: Option<&str>,
) -> Result<Vec<SnapshotInfo>> {
    match store.list_snapshots(project) {
        Ok(all) => Ok(all.into_iter().filter(|s| s.is_latest).collect()),
        Err(ArchiveError::NotFound { .. }) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn classify_query_error(err: sqlx::Error, raw: bool) -> ArchiveError {
    if let sqlx::Error::Database(db_err) = &err {
        // SQLITE_CORRUPT, SQLITE_NOTADB
        if matches!(db_err.code().as_deref(), Some("11") | Some("26")) {
            return ArchiveError::IndexUnavailable(db_err.message().to_string());
        }
        if raw && db_err.message().contains("fts5") {
            return ArchiveError::InvalidQuery(db_err.message().to_string());
        }
    }
    ArchiveError::Database(err)
}

/// Quote user input for FTS5 MATCH.
///
/// Bare words become quoted terms and `"double quoted"` runs stay phrases, so
/// operators and punctuation in the input are always matched literally.
/// Terms are implicitly AND-ed.
pub fn to_fts_query(pattern: &str) -> String {
    let mut terms = Vec::new();
    let mut rest = pattern.trim();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('"') {
            let (phrase, tail) = match after.find('"') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => (after, ""),
            };
            push_term(&mut terms, phrase);
            rest = tail.trim_start();
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '"')
                .unwrap_or(rest.len());
            push_term(&mut terms, &rest[..end]);
            rest = rest[end..].trim_start();
        }
    }
    terms.join(" ")
}

fn push_term(terms: &mut Vec<String>, text: &str) {
    // a term with no word characters would make an empty phrase
    if !text.chars().any(char::is_alphanumeric) {
        return;
    }
    terms.push(format!("\"{}\"", text.trim().replace('"', "\"\"")));
}

/// Order by score, then by the configured tie-break.
pub(crate) fn sort_hits(hits: &mut [SearchHit], tie_break: TieBreak) {
    hits.sort_by(|a, b| {
        let by_score = b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal);
        let recency = b.timestamp.cmp(&a.timestamp);
        let position = a.line.unwrap_or(0).cmp(&b.line.unwrap_or(0));
        let ties = match tie_break {
            TieBreak::Recency => recency.then(a.path.cmp(&b.path)).then(position),
            TieBreak::Position => position.then(recency).then(a.path.cmp(&b.path)),
        };
        by_score.then(ties)
    });
}

/// Fill `snippet` with `context` lines around each matched line.
///
/// Field hits carry their flattened text. Files that have since moved (for
/// example into `_review`) get no snippet.
pub fn attach_snippets(hits: &mut [SearchHit], context: usize) {
    let mut cache: HashMap<PathBuf, Option<Vec<String>>> = HashMap::new();
    for hit in hits.iter_mut() {
        let Some(line) = hit.line else {
            hit.snippet = Some(format!("{}: {}", hit.line_or_field, hit.content));
            continue;
        };
        let lines = cache.entry(hit.file.clone()).or_insert_with(|| {
            fs::read(&hit.file).ok().map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .map(String::from)
                    .collect()
            })
        });
        let Some(lines) = lines else {
            continue;
        };

        let idx = (line.max(1) - 1) as usize;
        if idx >= lines.len() {
            continue;
        }
        let start = idx.saturating_sub(context);
        let end = (idx + context + 1).min(lines.len());
        hit.snippet = Some(lines[start..end].join("\n"));
    }
}

/// Output format for the `search` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    /// Numbered, human-oriented listing.
    Pretty,
    /// One tab-separated line per hit, for pipes.
    Tabular,
    Json,
    /// Unique `file:line` references for an external viewer.
    FileName,
}

impl Render {
    /// Pretty on a terminal, tab-separated otherwise.
    pub fn auto() -> Self {
        if atty::is(atty::Stream::Stdout) {
            Render::Pretty
        } else {
            Render::Tabular
        }
    }
}

pub fn print_outcome(outcome: &SearchOutcome, render: Render) -> Result<()> {
    if render == Render::Json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    if outcome.hits.is_empty() {
        if render == Render::Pretty {
            println!("No results.");
        }
        return Ok(());
    }

    match render {
        Render::FileName => {
            let mut seen = std::collections::HashSet::new();
            for hit in &outcome.hits {
                let reference = hit.reference();
                if seen.insert(reference.clone()) {
                    println!("{}", reference);
                }
            }
        }
        Render::Tabular => {
            for hit in &outcome.hits {
                println!(
                    "{:.4}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    hit.score,
                    hit.project,
                    hit.branch.as_deref().unwrap_or(""),
                    hit.timestamp,
                    hit.dir_type,
                    hit.path,
                    hit.line_or_field,
                    hit.content.replace(['\t', '\n'], " ")
                );
            }
        }
        Render::Pretty => {
            if outcome.backend != Backend::Index {
                println!("(index unavailable; results from {})", outcome.backend);
                println!();
            }
            for (i, hit) in outcome.hits.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} ({})",
                    i + 1,
                    hit.score,
                    hit.display_path(),
                    hit.dir_type
                );
                match &hit.snippet {
                    Some(snippet) => {
                        for line in snippet.lines() {
                            println!("    {}", line);
                        }
                    }
                    None => println!("    {}", hit.content.trim()),
                }
                println!();
            }
        }
        Render::Json => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(score: f64, timestamp: &str, line: i64) -> SearchHit {
        SearchHit {
            score,
            project: "demo".into(),
            branch: None,
            timestamp: timestamp.into(),
            dir_type: "plans".into(),
            path: "plans/todo.md".into(),
            line_or_field: line.to_string(),
            line: Some(line),
            content: "fix login bug".into(),
            snippet: None,
            file: PathBuf::from("/nonexistent/plans/todo.md"),
        }
    }

    #[test]
    fn fts_query_quotes_words() {
        assert_eq!(to_fts_query("login bug"), r#""login" "bug""#);
        assert_eq!(to_fts_query("  auth  "), r#""auth""#);
    }

    #[test]
    fn fts_query_keeps_phrases() {
        assert_eq!(
            to_fts_query(r#""login bug" refresh"#),
            r#""login bug" "refresh""#
        );
        assert_eq!(to_fts_query(r#""unterminated phrase"#), r#""unterminated phrase""#);
    }

    #[test]
    fn fts_query_neutralizes_operators() {
        assert_eq!(to_fts_query("NOT auth*"), r#""NOT" "auth*""#);
        assert_eq!(to_fts_query("nonexistent-term"), r#""nonexistent-term""#);
        assert_eq!(to_fts_query("-- ()"), "");
        assert_eq!(to_fts_query(""), "");
    }

    #[test]
    fn ties_prefer_recent_snapshots() {
        let mut hits = vec![
            hit(1.0, "20260101_090000", 1),
            hit(2.0, "20250101_090000", 9),
            hit(1.0, "20260201_090000", 5),
        ];
        sort_hits(&mut hits, TieBreak::Recency);
        let order: Vec<&str> = hits.iter().map(|h| h.timestamp.as_str()).collect();
        assert_eq!(
            order,
            ["20250101_090000", "20260201_090000", "20260101_090000"]
        );
    }

    #[test]
    fn ties_by_position_prefer_earlier_lines() {
        let mut hits = vec![hit(1.0, "20260201_090000", 5), hit(1.0, "20260101_090000", 1)];
        sort_hits(&mut hits, TieBreak::Position);
        assert_eq!(hits[0].line, Some(1));
    }

    #[test]
    fn snippets_read_context_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("todo.md");
        fs::write(&file, "# Todo\nfirst\nfix login bug\nlast\n").unwrap();

        let mut hits = vec![hit(1.0, "20260101_090000", 3)];
        hits[0].file = file;
        attach_snippets(&mut hits, 1);
        assert_eq!(hits[0].snippet.as_deref(), Some("first\nfix login bug\nlast"));
    }

    #[test]
    fn snippets_skip_missing_files() {
        let mut hits = vec![hit(1.0, "20260101_090000", 3)];
        attach_snippets(&mut hits, 2);
        assert!(hits[0].snippet.is_none());
    }
}
