//! TOML configuration.
//!
//! A [`Config`] value is built once at the binary edge and passed by
//! reference into every component. Nothing below this module reads
//! environment variables or global state.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Knowledge directory kinds recognized by the extractor.
pub const DEFAULT_DIR_TYPES: [&str; 9] = [
    "plans", "context", "research", "reviews", "filebox", "history", "prompts", "features",
    "domains",
];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArchiveConfig {
    /// Base directory holding one subdirectory per project.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Glob patterns (relative to the source dir) left out of snapshots.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Use `{project}/{branch}/{timestamp}` whenever a branch is inferred.
    #[serde(default)]
    pub branch_scoped: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

fn default_busy_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_dir_types")]
    pub dir_types: Vec<String>,
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            dir_types: default_dir_types(),
            text_extensions: default_text_extensions(),
        }
    }
}

fn default_dir_types() -> Vec<String> {
    DEFAULT_DIR_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_text_extensions() -> Vec<String> {
    vec!["md".to_string()]
}

/// How equal relevance scores are ordered.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Newer snapshots first.
    #[default]
    Recency,
    /// Earlier lines first.
    Position,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Lines of context on each side of a matched line in snippets.
    #[serde(default = "default_snippet_context")]
    pub snippet_context: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            tie_break: TieBreak::default(),
            snippet_context: default_snippet_context(),
        }
    }
}

fn default_limit() -> i64 {
    20
}
fn default_snippet_context() -> usize {
    1
}

/// Where post-archive ingestion runs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Spawn a detached `sarc ingest` process and return immediately.
    #[default]
    Detached,
    /// Hand the job to an in-process worker task. The dispatching call
    /// returns at once; `sarc` prints its report and then stays alive until
    /// the queue has drained.
    Worker,
    /// Never ingest automatically.
    Off,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub mode: IngestMode,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: IngestMode::default(),
            log_file: None,
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

impl Config {
    /// Defaults with the given archive root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.archive.root = Some(root.into());
        config
    }

    pub fn archive_root(&self) -> PathBuf {
        self.archive
            .root
            .clone()
            .unwrap_or_else(|| home_dir().join("scratch_archive"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db
            .path
            .clone()
            .unwrap_or_else(|| self.archive_root().join("archives.db"))
    }

    pub fn ingest_log_path(&self) -> PathBuf {
        self.ingest
            .log_file
            .clone()
            .unwrap_or_else(|| self.archive_root().join("ingest.log"))
    }

    pub fn is_dir_type(&self, name: &str) -> bool {
        self.extract.dir_types.iter().any(|t| t == name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive: ArchiveConfig::default(),
            db: DbConfig::default(),
            extract: ExtractConfig::default(),
            search: SearchConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(config)
}

/// Check invariants and normalize `~` prefixes.
pub fn validate(mut config: Config) -> Result<Config> {
    if config.search.default_limit < 1 {
        bail!("search.default_limit must be >= 1");
    }

    if config.extract.dir_types.is_empty() {
        bail!("extract.dir_types must not be empty");
    }

    if config.extract.text_extensions.is_empty() {
        bail!("extract.text_extensions must not be empty");
    }

    for pattern in &config.archive.exclude {
        globset::Glob::new(pattern)
            .with_context(|| format!("archive.exclude has an invalid glob: '{}'", pattern))?;
    }

    config.archive.root = config.archive.root.as_deref().map(expand_tilde);
    config.db.path = config.db.path.as_deref().map(expand_tilde);
    config.ingest.log_file = config.ingest.log_file.as_deref().map(expand_tilde);

    Ok(config)
}
