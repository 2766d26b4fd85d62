//! Tracing subscriber setup for the `sarc` binary.
//!
//! Interactive commands log to stderr so stdout stays parseable. A
//! background ingest started by `archive` or `dedup` has no terminal and
//! appends to its log file instead.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Overrides the verbosity flags when set, e.g. `scratch_archive=debug`.
pub const LOG_ENV: &str = "SCRATCH_ARCHIVE_LOG";

fn filter(verbose: u8, quiet: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return filter;
    }
    if quiet {
        return EnvFilter::new("error");
    }
    match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("scratch_archive=info,warn"),
        2 => EnvFilter::new("scratch_archive=debug,info"),
        _ => EnvFilter::new("trace"),
    }
}

/// Install the global subscriber. With `log_file`, output is appended there
/// at info level or above.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter(verbose, quiet))
            .with_writer(std::io::stderr)
            .without_time()
            .init();
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose.max(1), false))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}
