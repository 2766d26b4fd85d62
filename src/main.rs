//! # Scratch Archive CLI (`sarc`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sarc init` | Create the index database and schema |
//! | `sarc archive [SOURCE]` | Snapshot a knowledge directory and queue indexing |
//! | `sarc list` | List snapshots, newest first |
//! | `sarc ingest` | Re-index one or all projects |
//! | `sarc search "<pattern>"` | Ranked keyword search |
//! | `sarc dedup <project>` | Retire older duplicate files to `_review` |
//! | `sarc stats` | Index statistics |
//! | `sarc completions <shell>` | Print a shell completion script |
//!
//! ## Exit codes
//!
//! `0` success, `1` fatal, `2` not found, `3` partial (documents skipped).

use anyhow::Context;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use scratch_archive::archive::{self, ArchiveRequest};
use scratch_archive::config::{self, Config};
use scratch_archive::dedup;
use scratch_archive::error::ArchiveError;
use scratch_archive::ingest;
use scratch_archive::listing;
use scratch_archive::logging;
use scratch_archive::migrate;
use scratch_archive::queue::Dispatcher;
use scratch_archive::search::{self, Render, SearchQuery};
use scratch_archive::snapshot::SnapshotStore;
use scratch_archive::stats;

/// Scratch Archive: snapshot and search per-project knowledge directories.
#[derive(Parser)]
#[command(name = "sarc", version)]
struct Cli {
    /// Path to a TOML configuration file. Built-in defaults apply without one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Archive root. Overrides `[archive].root` from the config file.
    #[arg(long, global = true, env = "SCRATCH_ARCHIVE_BASE")]
    root: Option<PathBuf>,

    /// More log output on stderr (repeat for more).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index database and schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Snapshot a knowledge directory.
    ///
    /// Copies SOURCE (default: `.giantmem/` or `scratch/` under the current
    /// directory) to `{root}/{project}/{timestamp}/`, points `latest` at it,
    /// and queues a background re-index of the project.
    Archive {
        /// Directory to archive.
        source: Option<PathBuf>,

        /// Project name. Inferred from the git checkout when omitted.
        #[arg(long)]
        project: Option<String>,

        /// Store under `{project}/{branch}/`.
        #[arg(long)]
        branch: Option<String>,

        /// Snapshot timestamp (YYYYMMDD_HHMMSS). Defaults to now.
        #[arg(long)]
        timestamp: Option<String>,

        /// Do not queue a re-index.
        #[arg(long)]
        no_index: bool,
    },

    /// List snapshots, newest first.
    List {
        #[arg(short, long)]
        project: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Re-index snapshots into the full-text index.
    ///
    /// Additive by default: only the named project (or every project) is
    /// replaced. `--full` drops and rebuilds the whole index.
    Ingest {
        #[arg(short, long)]
        project: Option<String>,

        #[arg(long, conflicts_with = "project")]
        full: bool,

        /// Append logs to this file instead of stderr.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Search archived documents.
    Search {
        /// Words or "quoted phrases"; every term must match.
        pattern: String,

        #[arg(short, long)]
        project: Option<String>,

        /// Restrict to one dir_type (plans, context, domains, ...).
        #[arg(short = 't', long = "type")]
        dir_type: Option<String>,

        #[arg(short, long)]
        branch: Option<String>,

        /// Only search the snapshots `latest` points at.
        #[arg(short, long)]
        latest: bool,

        /// Maximum number of results.
        #[arg(short = 'n', long)]
        limit: Option<i64>,

        /// Show surrounding lines for each match.
        #[arg(long)]
        full: bool,

        #[arg(long, conflicts_with = "file_name")]
        json: bool,

        /// Print `file:line` references only.
        #[arg(long)]
        file_name: bool,

        /// Pass the pattern to FTS5 unmodified.
        #[arg(long)]
        raw: bool,
    },

    /// Move older duplicate files to the project's `_review` area.
    Dedup {
        project: String,

        /// Print the planned moves without changing anything.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Print a shell completion script.
    Completions { shell: clap_complete::Shell },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Ingest { log_file, .. } => log_file.clone(),
        _ => None,
    };
    if let Err(err) = logging::init(cli.verbose, cli.quiet, log_file.as_deref()) {
        eprintln!("error: cannot open log: {}", err);
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            if log_file.is_some() {
                tracing::error!("{:#}", err);
            }
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<ArchiveError>()
                .map(ArchiveError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    if let Some(root) = &cli.root {
        cfg.archive.root = Some(root.clone());
    }
    config::validate(cfg)
}

/// Flush the command's report, then let an in-process worker finish the
/// jobs it was handed. Detached and disabled dispatchers return at once.
async fn drain(dispatcher: Dispatcher) -> anyhow::Result<()> {
    std::io::stdout().flush()?;
    dispatcher.finish().await;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "sarc", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let cfg = load(&cli)?;

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(cfg.archive_root())
                .with_context(|| format!("cannot create {}", cfg.archive_root().display()))?;
            migrate::run_migrations(&cfg).await?;
            println!("Index initialized at {}", cfg.db_path().display());
        }
        Commands::Archive {
            source,
            project,
            branch,
            timestamp,
            no_index,
        } => {
            let request = ArchiveRequest {
                source,
                project,
                branch,
                timestamp,
                no_index,
            };
            let dispatcher = Dispatcher::from_config(&cfg, cli.config.as_deref())?;
            let cwd = std::env::current_dir()?;
            let result = archive::run_archive(&cfg, &cwd, &request, &dispatcher);
            if let Ok(report) = &result {
                println!("{}", report.summary());
                println!("  {}", report.snapshot.path.display());
                if report.ingest_queued {
                    println!("Index update queued for {}.", report.snapshot.project);
                }
            }
            drain(dispatcher).await?;
            result?;
        }
        Commands::List { project, json } => {
            let store = SnapshotStore::new(&cfg)?;
            let snapshots = store.list_snapshots(project.as_deref())?;
            listing::print_snapshots(&snapshots, json)?;
        }
        Commands::Ingest { project, full, .. } => {
            let report = ingest::run_ingest(&cfg, project.as_deref(), full).await?;
            for p in &report.projects {
                println!(
                    "ingest {}: snapshots {}  documents {}  records {}  skipped {}",
                    p.project, p.snapshots, p.documents, p.records, p.skipped
                );
            }
            for project in &report.purged {
                println!("purged {}: no longer in the archive", project);
            }
            println!(
                "{} records from {} documents{}",
                report.records(),
                report.documents(),
                if report.full_rebuild { " (full rebuild)" } else { "" }
            );
            if report.is_partial() {
                eprintln!(
                    "warning: {} documents skipped; run with -v for details",
                    report.skipped()
                );
                return Ok(ExitCode::from(3));
            }
        }
        Commands::Search {
            pattern,
            project,
            dir_type,
            branch,
            latest,
            limit,
            full,
            json,
            file_name,
            raw,
        } => {
            let query = SearchQuery {
                pattern,
                project,
                dir_type,
                branch,
                latest_only: latest,
                limit,
                raw,
                snippets: full,
            };
            let render = if json {
                Render::Json
            } else if file_name {
                Render::FileName
            } else {
                Render::auto()
            };
            let outcome = search::search(&cfg, &query).await?;
            search::print_outcome(&outcome, render)?;
        }
        Commands::Dedup {
            project,
            dry_run,
            json,
        } => {
            let dispatcher = Dispatcher::from_config(&cfg, cli.config.as_deref())?;
            let result = dedup::reconcile(&cfg, &project, dry_run, &dispatcher);
            if let Ok(report) = &result {
                dedup::print_report(report, json)?;
            }
            drain(dispatcher).await?;
            result?;
        }
        Commands::Stats { json } => {
            let stats = stats::collect_stats(&cfg).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                stats::print_stats(&stats);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}
