//! Background ingestion dispatch.
//!
//! Archive and dedup hand an [`IngestJob`] to an [`IngestDispatcher`] and
//! return without waiting. Every dispatcher owns its failures: errors are
//! logged where the job runs and never reach the caller that enqueued it.
//!
//! | Dispatcher | Where the job runs |
//! |------------|--------------------|
//! | [`DetachedProcess`] | a separate `sarc ingest` process logging to a file |
//! | [`IngestWorker`] | a tokio task in this process, draining a queue |
//! | [`NoIngest`] | nowhere; the user runs `sarc ingest` manually |

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, IngestMode};
use crate::error::Result;
use crate::ingest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestJob {
    /// `None` re-indexes every project.
    pub project: Option<String>,
    pub full_rebuild: bool,
}

impl IngestJob {
    pub fn project(name: impl Into<String>) -> Self {
        Self {
            project: Some(name.into()),
            full_rebuild: false,
        }
    }
}

pub trait IngestDispatcher: Send + Sync {
    /// Enqueue `job` and return immediately.
    fn dispatch(&self, job: IngestJob);
}

/// Dispatcher selected by `[ingest] mode`.
pub enum Dispatcher {
    Detached(DetachedProcess),
    Worker(IngestWorker),
    Off(NoIngest),
}

impl Dispatcher {
    /// `config_path` is forwarded to detached processes so they load the
    /// same settings as their launcher.
    pub fn from_config(config: &Config, config_path: Option<&Path>) -> Result<Self> {
        Ok(match config.ingest.mode {
            IngestMode::Detached => Self::Detached(DetachedProcess::new(config, config_path)?),
            IngestMode::Worker => Self::Worker(IngestWorker::spawn(config.clone())),
            IngestMode::Off => Self::Off(NoIngest),
        })
    }

    /// Let queued in-process work finish before the process exits.
    pub async fn finish(self) {
        if let Self::Worker(worker) = self {
            worker.shutdown().await;
        }
    }
}

impl IngestDispatcher for Dispatcher {
    fn dispatch(&self, job: IngestJob) {
        match self {
            Self::Detached(d) => d.dispatch(job),
            Self::Worker(w) => w.dispatch(job),
            Self::Off(n) => n.dispatch(job),
        }
    }
}

pub struct NoIngest;

impl IngestDispatcher for NoIngest {
    fn dispatch(&self, job: IngestJob) {
        debug!(project = ?job.project, "automatic ingestion disabled");
    }
}

/// Spawns `sarc ingest` as its own process and does not wait for it.
#[derive(Debug, Clone)]
pub struct DetachedProcess {
    exe: PathBuf,
    root: PathBuf,
    config_path: Option<PathBuf>,
    log_file: PathBuf,
}

impl DetachedProcess {
    pub fn new(config: &Config, config_path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            root: config.archive_root(),
            config_path: config_path.map(Path::to_path_buf),
            log_file: config.ingest_log_path(),
        })
    }

    /// Create the log file (and its directory) the child will append to.
    fn prepare_log(&self) -> std::io::Result<()> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        Ok(())
    }

    fn command(&self, job: &IngestJob) -> Command {
        let mut cmd = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("--root").arg(&self.root).arg("ingest");
        // a full rebuild covers every project
        if job.full_rebuild {
            cmd.arg("--full");
        } else if let Some(project) = &job.project {
            cmd.arg("--project").arg(project);
        }
        cmd.arg("--log-file").arg(&self.log_file);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // keep the child alive when the launching terminal sends SIGINT
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl IngestDispatcher for DetachedProcess {
    fn dispatch(&self, job: IngestJob) {
        // the child opens the log itself; this only surfaces problems early
        if let Err(err) = self.prepare_log() {
            debug!(log = %self.log_file.display(), error = %err, "ingest log not writable");
        }

        match self.command(&job).spawn() {
            Ok(child) => debug!(
                pid = child.id(),
                project = ?job.project,
                log = %self.log_file.display(),
                "background ingest started"
            ),
            Err(err) => warn!(error = %err, "could not start background ingest"),
        }
    }
}

/// Single in-process worker draining an unbounded queue.
pub struct IngestWorker {
    tx: mpsc::UnboundedSender<IngestJob>,
    handle: JoinHandle<()>,
}

impl IngestWorker {
    /// Must be called inside a tokio runtime.
    pub fn spawn(config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(config, rx));
        Self { tx, handle }
    }

    /// Close the queue and wait for the jobs already in it.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.handle.await {
            error!(error = %err, "ingest worker panicked");
        }
    }
}

impl IngestDispatcher for IngestWorker {
    fn dispatch(&self, job: IngestJob) {
        if self.tx.send(job).is_err() {
            warn!("ingest worker has stopped; job dropped");
        }
    }
}

async fn run_worker(config: Config, mut rx: mpsc::UnboundedReceiver<IngestJob>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(job) = rx.try_recv() {
            batch.push(job);
        }

        for job in coalesce(batch) {
            match ingest::run_ingest(&config, job.project.as_deref(), job.full_rebuild).await {
                Ok(report) => info!(
                    project = ?job.project,
                    records = report.records(),
                    skipped = report.skipped(),
                    "background ingest finished"
                ),
                Err(err) => error!(project = ?job.project, error = %err, "background ingest failed"),
            }
        }
    }
    debug!("ingest worker stopped");
}

/// Collapse a burst of jobs into the fewest runs covering all of them.
fn coalesce(jobs: Vec<IngestJob>) -> Vec<IngestJob> {
    if jobs.iter().any(|j| j.full_rebuild) {
        return vec![IngestJob {
            project: None,
            full_rebuild: true,
        }];
    }
    if jobs.iter().any(|j| j.project.is_none()) {
        return vec![IngestJob {
            project: None,
            full_rebuild: false,
        }];
    }

    let mut out: Vec<IngestJob> = Vec::new();
    for job in jobs {
        if !out.iter().any(|j| j.project == job.project) {
            out.push(job);
        }
    }
    out
}
