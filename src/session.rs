//! Process-wide run state: configuration, the abort flag, and the
//! single-run-per-host lock.
//!
//! The lock record is JSON holding the owning pid; on conflict the owner's
//! liveness is checked via /proc so a crashed run cannot block all future
//! runs forever.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default lock path; overridable through `SNAPFERRY_LOCK` for tests and
/// unprivileged runs.
const LOCK_PATH: &str = "/run/snapferry.lock";
pub const LOCK_ENV: &str = "SNAPFERRY_LOCK";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("another run is already active (pid {pid}, lock {lock})")]
    AlreadyRunning { pid: u32, lock: String },

    #[error("could not acquire run lock at {lock}: {source}")]
    LockFailed {
        lock: String,
        #[source]
        source: std::io::Error,
    },
}

/// Stream compression choice for the transfer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    /// Identity passthrough.
    None,
    /// Single-threaded zstd.
    Zstd,
    /// Multi-threaded zstd; falls back to `zstd` when unavailable on
    /// either end.
    Pzstd,
}

impl Compression {
    pub fn codec(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Zstd => Some("zstd"),
            Compression::Pzstd => Some("pzstd"),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.codec() {
            Some(c) => write!(f, "{c}"),
            None => write!(f, "none"),
        }
    }
}

/// Everything the run was asked to do, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retain only the newest N destination snapshots after syncing.
    pub keep: Option<usize>,
    /// Delete destination snapshots with no corresponding source.
    pub delete_orphans: bool,
    pub compression: Compression,
    /// SSH port for the remote end.
    pub port: Option<u16>,
    /// Use already-replicated sources as extra delta hints.
    pub clone_mode: bool,
    /// Seed each transfer from the previously transferred snapshot.
    pub sequential_seeding: bool,
    /// Skip snapshots that would need a full (non-incremental) transfer.
    pub incremental_only: bool,
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Parent-directory levels recreated under the destination root.
    pub parent_depth: usize,
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep: None,
            delete_orphans: false,
            compression: Compression::None,
            port: None,
            clone_mode: false,
            sequential_seeding: false,
            incremental_only: false,
            retries: 2,
            parent_depth: 0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    started_at: i64,
}

/// Held for the duration of a run; the lock file is removed on drop, so
/// every exit path (including abort) releases it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn path_from_env() -> PathBuf {
        std::env::var(LOCK_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(LOCK_PATH))
    }

    /// Atomically create the lock file. An existing lock whose owner is no
    /// longer alive is treated as stale and replaced.
    pub fn acquire() -> Result<Self, SessionError> {
        let path = Self::path_from_env();
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        started_at: chrono::Utc::now().timestamp(),
                    };
                    serde_json::to_writer(file, &record).map_err(|e| {
                        SessionError::LockFailed {
                            lock: path.display().to_string(),
                            source: std::io::Error::new(ErrorKind::Other, e),
                        }
                    })?;
                    tracing::debug!(lock = %path.display(), pid = record.pid, "run lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                    let owner = Self::read_owner(&path);
                    match owner {
                        Some(pid) if process_alive(pid) => {
                            return Err(SessionError::AlreadyRunning {
                                pid,
                                lock: path.display().to_string(),
                            });
                        }
                        _ => {
                            tracing::warn!(
                                lock = %path.display(),
                                "removing stale run lock (owner not alive)"
                            );
                            let _ = fs::remove_file(&path);
                        }
                    }
                }
                Err(e) => {
                    return Err(SessionError::LockFailed {
                        lock: path.display().to_string(),
                        source: e,
                    });
                }
            }
        }
        unreachable!("lock acquisition loop always returns")
    }

    fn read_owner(path: &Path) -> Option<u32> {
        let content = fs::read_to_string(path).ok()?;
        let record: LockRecord = serde_json::from_str(&content).ok()?;
        Some(record.pid)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Run state threaded through every component call.
pub struct SyncSession {
    pub config: Config,
    abort: Arc<AtomicBool>,
    /// Source paths replicated during this run, in order; clone-mode hints.
    pub cloned_sources: Vec<String>,
    /// Most recently transferred source path; sequential-seeding seed.
    pub next_seed: Option<String>,
    _lock: RunLock,
}

impl SyncSession {
    /// Acquire the run lock and set up session state.
    pub fn open(config: Config) -> Result<Self, SessionError> {
        let lock = RunLock::acquire()?;
        Ok(Self {
            config,
            abort: Arc::new(AtomicBool::new(false)),
            cloned_sources: Vec::new(),
            next_seed: None,
            _lock: lock,
        })
    }

    /// Handle for the cancellation signal handler.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Checked between snapshot iterations, never mid-pipeline.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}
