use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::commit::CourseLocks;
use crate::config::DaemonConfig;
use crate::db;
use crate::error::ImportError;
use crate::queue::{QueueProgress, QueuedTask, SqliteTaskQueue, TaskId, TaskQueue};
use crate::staging;
use crate::task::{ImportTask, TaskEnv, TaskState, TracingTaskLogger};

/// Execute one claimed task to a terminal state and persist the result.
pub fn run_claimed(
    conn: &Connection,
    locks: &CourseLocks,
    cfg: &DaemonConfig,
    queued: QueuedTask,
) -> Result<TaskState, ImportError> {
    let queue = SqliteTaskQueue::new(conn);
    let id = queued.id.clone();
    let mut task = ImportTask::from_parts(queued.id, queued.job);
    let progress = QueueProgress::new(&queue, id.clone());
    let logger = TracingTaskLogger::new(id.as_str(), &task.job().course_id);
    let env = TaskEnv {
        conn,
        locks,
        progress: &progress,
        logger: &logger,
        strict_mapping: cfg.strict_mapping,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.execute(&env)));
    if outcome.is_err() {
        tracing::error!(task_id = %id, "import task panicked");
        task.abandon(conn, "internal error while importing");
    }
    queue.save(&id, task.job())?;
    Ok(task.state())
}

/// Claim and run the next waiting task, if any.
pub fn run_next(
    conn: &Connection,
    locks: &CourseLocks,
    cfg: &DaemonConfig,
) -> Result<Option<(TaskId, TaskState)>, ImportError> {
    let queue = SqliteTaskQueue::new(conn);
    let Some(queued) = queue.claim_next()? else {
        return Ok(None);
    };
    let id = queued.id.clone();
    let state = run_claimed(conn, locks, cfg, queued)?;
    Ok(Some((id, state)))
}

/// Run every waiting task on the calling thread.
pub fn drain(
    conn: &Connection,
    locks: &CourseLocks,
    cfg: &DaemonConfig,
) -> Result<Vec<(TaskId, TaskState)>, ImportError> {
    let mut ran = Vec::new();
    while let Some(done) = run_next(conn, locks, cfg)? {
        ran.push(done);
    }
    Ok(ran)
}

/// Background threads polling the task queue of one workspace. Dropping the
/// pool stops and joins them.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workspace: &Path, cfg: &DaemonConfig, locks: &CourseLocks) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(cfg.workers);
        for n in 0..cfg.workers {
            let conn = db::open_db(workspace)?;
            let worker = Worker {
                n,
                workspace: workspace.to_path_buf(),
                conn,
                locks: locks.clone(),
                cfg: cfg.clone(),
                stop: stop.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("import-worker-{}", n))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        tracing::info!(workers = cfg.workers, workspace = %workspace.display(), "import workers started");
        Ok(WorkerPool { stop, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Worker {
    n: usize,
    workspace: PathBuf,
    conn: Connection,
    locks: CourseLocks,
    cfg: DaemonConfig,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        let mut last_purge: Option<Instant> = None;
        while !self.stop.load(Ordering::SeqCst) {
            // Only the first worker sweeps expired uploads.
            if self.n == 0 && last_purge.map_or(true, |t| t.elapsed() >= PURGE_EVERY) {
                match staging::purge_expired(&self.conn, self.cfg.staging_ttl) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(purged = n, "expired staged uploads removed"),
                    Err(e) => tracing::warn!(error = %e, "staging purge failed"),
                }
                last_purge = Some(Instant::now());
            }

            match run_next(&self.conn, &self.locks, &self.cfg) {
                Ok(Some((id, state))) => {
                    tracing::debug!(worker = self.n, task_id = %id, state = state.as_str(), "task finished");
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    worker = self.n,
                    workspace = %self.workspace.display(),
                    error = %e,
                    "worker poll failed"
                ),
            }
            self.idle();
        }
    }

    fn idle(&self) {
        let deadline = Instant::now() + self.cfg.poll_interval;
        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

const PURGE_EVERY: Duration = Duration::from_secs(60);
