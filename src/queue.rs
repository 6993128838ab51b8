use std::fmt;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::ImportError;
use crate::task::{ImportJob, Progress, ProgressReporter, TaskState, TASK_KIND};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub kind: String,
    pub job: ImportJob,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<String>,
    pub course_id: Option<String>,
}

/// Where scheduled imports wait for a worker.
pub trait TaskQueue {
    fn schedule(&self, job: &ImportJob) -> Result<TaskId, ImportError>;
    fn load(&self, id: &TaskId) -> Result<Option<QueuedTask>, ImportError>;
    /// Tasks not yet in a terminal state, oldest first.
    fn list_pending(&self, filter: &TaskFilter) -> Result<Vec<QueuedTask>, ImportError>;
    /// Move the oldest created task to running. At most one caller wins a given task.
    fn claim_next(&self) -> Result<Option<QueuedTask>, ImportError>;
    fn save(&self, id: &TaskId, job: &ImportJob) -> Result<(), ImportError>;
    fn set_progress(&self, id: &TaskId, progress: &Progress) -> Result<(), ImportError>;
}

pub struct SqliteTaskQueue<'c> {
    conn: &'c Connection,
}

const SELECT_TASK: &str = "SELECT id, kind, status, job_json, created_at, started_at, finished_at,
        progress_step, progress_total, progress_message
     FROM import_tasks";

impl<'c> SqliteTaskQueue<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<(TaskId, String, String, String, [Option<String>; 3], Progress)> {
        let id: String = row.get(0)?;
        let progress = Progress {
            step: row.get::<_, i64>(7)?.max(0) as u32,
            total_steps: row.get::<_, i64>(8)?.max(0) as u32,
            message: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        };
        Ok((
            TaskId(id),
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            [Some(row.get(4)?), row.get(5)?, row.get(6)?],
            progress,
        ))
    }

    fn decode(
        raw: (TaskId, String, String, String, [Option<String>; 3], Progress),
    ) -> Result<QueuedTask, ImportError> {
        let (id, kind, status, job_json, [created_at, started_at, finished_at], progress) = raw;
        let mut job: ImportJob = serde_json::from_str(&job_json)?;
        // The status and progress columns are authoritative; job_json only
        // changes on save.
        if let Some(state) = TaskState::parse(&status) {
            job.state = state;
        }
        if progress.step > 0 {
            job.progress = progress;
        }
        Ok(QueuedTask {
            id,
            kind,
            job,
            created_at: created_at.unwrap_or_default(),
            started_at,
            finished_at,
        })
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<QueuedTask>, ImportError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(Self::decode).collect()
    }
}

impl TaskQueue for SqliteTaskQueue<'_> {
    fn schedule(&self, job: &ImportJob) -> Result<TaskId, ImportError> {
        let id = TaskId::generate();
        let job_json = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT INTO import_tasks(id, kind, course_id, status, job_json, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                id.as_str(),
                TASK_KIND,
                &job.course_id,
                job.state.as_str(),
                &job_json,
                db::now_rfc3339(),
            ),
        )?;
        tracing::info!(task_id = %id, course_id = %job.course_id, "import task scheduled");
        Ok(id)
    }

    fn load(&self, id: &TaskId) -> Result<Option<QueuedTask>, ImportError> {
        let sql = format!("{} WHERE id = ?", SELECT_TASK);
        let raw = self
            .conn
            .query_row(&sql, [id.as_str()], Self::row_to_task)
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn list_pending(&self, filter: &TaskFilter) -> Result<Vec<QueuedTask>, ImportError> {
        let sql = format!(
            "{} WHERE status IN ('created', 'running')
               AND (?1 IS NULL OR kind = ?1)
               AND (?2 IS NULL OR course_id = ?2)
             ORDER BY created_at, rowid",
            SELECT_TASK
        );
        self.query(&sql, &[&filter.kind, &filter.course_id])
    }

    fn claim_next(&self) -> Result<Option<QueuedTask>, ImportError> {
        // Another worker may win the race for the oldest row; try the next one.
        for _ in 0..8 {
            let candidate: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM import_tasks WHERE status = 'created' ORDER BY created_at, rowid LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let claimed = self.conn.execute(
                "UPDATE import_tasks SET status = 'running', started_at = ? WHERE id = ? AND status = 'created'",
                (db::now_rfc3339(), &id),
            )?;
            if claimed == 1 {
                return self.load(&TaskId(id));
            }
        }
        Ok(None)
    }

    fn save(&self, id: &TaskId, job: &ImportJob) -> Result<(), ImportError> {
        let job_json = serde_json::to_string(job)?;
        let finished_at = job.state.is_terminal().then(db::now_rfc3339);
        let n = self.conn.execute(
            "UPDATE import_tasks
             SET status = ?, job_json = ?, progress_step = ?, progress_total = ?, progress_message = ?,
                 finished_at = COALESCE(finished_at, ?)
             WHERE id = ?",
            (
                job.state.as_str(),
                &job_json,
                job.progress.step as i64,
                job.progress.total_steps as i64,
                &job.progress.message,
                finished_at,
                id.as_str(),
            ),
        )?;
        if n == 0 {
            return Err(ImportError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_progress(&self, id: &TaskId, progress: &Progress) -> Result<(), ImportError> {
        self.conn.execute(
            "UPDATE import_tasks SET progress_step = ?, progress_total = ?, progress_message = ? WHERE id = ?",
            (
                progress.step as i64,
                progress.total_steps as i64,
                &progress.message,
                id.as_str(),
            ),
        )?;
        Ok(())
    }
}

/// Writes each step to the task's row so `import.status` can see it mid-run.
pub struct QueueProgress<'q> {
    queue: &'q dyn TaskQueue,
    id: TaskId,
}

impl<'q> QueueProgress<'q> {
    pub fn new(queue: &'q dyn TaskQueue, id: TaskId) -> Self {
        Self { queue, id }
    }
}

impl ProgressReporter for QueueProgress<'_> {
    fn report(&self, step: u32, total_steps: u32, message: &str) {
        let progress = Progress {
            step,
            total_steps,
            message: message.to_string(),
        };
        if let Err(e) = self.queue.set_progress(&self.id, &progress) {
            tracing::warn!(task_id = %self.id, error = %e, "failed to record progress");
        }
        tracing::debug!(task_id = %self.id, step, total_steps, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ImportOptions, ImportTask};

    fn job(course: &str) -> ImportJob {
        ImportTask::create(course, ImportOptions::default()).job().clone()
    }

    #[test]
    fn claim_moves_oldest_created_to_running_once() {
        let conn = db::open_memory().expect("db");
        let queue = SqliteTaskQueue::new(&conn);
        let first = queue.schedule(&job("c1")).expect("first");
        let second = queue.schedule(&job("c2")).expect("second");

        let claimed = queue.claim_next().expect("claim").expect("some");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.job.state, TaskState::Running);
        assert!(claimed.started_at.is_some());

        let next = queue.claim_next().expect("claim").expect("some");
        assert_eq!(next.id, second);
        assert!(queue.claim_next().expect("claim").is_none());
    }

    #[test]
    fn pending_excludes_terminal_tasks_and_honours_filter() {
        let conn = db::open_memory().expect("db");
        let queue = SqliteTaskQueue::new(&conn);
        let done = queue.schedule(&job("c1")).expect("done");
        let open = queue.schedule(&job("c1")).expect("open");
        queue.schedule(&job("c2")).expect("other");

        let mut finished = job("c1");
        finished.state = TaskState::Committed;
        queue.save(&done, &finished).expect("save");

        let filter = TaskFilter {
            kind: Some(TASK_KIND.to_string()),
            course_id: Some("c1".to_string()),
        };
        let pending = queue.list_pending(&filter).expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open);

        let all = queue.list_pending(&TaskFilter::default()).expect("all");
        assert_eq!(all.len(), 2);

        let other_kind = TaskFilter {
            kind: Some("something_else".to_string()),
            course_id: None,
        };
        assert!(queue.list_pending(&other_kind).expect("kind").is_empty());
    }

    #[test]
    fn save_records_terminal_state_and_progress() {
        let conn = db::open_memory().expect("db");
        let queue = SqliteTaskQueue::new(&conn);
        let id = queue.schedule(&job("c1")).expect("schedule");

        QueueProgress::new(&queue, id.clone()).report(2, 3, "Preparing grade data for import");
        let mid = queue.load(&id).expect("load").expect("some");
        assert_eq!(mid.job.progress.step, 2);
        assert_eq!(mid.job.progress.message, "Preparing grade data for import");

        let mut failed = mid.job.clone();
        failed.state = TaskState::Failed;
        failed.errors = vec!["row 2 [Quiz]: bad".to_string(), "Import failed".to_string()];
        queue.save(&id, &failed).expect("save");

        let loaded = queue.load(&id).expect("load").expect("some");
        assert_eq!(loaded.job.state, TaskState::Failed);
        assert_eq!(loaded.job.errors.len(), 2);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn saving_unknown_task_is_not_found() {
        let conn = db::open_memory().expect("db");
        let queue = SqliteTaskQueue::new(&conn);
        let err = queue
            .save(&TaskId::from("missing".to_string()), &job("c1"))
            .unwrap_err();
        assert!(matches!(err, ImportError::TaskNotFound(_)));
    }
}
