//! The asynchronous unit of work: read the staged upload, validate it, and
//! commit it or report why not.

use std::path::PathBuf;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::commit::{self, CommitOptions, CommitSummary, CourseLocks};
use crate::error::{ImportError, LoadError};
use crate::loader::{ColumnMapping, ErrorList, GradeLoader, ImportCode, LoadContext, LoadOutcome};
use crate::queue::{TaskFilter, TaskId, TaskQueue};
use crate::staging::{self, StagedImport, StagingHandle};

pub const TASK_KIND: &str = "import_grades";
pub const TOTAL_STEPS: u32 = 3;
pub const IMPORT_FAILED: &str = "Import failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Running,
    Committed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Committed => "committed",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TaskState::Created),
            "running" => Some(TaskState::Running),
            "committed" => Some(TaskState::Committed),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Committed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub separate_groups: bool,
    pub current_group: Option<String>,
    pub verbose_scales: bool,
    pub send_feedback: bool,
    pub suppress_history: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            separate_groups: false,
            current_group: None,
            verbose_scales: true,
            send_feedback: true,
            suppress_history: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ImportSource {
    Csv {
        staging: StagingHandle,
        #[serde(default)]
        mapping: ColumnMapping,
    },
    Xml {
        staging: StagingHandle,
    },
    XmlFile {
        path: PathBuf,
    },
}

impl ImportSource {
    fn staging(&self) -> Option<&StagingHandle> {
        match self {
            ImportSource::Csv { staging, .. } | ImportSource::Xml { staging } => Some(staging),
            ImportSource::XmlFile { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub step: u32,
    pub total_steps: u32,
    pub message: String,
}

/// Persisted state of one import task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub course_id: String,
    pub source: Option<ImportSource>,
    #[serde(default)]
    pub options: ImportOptions,
    pub state: TaskState,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Structured form of the validation failures in `errors`.
    #[serde(default)]
    pub row_errors: Vec<LoadError>,
    #[serde(default)]
    pub grades_updated: Option<usize>,
}

/// Receives step updates as execution advances.
pub trait ProgressReporter {
    fn report(&self, step: u32, total_steps: u32, message: &str);
}

/// Free-text status lines for operators.
pub trait TaskLogger {
    fn log_start(&self, message: &str);
    fn log_line(&self, message: &str);
}

pub struct TracingTaskLogger {
    task_id: String,
    course_id: String,
}

impl TracingTaskLogger {
    pub fn new(task_id: &str, course_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            course_id: course_id.to_string(),
        }
    }
}

impl TaskLogger for TracingTaskLogger {
    fn log_start(&self, message: &str) {
        tracing::info!(task_id = %self.task_id, course_id = %self.course_id, "{}", message);
    }

    fn log_line(&self, message: &str) {
        tracing::info!(task_id = %self.task_id, course_id = %self.course_id, "  {}", message);
    }
}

/// Collaborators handed to `execute`.
pub struct TaskEnv<'a> {
    pub conn: &'a Connection,
    pub locks: &'a CourseLocks,
    pub progress: &'a dyn ProgressReporter,
    pub logger: &'a dyn TaskLogger,
    pub strict_mapping: bool,
}

enum Failure {
    Rejected(ErrorList),
    Fatal(ImportError),
}

impl From<ImportError> for Failure {
    fn from(e: ImportError) -> Self {
        Failure::Fatal(e)
    }
}

#[derive(Debug, Clone)]
pub struct ImportTask {
    id: Option<TaskId>,
    job: ImportJob,
    /// Validated batch written by `run` and not yet handed to the commit gate.
    pending_batch: Option<ImportCode>,
}

impl ImportTask {
    /// A task for `course_id` with no source bound yet.
    pub fn create(course_id: &str, options: ImportOptions) -> Self {
        ImportTask {
            id: None,
            job: ImportJob {
                course_id: course_id.to_string(),
                source: None,
                options,
                state: TaskState::Created,
                progress: Progress::default(),
                errors: Vec::new(),
                row_errors: Vec::new(),
                grades_updated: None,
            },
            pending_batch: None,
        }
    }

    pub fn with_csv(mut self, staging: StagingHandle, mapping: ColumnMapping) -> Self {
        self.job.source = Some(ImportSource::Csv { staging, mapping });
        self
    }

    pub fn with_xml_staged(mut self, staging: StagingHandle) -> Self {
        self.job.source = Some(ImportSource::Xml { staging });
        self
    }

    pub fn with_xml_file(mut self, path: PathBuf) -> Self {
        self.job.source = Some(ImportSource::XmlFile { path });
        self
    }

    pub fn from_parts(id: TaskId, job: ImportJob) -> Self {
        ImportTask {
            id: Some(id),
            job,
            pending_batch: None,
        }
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    pub fn job(&self) -> &ImportJob {
        &self.job
    }

    pub fn state(&self) -> TaskState {
        self.job.state
    }

    /// Persist the task in `queue` and remember the id it was given.
    pub fn schedule(&mut self, queue: &dyn TaskQueue) -> Result<TaskId, ImportError> {
        let id = queue.schedule(&self.job)?;
        self.id = Some(id.clone());
        Ok(id)
    }

    pub fn load(queue: &dyn TaskQueue, id: &TaskId) -> Result<Self, ImportError> {
        match queue.load(id)? {
            Some(queued) => Ok(ImportTask::from_parts(queued.id, queued.job)),
            None => Err(ImportError::TaskNotFound(id.to_string())),
        }
    }

    /// The first pending or running import for `course_id`, if any.
    pub fn find_by_course(
        queue: &dyn TaskQueue,
        course_id: &str,
    ) -> Result<Option<TaskId>, ImportError> {
        let filter = TaskFilter {
            kind: Some(TASK_KIND.to_string()),
            course_id: Some(course_id.to_string()),
        };
        Ok(queue.list_pending(&filter)?.into_iter().next().map(|t| t.id))
    }

    /// Run to a terminal state. A task that already finished is left alone.
    pub fn execute(&mut self, env: &TaskEnv<'_>) -> TaskState {
        if self.job.state.is_terminal() {
            return self.job.state;
        }
        self.job.state = TaskState::Running;
        let course_id = self.job.course_id.clone();
        let start = format!("Importing grades for course ID {}", course_id);
        env.logger.log_start(&start);
        self.report(env, 1, &start);

        match self.run(env) {
            Ok(summary) => {
                self.job.grades_updated = Some(summary.grades_updated);
                self.job.state = TaskState::Committed;
                env.logger.log_line(&format!(
                    "{} grades and {} feedback entries updated",
                    summary.grades_updated, summary.feedback_updated
                ));
            }
            Err(failure) => {
                let mut errors: Vec<String> = match &failure {
                    Failure::Rejected(list) => list.iter().map(|e| e.to_string()).collect(),
                    Failure::Fatal(e) => vec![e.to_string()],
                };
                if let Failure::Rejected(list) = failure {
                    self.job.row_errors = list;
                }
                errors.push(IMPORT_FAILED.to_string());
                for e in &errors {
                    env.logger.log_line(e);
                }
                tracing::warn!(
                    task_id = %self.id_str(),
                    course_id = %course_id,
                    errors = ?errors,
                    "grade import failed"
                );
                self.job.errors = errors;
                self.job.state = TaskState::Failed;
            }
        }

        if let Some(handle) = self.job.source.as_ref().and_then(|s| s.staging()) {
            if let Err(e) = staging::consume(env.conn, handle) {
                tracing::warn!(handle = %handle, error = %e, "failed to drop staged upload");
            }
        }
        env.logger.log_start("Import complete");
        self.job.state
    }

    fn run(&mut self, env: &TaskEnv<'_>) -> Result<CommitSummary, Failure> {
        let (staged, mapping) = match &self.job.source {
            Some(ImportSource::Csv { staging, mapping }) => (
                StagedImport::open(env.conn, staging, &self.job.course_id)?,
                mapping.clone(),
            ),
            Some(ImportSource::Xml { staging }) => (
                StagedImport::open(env.conn, staging, &self.job.course_id)?,
                ColumnMapping::xml(),
            ),
            Some(ImportSource::XmlFile { path }) => {
                (StagedImport::from_xml_file(path)?, ColumnMapping::xml())
            }
            None => {
                return Err(Failure::Fatal(ImportError::StagingNotFound {
                    handle: "<unbound>".to_string(),
                }))
            }
        };

        env.logger.log_line(&format!(
            "{} rows read from {} upload",
            staged.row_count(),
            staged.format().as_str()
        ));
        self.report(env, 2, "Preparing grade data for import");
        let ctx = LoadContext {
            course_id: self.job.course_id.clone(),
            separate_groups: self.job.options.separate_groups,
            current_group: self.job.options.current_group.clone(),
            verbose_scales: self.job.options.verbose_scales,
            strict_mapping: env.strict_mapping,
        };
        let import_code = match GradeLoader::new(env.conn, &ctx).prepare(&staged, &mapping)? {
            LoadOutcome::Staged { import_code, rows } => {
                env.logger
                    .log_line(&format!("{} grade values validated", rows.len()));
                import_code
            }
            LoadOutcome::Rejected { errors } => return Err(Failure::Rejected(errors)),
        };

        self.pending_batch = Some(import_code.clone());
        self.report(env, 3, "Committing data to the gradebook");
        let result = commit::commit_import(
            env.conn,
            env.locks,
            &self.job.course_id,
            &import_code,
            CommitOptions {
                send_feedback: self.job.options.send_feedback,
                suppress_history: self.job.options.suppress_history,
            },
        );
        // The gate releases the batch on every path.
        self.pending_batch = None;
        result.map_err(Failure::Fatal)
    }

    fn report(&mut self, env: &TaskEnv<'_>, step: u32, message: &str) {
        self.job.progress = Progress {
            step,
            total_steps: TOTAL_STEPS,
            message: message.to_string(),
        };
        env.progress.report(step, TOTAL_STEPS, message);
    }

    fn id_str(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    /// Drive the task to `Failed` after something outside the normal error
    /// paths went wrong (for example a panic in a collaborator).
    pub fn fail_internal(&mut self, message: &str) {
        if self.job.state.is_terminal() {
            return;
        }
        self.job.errors = vec![message.to_string(), IMPORT_FAILED.to_string()];
        self.job.state = TaskState::Failed;
    }

    /// Fail a task whose `execute` never returned and drop whatever it left
    /// behind: the staged upload and any validated batch.
    pub fn abandon(&mut self, conn: &Connection, message: &str) {
        self.fail_internal(message);
        if let Some(handle) = self.job.source.as_ref().and_then(|s| s.staging()) {
            if let Err(e) = staging::consume(conn, handle) {
                tracing::warn!(handle = %handle, error = %e, "failed to drop staged upload");
            }
        }
        if let Some(code) = self.pending_batch.take() {
            if let Err(e) = commit::release(conn, &code) {
                tracing::warn!(import_code = %code, error = %e, "failed to release import batch");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct RecordingProgress {
        pub steps: RefCell<Vec<(u32, u32, String)>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn report(&self, step: u32, total_steps: u32, message: &str) {
            self.steps
                .borrow_mut()
                .push((step, total_steps, message.to_string()));
        }
    }

    #[derive(Default)]
    pub struct RecordingLogger {
        pub lines: RefCell<Vec<String>>,
    }

    impl TaskLogger for RecordingLogger {
        fn log_start(&self, message: &str) {
            self.lines.borrow_mut().push(message.to_string());
        }

        fn log_line(&self, message: &str) {
            self.lines.borrow_mut().push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingLogger, RecordingProgress};
    use super::*;
    use crate::db;
    use crate::gradebook::fixtures::seed_course;
    use crate::queue::SqliteTaskQueue;
    use rusqlite::OptionalExtension;

    struct Run {
        state: TaskState,
        task: ImportTask,
        steps: Vec<u32>,
        lines: Vec<String>,
    }

    fn run(conn: &Connection, mut task: ImportTask) -> Run {
        let progress = RecordingProgress::default();
        let logger = RecordingLogger::default();
        let locks = CourseLocks::default();
        let env = TaskEnv {
            conn,
            locks: &locks,
            progress: &progress,
            logger: &logger,
            strict_mapping: false,
        };
        let state = task.execute(&env);
        let steps = progress.steps.borrow().iter().map(|s| s.0).collect();
        let lines = logger.lines.borrow().clone();
        Run {
            state,
            task,
            steps,
            lines,
        }
    }

    fn csv_task(conn: &Connection, csv: &str) -> ImportTask {
        let handle = staging::stage_csv(conn, "c1", csv, b',').expect("stage");
        ImportTask::create("c1", ImportOptions::default()).with_csv(handle, ColumnMapping::default())
    }

    fn math_grade(conn: &Connection, student: &str) -> Option<f64> {
        conn.query_row(
            "SELECT final_grade FROM grades WHERE grade_item_id = 'i-math' AND student_id = ?",
            [student],
            |r| r.get(0),
        )
        .optional()
        .expect("grade")
        .flatten()
    }

    fn grade_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM grades", [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn valid_csv_commits_every_row() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let out = run(&conn, csv_task(&conn, "student_id,MathQuiz\n101,85\n102,91\n103,77\n"));
        assert_eq!(out.state, TaskState::Committed);
        assert_eq!(out.steps, vec![1, 2, 3]);
        assert_eq!(grade_count(&conn), 3);
        assert_eq!(math_grade(&conn, "101"), Some(85.0));
        assert_eq!(out.task.job().grades_updated, Some(3));
        assert!(out.task.job().errors.is_empty());
        assert_eq!(out.lines.first().map(String::as_str), Some("Importing grades for course ID c1"));
        assert_eq!(out.lines.last().map(String::as_str), Some("Import complete"));
    }

    #[test]
    fn one_bad_row_fails_without_touching_the_gradebook() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let out = run(&conn, csv_task(&conn, "student_id,MathQuiz\n101,85\n102,X\n"));
        assert_eq!(out.state, TaskState::Failed);
        assert_eq!(out.steps, vec![1, 2]);
        assert_eq!(grade_count(&conn), 0);
        let errors = &out.task.job().errors;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("row 3 [MathQuiz]"));
        assert_eq!(errors[1], IMPORT_FAILED);
        assert_eq!(out.task.job().row_errors.len(), 1);
        assert_eq!(out.task.job().row_errors[0].row, Some(3));
        assert_eq!(out.task.job().row_errors[0].kind, crate::error::LoadErrorKind::ScaleFormat);
        assert_eq!(out.lines.last().map(String::as_str), Some("Import complete"));
    }

    #[test]
    fn missing_staging_aborts_before_validation() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let task = ImportTask::create("c1", ImportOptions::default())
            .with_csv(StagingHandle::from("gone".to_string()), ColumnMapping::default());
        let out = run(&conn, task);
        assert_eq!(out.state, TaskState::Failed);
        assert_eq!(out.steps, vec![1]);
        assert!(out.task.job().errors[0].contains("staged import not found"));
    }

    #[test]
    fn malformed_xml_aborts_with_parse_error() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let handle = staging::stage_xml(&conn, "c1", "<results><result>").expect("stage");
        let task = ImportTask::create("c1", ImportOptions::default()).with_xml_staged(handle);
        let out = run(&conn, task);
        assert_eq!(out.state, TaskState::Failed);
        assert_eq!(out.steps, vec![1]);
        assert!(out.task.job().errors[0].starts_with("parse error"));
    }

    struct PanicAtCommit;

    impl ProgressReporter for PanicAtCommit {
        fn report(&self, step: u32, _total_steps: u32, _message: &str) {
            if step == 3 {
                panic!("progress sink went away");
            }
        }
    }

    fn rows_in(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .expect("count")
    }

    #[test]
    fn abandoned_task_drops_staging_and_pending_batch() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let mut task = csv_task(&conn, "student_id,MathQuiz\n101,85\n");
        let logger = RecordingLogger::default();
        let locks = CourseLocks::default();
        let env = TaskEnv {
            conn: &conn,
            locks: &locks,
            progress: &PanicAtCommit,
            logger: &logger,
            strict_mapping: false,
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.execute(&env)));
        assert!(outcome.is_err());
        assert_eq!(rows_in(&conn, "staged_imports"), 1);
        assert_eq!(rows_in(&conn, "import_batches"), 1);

        task.abandon(&conn, "internal error while importing");
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.job().errors,
            vec!["internal error while importing".to_string(), IMPORT_FAILED.to_string()]
        );
        assert_eq!(rows_in(&conn, "staged_imports"), 0);
        assert_eq!(rows_in(&conn, "import_batches"), 0);
        assert_eq!(rows_in(&conn, "import_values"), 0);
        assert_eq!(grade_count(&conn), 0);
    }

    #[test]
    fn staging_is_consumed_exactly_once() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let task = csv_task(&conn, "student_id,MathQuiz\n101,85\n");
        let replay = task.clone();
        assert_eq!(run(&conn, task).state, TaskState::Committed);

        let again = run(&conn, replay);
        assert_eq!(again.state, TaskState::Failed);
        assert!(again.task.job().errors[0].contains("staged import not found"));
        assert_eq!(grade_count(&conn), 1);
    }

    #[test]
    fn xml_file_source_is_read_from_disk() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let dir = std::env::temp_dir().join(format!("gradeimportd-task-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("grades.xml");
        std::fs::write(
            &path,
            "<results><result><assignment>MQ1</assignment><student>S-103</student><score>64</score></result></results>",
        )
        .expect("write");
        let task = ImportTask::create("c1", ImportOptions::default()).with_xml_file(path);
        let out = run(&conn, task);
        assert_eq!(out.state, TaskState::Committed);
        assert_eq!(math_grade(&conn, "103"), Some(64.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn terminal_tasks_do_not_run_again() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let mut task = csv_task(&conn, "student_id,MathQuiz\n101,85\n");
        task.fail_internal("worker crashed");
        let out = run(&conn, task);
        assert_eq!(out.state, TaskState::Failed);
        assert!(out.steps.is_empty());
        assert_eq!(grade_count(&conn), 0);
    }

    #[test]
    fn load_and_find_by_course_go_through_the_queue() {
        let conn = db::open_memory().expect("db");
        seed_course(&conn);
        let queue = SqliteTaskQueue::new(&conn);
        assert_eq!(ImportTask::find_by_course(&queue, "c1").expect("find"), None);

        let mut other = ImportTask::create("c2", ImportOptions::default());
        other.schedule(&queue).expect("schedule other");
        let mut mine = csv_task(&conn, "student_id,MathQuiz\n101,85\n");
        let id = mine.schedule(&queue).expect("schedule");
        let mut another = ImportTask::create("c3", ImportOptions::default());
        another.schedule(&queue).expect("schedule another");

        assert_eq!(ImportTask::find_by_course(&queue, "c1").expect("find"), Some(id.clone()));
        let loaded = ImportTask::load(&queue, &id).expect("load");
        assert_eq!(loaded.job().course_id, "c1");
        assert_eq!(loaded.state(), TaskState::Created);

        let missing = ImportTask::load(&queue, &TaskId::from("nope".to_string())).unwrap_err();
        assert!(matches!(missing, ImportError::TaskNotFound(_)));
    }
}
