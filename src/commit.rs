//! Applies a validated import batch to the live gradebook, all or nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::db;
use crate::error::ImportError;
use crate::gradebook::{self, CurrentGrade, HistoryEntry, ItemKey, Lookup};
use crate::loader::{GradeValue, ImportCode};

/// One mutex per course so commits for the same course never interleave.
#[derive(Clone, Default)]
pub struct CourseLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CourseLocks {
    pub fn lock_for(&self, course_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(course_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitOptions {
    /// Apply the feedback text carried by the batch.
    pub send_feedback: bool,
    /// Skip writing grade history rows for this import.
    pub suppress_history: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub grades_updated: usize,
    pub feedback_updated: usize,
}

struct StagedValue {
    student_id: String,
    item_id: String,
    value: GradeValue,
    feedback: Option<String>,
    row: i64,
}

/// Commit the batch named by `import_code`. The batch is consumed whether or
/// not the commit succeeds.
pub fn commit_import(
    conn: &Connection,
    locks: &CourseLocks,
    course_id: &str,
    import_code: &ImportCode,
    opts: CommitOptions,
) -> Result<CommitSummary, ImportError> {
    let lock = locks.lock_for(course_id);
    let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

    let result = apply(conn, course_id, import_code, opts);
    match &result {
        Ok(summary) => tracing::info!(
            course_id,
            %import_code,
            grades = summary.grades_updated,
            feedback = summary.feedback_updated,
            "import batch committed"
        ),
        Err(e) => tracing::warn!(course_id, %import_code, error = %e, "import batch rejected at commit"),
    }
    if let Err(e) = release(conn, import_code) {
        tracing::warn!(%import_code, error = %e, "failed to release import batch");
    }
    result
}

fn apply(
    conn: &Connection,
    course_id: &str,
    import_code: &ImportCode,
    opts: CommitOptions,
) -> Result<CommitSummary, ImportError> {
    // Take the write lock up front. A deferred transaction that reads first
    // cannot wait out another writer and fails with SQLITE_BUSY instead.
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let batch_course: Option<String> = tx
        .query_row(
            "SELECT course_id FROM import_batches WHERE import_code = ?",
            [import_code.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    match batch_course {
        None => {
            return Err(ImportError::Commit(format!(
                "import code {} not found or already committed",
                import_code
            )))
        }
        Some(c) if c != course_id => {
            return Err(ImportError::Commit(format!(
                "import code {} belongs to course {}, not {}",
                import_code, c, course_id
            )))
        }
        Some(_) => {}
    }

    let values = {
        let mut stmt = tx.prepare(
            "SELECT student_id, grade_item_id, value_kind, final_grade, feedback, row_no
             FROM import_values
             WHERE import_code = ?
             ORDER BY row_no, grade_item_id",
        )?;
        let rows = stmt
            .query_map([import_code.as_str()], |r| {
                let kind: String = r.get(2)?;
                let value: Option<f64> = r.get(3)?;
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    kind,
                    value,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut values = Vec::with_capacity(rows.len());
        for (student_id, item_id, kind, value, feedback, row) in rows {
            let Some(value) = GradeValue::from_stored(&kind, value) else {
                return Err(ImportError::Commit(format!(
                    "staged value for row {} has unknown kind {:?}",
                    row, kind
                )));
            };
            values.push(StagedValue {
                student_id,
                item_id,
                value,
                feedback,
                row,
            });
        }
        values
    };

    let now = db::now_rfc3339();
    let mut summary = CommitSummary::default();
    for v in &values {
        let item = match gradebook::resolve_grade_item(&tx, course_id, ItemKey::Id, &v.item_id)? {
            Lookup::Found(item) => item,
            _ => {
                return Err(ImportError::Commit(format!(
                    "grade item {} (row {}) no longer exists",
                    v.item_id, v.row
                )))
            }
        };
        if item.locked {
            return Err(ImportError::Commit(format!(
                "grade item {} (row {}) was locked after validation",
                item.name, v.row
            )));
        }

        let old = gradebook::current_grade(&tx, &v.item_id, &v.student_id)?;
        let old_grade = old.as_ref().and_then(|g| g.final_grade);
        let old_feedback = old.as_ref().and_then(|g| g.feedback.clone());
        let new_feedback = match (&v.feedback, opts.send_feedback) {
            (Some(f), true) => Some(f.clone()),
            _ => old_feedback.clone(),
        };
        let new_grade = match v.value {
            GradeValue::Score(s) => Some(s),
            GradeValue::Cleared => None,
            GradeValue::Unchanged => old_grade,
        };
        let grade_changed = v.value != GradeValue::Unchanged;
        let feedback_changed = new_feedback != old_feedback;
        if !grade_changed && !feedback_changed {
            continue;
        }

        gradebook::upsert_grade(
            &tx,
            &v.item_id,
            &v.student_id,
            &CurrentGrade {
                final_grade: new_grade,
                feedback: new_feedback.clone(),
            },
            &now,
        )?;
        if grade_changed {
            summary.grades_updated += 1;
        }
        if feedback_changed {
            summary.feedback_updated += 1;
        }
        if !opts.suppress_history {
            gradebook::insert_history(
                &tx,
                &HistoryEntry {
                    item_id: &v.item_id,
                    student_id: &v.student_id,
                    old_grade,
                    new_grade,
                    feedback: new_feedback.as_deref(),
                    import_code: import_code.as_str(),
                    logged_at: &now,
                },
            )?;
        }
    }

    tx.commit()?;
    Ok(summary)
}

/// Drop a batch and its values without applying them.
pub fn release(conn: &Connection, import_code: &ImportCode) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM import_values WHERE import_code = ?",
        [import_code.as_str()],
    )?;
    conn.execute(
        "DELETE FROM import_batches WHERE import_code = ?",
        [import_code.as_str()],
    )?;
    Ok(())
}
