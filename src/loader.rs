//! Turns staged rows into validated grade rows and writes complete batches
//! into the import staging tables under a fresh import code.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;
use crate::error::{ImportError, LoadError, LoadErrorKind};
use crate::gradebook::{self, GradeType, ItemKey, ItemRef, Lookup, StudentKey};
use crate::staging::{StagedImport, StagedRow};

pub type ErrorList = Vec<LoadError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportCode(String);

impl ImportCode {
    fn generate() -> Self {
        ImportCode(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ImportCode {
    fn from(s: String) -> Self {
        ImportCode(s)
    }
}

impl fmt::Display for ImportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a source column feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ColumnTarget {
    Ignore,
    Student { key: StudentKey },
    /// Wide layout: the column holds grades for one item.
    Grade { item: String, by: ItemKey },
    Feedback { item: String, by: ItemKey },
    /// Long layout: the cell names the item the rest of the row is for.
    RowItem { by: ItemKey },
    RowScore,
    RowFeedback,
}

impl ColumnTarget {
    /// Short textual form used by submitters: `ignore`, `student:<key>`,
    /// `item:<name>`, `item_id:<id>`, `item_idnumber:<idnumber>`,
    /// `feedback:<name>`.
    pub fn parse_spec(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("ignore") || spec == "0" {
            return Some(ColumnTarget::Ignore);
        }
        let (kind, rest) = spec.split_once(':')?;
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        match kind.trim().to_ascii_lowercase().as_str() {
            "student" => StudentKey::parse(rest).map(|key| ColumnTarget::Student { key }),
            "item" => Some(ColumnTarget::Grade {
                item: rest.to_string(),
                by: ItemKey::Name,
            }),
            "item_id" => Some(ColumnTarget::Grade {
                item: rest.to_string(),
                by: ItemKey::Id,
            }),
            "item_idnumber" => Some(ColumnTarget::Grade {
                item: rest.to_string(),
                by: ItemKey::IdNumber,
            }),
            "feedback" => Some(ColumnTarget::Feedback {
                item: rest.to_string(),
                by: ItemKey::Name,
            }),
            "feedback_id" => Some(ColumnTarget::Feedback {
                item: rest.to_string(),
                by: ItemKey::Id,
            }),
            _ => None,
        }
    }
}

/// Submitter-chosen header mapping. Headers without an entry are inferred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnTarget>,
}

impl ColumnMapping {
    pub fn set(&mut self, header: impl Into<String>, target: ColumnTarget) -> &mut Self {
        self.columns.insert(header.into(), target);
        self
    }

    /// The fixed layout of normalized XML uploads.
    pub fn xml() -> Self {
        let mut m = ColumnMapping::default();
        m.set("assignment", ColumnTarget::RowItem { by: ItemKey::IdNumber })
            .set(
                "student",
                ColumnTarget::Student {
                    key: StudentKey::IdNumber,
                },
            )
            .set("score", ColumnTarget::RowScore)
            .set("feedback", ColumnTarget::RowFeedback);
        m
    }
}

/// Request-scoped inputs, passed explicitly rather than read from ambient state.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub course_id: String,
    pub separate_groups: bool,
    pub current_group: Option<String>,
    pub verbose_scales: bool,
    pub strict_mapping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradeValue {
    Score(f64),
    Cleared,
    /// Feedback-only change; the grade itself is kept.
    Unchanged,
}

impl GradeValue {
    pub fn kind(self) -> &'static str {
        match self {
            GradeValue::Score(_) => "score",
            GradeValue::Cleared => "cleared",
            GradeValue::Unchanged => "unchanged",
        }
    }

    pub fn from_stored(kind: &str, value: Option<f64>) -> Option<Self> {
        match (kind, value) {
            ("score", Some(v)) => Some(GradeValue::Score(v)),
            ("cleared", _) => Some(GradeValue::Cleared),
            ("unchanged", _) => Some(GradeValue::Unchanged),
            _ => None,
        }
    }

    fn stored_value(self) -> Option<f64> {
        match self {
            GradeValue::Score(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub student_id: String,
    pub item_id: String,
    pub value: GradeValue,
    pub feedback: Option<String>,
    pub row: usize,
}

#[derive(Debug)]
pub enum LoadOutcome {
    Staged {
        import_code: ImportCode,
        rows: Vec<GradeRow>,
    },
    Rejected {
        errors: ErrorList,
    },
}

#[derive(Debug, Clone)]
enum Column {
    Ignore,
    Student,
    Grade(ItemRef),
    Feedback(ItemRef),
    RowItem(ItemKey),
    RowScore,
    RowFeedback,
}

struct Plan {
    student: Option<(usize, StudentKey)>,
    columns: Vec<Column>,
}

impl Plan {
    /// Header of the column a value for `item_id` was read from.
    fn field_for<'h>(&self, headers: &'h [String], item_id: &'h str) -> &'h str {
        let grade = self
            .columns
            .iter()
            .position(|c| matches!(c, Column::Grade(item) | Column::Feedback(item) if item.id == item_id));
        let row_item = || self.columns.iter().position(|c| matches!(c, Column::RowItem(_)));
        match grade.or_else(row_item) {
            Some(idx) => &headers[idx],
            None => item_id,
        }
    }
}

pub struct GradeLoader<'c> {
    conn: &'c Connection,
    ctx: &'c LoadContext,
}

impl<'c> GradeLoader<'c> {
    pub fn new(conn: &'c Connection, ctx: &'c LoadContext) -> Self {
        Self { conn, ctx }
    }

    /// Validate every row of `staged`. Only a fully valid, non-empty set of
    /// rows is written to the staging tables; `Err` is reserved for storage
    /// failures.
    pub fn prepare(
        &self,
        staged: &StagedImport,
        mapping: &ColumnMapping,
    ) -> Result<LoadOutcome, ImportError> {
        let mut errors = ErrorList::new();

        if !gradebook::course_exists(self.conn, &self.ctx.course_id)? {
            errors.push(LoadError::header(
                "course",
                format!("course {} does not exist", self.ctx.course_id),
            ));
            return Ok(LoadOutcome::Rejected { errors });
        }
        let group = self.visible_group(&mut errors)?;

        let plan = self.resolve_headers(staged.headers(), mapping, &mut errors)?;
        let Some((student_idx, student_key)) = plan.student else {
            return Ok(LoadOutcome::Rejected { errors });
        };

        // First pass: resolve each distinct student once.
        let mut students: HashMap<String, Result<String, (LoadErrorKind, String)>> = HashMap::new();
        for row in staged.rows() {
            let raw = row.cell(student_idx).trim();
            if raw.is_empty() || students.contains_key(raw) {
                continue;
            }
            let resolved = self.resolve_student(student_key, raw, group.as_deref())?;
            students.insert(raw.to_string(), resolved);
        }

        // Second pass: read values.
        let mut rows: Vec<GradeRow> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let student_header = staged.headers()[student_idx].clone();
        for row in staged.rows() {
            let raw = row.cell(student_idx).trim();
            if raw.is_empty() {
                errors.push(LoadError::at(
                    row.line,
                    &student_header,
                    LoadErrorKind::Resolution,
                    "missing student identifier",
                ));
                continue;
            }
            let student_id = match students.get(raw) {
                Some(Ok(id)) => id.clone(),
                Some(Err((kind, reason))) => {
                    errors.push(LoadError::at(row.line, &student_header, *kind, reason.clone()));
                    continue;
                }
                None => continue,
            };

            let mut cells = RowCells::new(row, student_id);
            self.read_row(staged.headers(), &plan, row, &mut cells, &mut errors)?;
            for entry in cells.entries {
                let key = (entry.student_id.clone(), entry.item_id.clone());
                match index.get(&key) {
                    Some(&at) => errors.push(LoadError::at(
                        row.line,
                        plan.field_for(staged.headers(), &entry.item_id),
                        LoadErrorKind::Resolution,
                        format!(
                            "duplicate grade for student {} (first given on row {})",
                            raw, rows[at].row
                        ),
                    )),
                    None => {
                        index.insert(key, rows.len());
                        rows.push(entry);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Ok(LoadOutcome::Rejected { errors });
        }
        if rows.is_empty() {
            errors.push(LoadError::header("file", "no grade data found"));
            return Ok(LoadOutcome::Rejected { errors });
        }

        let import_code = self.write_batch(&rows)?;
        Ok(LoadOutcome::Staged { import_code, rows })
    }

    fn visible_group(&self, errors: &mut ErrorList) -> Result<Option<String>, ImportError> {
        if !self.ctx.separate_groups {
            return Ok(None);
        }
        let Some(group) = self.ctx.current_group.as_deref() else {
            return Ok(None);
        };
        if !gradebook::group_in_course(self.conn, &self.ctx.course_id, group)? {
            errors.push(LoadError {
                row: None,
                field: "group".to_string(),
                kind: LoadErrorKind::Group,
                reason: format!("group {} does not belong to this course", group),
            });
        }
        Ok(Some(group.to_string()))
    }

    fn resolve_headers(
        &self,
        headers: &[String],
        mapping: &ColumnMapping,
        errors: &mut ErrorList,
    ) -> Result<Plan, ImportError> {
        let mut plan = Plan {
            student: None,
            columns: Vec::with_capacity(headers.len()),
        };
        let mut grade_columns: HashMap<String, String> = HashMap::new();
        let explicit_student = mapping
            .columns
            .values()
            .any(|t| matches!(t, ColumnTarget::Student { .. }));

        for (idx, header) in headers.iter().enumerate() {
            let explicit = mapping.columns.get(header).cloned();
            let target = match explicit {
                Some(t) => Some(t),
                None => self.infer_target(header, explicit_student || plan.student.is_some())?,
            };
            let column = match target {
                None => {
                    if self.ctx.strict_mapping && !header.is_empty() {
                        errors.push(LoadError::header(
                            header,
                            "column does not match a student field or grade item",
                        ));
                    } else {
                        tracing::debug!(header = %header, "ignoring unmapped column");
                    }
                    Column::Ignore
                }
                Some(ColumnTarget::Ignore) => Column::Ignore,
                Some(ColumnTarget::Student { key }) => {
                    if let Some((prev, _)) = plan.student {
                        errors.push(LoadError::header(
                            header,
                            format!(
                                "student identifier already mapped from column {:?}",
                                headers[prev]
                            ),
                        ));
                        Column::Ignore
                    } else {
                        plan.student = Some((idx, key));
                        Column::Student
                    }
                }
                Some(ColumnTarget::Grade { item, by }) => {
                    match self.mapped_item(header, &item, by, errors)? {
                        Some(item) => {
                            if let Some(prev) = grade_columns.insert(item.id.clone(), header.clone())
                            {
                                errors.push(LoadError::header(
                                    header,
                                    format!(
                                        "grade item {} is already mapped from column {:?}",
                                        item.name, prev
                                    ),
                                ));
                                Column::Ignore
                            } else {
                                Column::Grade(item)
                            }
                        }
                        None => Column::Ignore,
                    }
                }
                Some(ColumnTarget::Feedback { item, by }) => {
                    match self.mapped_item(header, &item, by, errors)? {
                        Some(item) => Column::Feedback(item),
                        None => Column::Ignore,
                    }
                }
                Some(ColumnTarget::RowItem { by }) => Column::RowItem(by),
                Some(ColumnTarget::RowScore) => Column::RowScore,
                Some(ColumnTarget::RowFeedback) => Column::RowFeedback,
            };
            plan.columns.push(column);
        }

        if plan.student.is_none() {
            errors.push(LoadError::header(
                "student",
                "no column identifies the student",
            ));
        }
        let row_items = plan
            .columns
            .iter()
            .filter(|c| matches!(c, Column::RowItem(_)))
            .count();
        let row_values = plan
            .columns
            .iter()
            .any(|c| matches!(c, Column::RowScore | Column::RowFeedback));
        if row_items > 1 {
            errors.push(LoadError::header(
                "assignment",
                "more than one column names the grade item",
            ));
        }
        if row_values && row_items == 0 {
            errors.push(LoadError::header(
                "assignment",
                "score or feedback columns need a column naming the grade item",
            ));
        }
        Ok(plan)
    }

    fn infer_target(
        &self,
        header: &str,
        have_student: bool,
    ) -> Result<Option<ColumnTarget>, ImportError> {
        let header = header.trim();
        if header.is_empty() {
            return Ok(None);
        }
        if !have_student {
            if let Some(key) = StudentKey::parse(header) {
                return Ok(Some(ColumnTarget::Student { key }));
            }
        }
        if let Some(item) = header.strip_prefix("feedback:") {
            return Ok(Some(ColumnTarget::Feedback {
                item: item.trim().to_string(),
                by: ItemKey::Name,
            }));
        }
        for by in [ItemKey::Name, ItemKey::IdNumber] {
            if let Lookup::Found(_) =
                gradebook::resolve_grade_item(self.conn, &self.ctx.course_id, by, header)?
            {
                return Ok(Some(ColumnTarget::Grade {
                    item: header.to_string(),
                    by,
                }));
            }
        }
        Ok(None)
    }

    fn mapped_item(
        &self,
        header: &str,
        item: &str,
        by: ItemKey,
        errors: &mut ErrorList,
    ) -> Result<Option<ItemRef>, ImportError> {
        match gradebook::resolve_grade_item(self.conn, &self.ctx.course_id, by, item)? {
            Lookup::Found(found) if found.locked => {
                errors.push(LoadError {
                    row: None,
                    field: header.to_string(),
                    kind: LoadErrorKind::Locked,
                    reason: format!("grade item {} is locked", found.name),
                });
                Ok(None)
            }
            Lookup::Found(found) => Ok(Some(found)),
            Lookup::NotFound => {
                errors.push(LoadError::header(
                    header,
                    format!("grade item {:?} does not exist in this course", item),
                ));
                Ok(None)
            }
            Lookup::Ambiguous(n) => {
                errors.push(LoadError::header(
                    header,
                    format!("grade item {:?} matches {} items", item, n),
                ));
                Ok(None)
            }
        }
    }

    fn resolve_student(
        &self,
        key: StudentKey,
        raw: &str,
        group: Option<&str>,
    ) -> Result<Result<String, (LoadErrorKind, String)>, ImportError> {
        let student = match gradebook::resolve_student(self.conn, &self.ctx.course_id, key, raw)? {
            Lookup::Found(s) => s,
            Lookup::NotFound => {
                return Ok(Err((
                    LoadErrorKind::Resolution,
                    format!("no enrolled student with {:?} = {:?}", key, raw),
                )))
            }
            Lookup::Ambiguous(n) => {
                return Ok(Err((
                    LoadErrorKind::Resolution,
                    format!("{:?} matches {} enrolled students", raw, n),
                )))
            }
        };
        if let Some(group) = group {
            if !gradebook::is_group_member(self.conn, group, &student.id)? {
                return Ok(Err((
                    LoadErrorKind::Group,
                    format!(
                        "student {} ({}) is not a member of the current group",
                        raw, student.display_name
                    ),
                )));
            }
        }
        Ok(Ok(student.id))
    }

    fn read_row(
        &self,
        headers: &[String],
        plan: &Plan,
        row: &StagedRow,
        cells: &mut RowCells,
        errors: &mut ErrorList,
    ) -> Result<(), ImportError> {
        let mut row_item: Option<(usize, ItemKey)> = None;
        let mut row_score: Option<usize> = None;
        let mut row_feedback: Option<usize> = None;

        for (idx, column) in plan.columns.iter().enumerate() {
            let cell = row.cell(idx).trim();
            match column {
                Column::Ignore | Column::Student => {}
                Column::Grade(item) => {
                    match parse_value(cell, item, self.ctx.verbose_scales) {
                        Ok(Some(value)) => cells.set_value(item, value),
                        Ok(None) => {}
                        Err(reason) => errors.push(LoadError::at(
                            row.line,
                            &headers[idx],
                            LoadErrorKind::ScaleFormat,
                            reason,
                        )),
                    }
                }
                Column::Feedback(item) => {
                    if !cell.is_empty() {
                        cells.set_feedback(item, cell);
                    }
                }
                Column::RowItem(by) => row_item = Some((idx, *by)),
                Column::RowScore => row_score = Some(idx),
                Column::RowFeedback => row_feedback = Some(idx),
            }
        }

        let Some((item_idx, by)) = row_item else {
            return Ok(());
        };
        let reference = row.cell(item_idx).trim();
        let field = &headers[item_idx];
        if reference.is_empty() {
            errors.push(LoadError::at(
                row.line,
                field,
                LoadErrorKind::Resolution,
                "missing grade item reference",
            ));
            return Ok(());
        }
        let item = match gradebook::resolve_grade_item(self.conn, &self.ctx.course_id, by, reference)? {
            Lookup::Found(item) => item,
            Lookup::NotFound => {
                errors.push(LoadError::at(
                    row.line,
                    field,
                    LoadErrorKind::Resolution,
                    format!("grade item {:?} does not exist in this course", reference),
                ));
                return Ok(());
            }
            Lookup::Ambiguous(n) => {
                errors.push(LoadError::at(
                    row.line,
                    field,
                    LoadErrorKind::Resolution,
                    format!("grade item {:?} matches {} items", reference, n),
                ));
                return Ok(());
            }
        };
        if item.locked {
            errors.push(LoadError::at(
                row.line,
                field,
                LoadErrorKind::Locked,
                format!("grade item {} is locked", item.name),
            ));
            return Ok(());
        }
        if let Some(idx) = row_score {
            match parse_value(row.cell(idx).trim(), &item, self.ctx.verbose_scales) {
                Ok(Some(value)) => cells.set_value(&item, value),
                Ok(None) => {}
                Err(reason) => errors.push(LoadError::at(
                    row.line,
                    &headers[idx],
                    LoadErrorKind::ScaleFormat,
                    reason,
                )),
            }
        }
        if let Some(idx) = row_feedback {
            let feedback = row.cell(idx).trim();
            if !feedback.is_empty() {
                cells.set_feedback(&item, feedback);
            }
        }
        Ok(())
    }

    fn write_batch(&self, rows: &[GradeRow]) -> Result<ImportCode, ImportError> {
        let import_code = ImportCode::generate();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO import_batches(import_code, course_id, row_count, created_at)
             VALUES(?, ?, ?, ?)",
            (
                import_code.as_str(),
                &self.ctx.course_id,
                rows.len() as i64,
                db::now_rfc3339(),
            ),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO import_values(import_code, student_id, grade_item_id, value_kind, final_grade, feedback, row_no)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in rows {
                stmt.execute((
                    import_code.as_str(),
                    &r.student_id,
                    &r.item_id,
                    r.value.kind(),
                    r.value.stored_value(),
                    r.feedback.as_deref(),
                    r.row as i64,
                ))?;
            }
        }
        tx.commit()?;
        tracing::debug!(%import_code, rows = rows.len(), "validated batch written");
        Ok(import_code)
    }
}

/// Values collected from one source row, keyed by grade item.
struct RowCells {
    line: usize,
    student_id: String,
    entries: Vec<GradeRow>,
}

impl RowCells {
    fn new(row: &StagedRow, student_id: String) -> Self {
        Self {
            line: row.line,
            student_id,
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, item: &ItemRef) -> &mut GradeRow {
        let pos = match self.entries.iter().position(|e| e.item_id == item.id) {
            Some(pos) => pos,
            None => {
                self.entries.push(GradeRow {
                    student_id: self.student_id.clone(),
                    item_id: item.id.clone(),
                    value: GradeValue::Unchanged,
                    feedback: None,
                    row: self.line,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos]
    }

    fn set_value(&mut self, item: &ItemRef, value: GradeValue) {
        self.entry(item).value = value;
    }

    fn set_feedback(&mut self, item: &ItemRef, feedback: &str) {
        self.entry(item).feedback = Some(feedback.to_string());
    }
}

/// `Ok(None)` for an empty cell (no change), `-` clears the grade.
pub fn parse_value(cell: &str, item: &ItemRef, verbose_scales: bool) -> Result<Option<GradeValue>, String> {
    if cell.is_empty() {
        return Ok(None);
    }
    if cell == "-" {
        return Ok(Some(GradeValue::Cleared));
    }
    match &item.grade_type {
        GradeType::Value { min, max } => {
            let v = cell
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("{:?} is not a number for grade item {}", cell, item.name))?;
            if v < *min || v > *max {
                return Err(format!(
                    "{} is outside the range {}-{} of grade item {}",
                    v, min, max, item.name
                ));
            }
            Ok(Some(GradeValue::Score(v)))
        }
        GradeType::Scale { items, .. } => {
            if verbose_scales {
                match items.iter().position(|label| label == cell) {
                    Some(pos) => Ok(Some(GradeValue::Score((pos + 1) as f64))),
                    None => Err(format!(
                        "{:?} is not a label of the scale for {} (expected one of: {})",
                        cell,
                        item.name,
                        items.join(", ")
                    )),
                }
            } else {
                match cell.parse::<usize>() {
                    Ok(code) if code >= 1 && code <= items.len() => {
                        Ok(Some(GradeValue::Score(code as f64)))
                    }
                    _ => Err(format!(
                        "{:?} is not a scale code for {} (expected 1-{})",
                        cell,
                        item.name,
                        items.len()
                    )),
                }
            }
        }
    }
}
