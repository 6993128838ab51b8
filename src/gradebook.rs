//! Read and write access to the live gradebook tables.
//!
//! Only the commit gate calls the write half of this module.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which student column an import identifies students by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentKey {
    Id,
    IdNumber,
    Username,
    Email,
}

impl StudentKey {
    fn column(self) -> &'static str {
        match self {
            StudentKey::Id => "s.id",
            StudentKey::IdNumber => "s.idnumber",
            StudentKey::Username => "s.username",
            StudentKey::Email => "s.email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" | "userid" | "student_id" | "studentid" => Some(StudentKey::Id),
            "idnumber" | "useridnumber" | "student_idnumber" => Some(StudentKey::IdNumber),
            "username" => Some(StudentKey::Username),
            "email" | "useremail" => Some(StudentKey::Email),
            _ => None,
        }
    }
}

/// How a grade item reference string is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKey {
    Id,
    Name,
    IdNumber,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRef {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GradeType {
    Value { min: f64, max: f64 },
    Scale { scale_id: String, items: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemRef {
    pub id: String,
    pub name: String,
    pub grade_type: GradeType,
    pub locked: bool,
}

#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Ambiguous(usize),
}

fn into_lookup<T>(mut found: Vec<T>) -> Lookup<T> {
    if found.len() > 1 {
        return Lookup::Ambiguous(found.len());
    }
    match found.pop() {
        Some(v) => Lookup::Found(v),
        None => Lookup::NotFound,
    }
}

pub fn course_exists(conn: &Connection, course_id: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

/// Find an enrolled student of `course_id` whose `key` column equals `value`.
pub fn resolve_student(
    conn: &Connection,
    course_id: &str,
    key: StudentKey,
    value: &str,
) -> rusqlite::Result<Lookup<StudentRef>> {
    let sql = format!(
        "SELECT s.id, s.last_name, s.first_name
         FROM students s
         JOIN enrolments e ON e.student_id = s.id
         WHERE e.course_id = ? AND {} = ?
         LIMIT 2",
        key.column()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let found = stmt
        .query_map((course_id, value), |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(StudentRef {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(into_lookup(found))
}

pub fn resolve_grade_item(
    conn: &Connection,
    course_id: &str,
    key: ItemKey,
    value: &str,
) -> rusqlite::Result<Lookup<ItemRef>> {
    let column = match key {
        ItemKey::Id => "gi.id",
        ItemKey::Name => "gi.name",
        ItemKey::IdNumber => "gi.idnumber",
    };
    let sql = format!(
        "SELECT gi.id, gi.name, gi.item_type, gi.grade_min, gi.grade_max, gi.scale_id, sc.items, gi.locked
         FROM grade_items gi
         LEFT JOIN scales sc ON sc.id = gi.scale_id
         WHERE gi.course_id = ? AND {} = ?
         ORDER BY gi.sort_order
         LIMIT 2",
        column
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let found = stmt
        .query_map((course_id, value), item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(into_lookup(found))
}

fn item_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRef> {
    let item_type: String = r.get(2)?;
    let scale_id: Option<String> = r.get(5)?;
    let scale_items: Option<String> = r.get(6)?;
    let grade_type = match (item_type.as_str(), scale_id) {
        ("scale", Some(scale_id)) => GradeType::Scale {
            scale_id,
            items: split_scale_items(scale_items.as_deref().unwrap_or("")),
        },
        _ => GradeType::Value {
            min: r.get(3)?,
            max: r.get(4)?,
        },
    };
    Ok(ItemRef {
        id: r.get(0)?,
        name: r.get(1)?,
        grade_type,
        locked: r.get::<_, i64>(7)? != 0,
    })
}

/// Scale items are stored comma separated, lowest first.
pub fn split_scale_items(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn group_in_course(conn: &Connection, course_id: &str, group_id: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM course_groups WHERE id = ? AND course_id = ?",
            (group_id, course_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn is_group_member(conn: &Connection, group_id: &str, student_id: &str) -> rusqlite::Result<bool> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM group_members WHERE group_id = ? AND student_id = ?")?;
    Ok(stmt
        .query_row((group_id, student_id), |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentGrade {
    pub final_grade: Option<f64>,
    pub feedback: Option<String>,
}

pub fn current_grade(
    conn: &Connection,
    item_id: &str,
    student_id: &str,
) -> rusqlite::Result<Option<CurrentGrade>> {
    conn.query_row(
        "SELECT final_grade, feedback FROM grades WHERE grade_item_id = ? AND student_id = ?",
        (item_id, student_id),
        |r| {
            Ok(CurrentGrade {
                final_grade: r.get(0)?,
                feedback: r.get(1)?,
            })
        },
    )
    .optional()
}

pub fn upsert_grade(
    conn: &Connection,
    item_id: &str,
    student_id: &str,
    grade: &CurrentGrade,
    updated_at: &str,
) -> rusqlite::Result<()> {
    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, grade_item_id, student_id, final_grade, feedback, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(grade_item_id, student_id) DO UPDATE SET
           final_grade = excluded.final_grade,
           feedback = excluded.feedback,
           updated_at = excluded.updated_at",
        (
            &grade_id,
            item_id,
            student_id,
            grade.final_grade,
            grade.feedback.as_deref(),
            updated_at,
        ),
    )?;
    Ok(())
}

pub struct HistoryEntry<'a> {
    pub item_id: &'a str,
    pub student_id: &'a str,
    pub old_grade: Option<f64>,
    pub new_grade: Option<f64>,
    pub feedback: Option<&'a str>,
    pub import_code: &'a str,
    pub logged_at: &'a str,
}

pub fn insert_history(conn: &Connection, entry: &HistoryEntry<'_>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO grade_history(id, grade_item_id, student_id, old_grade, new_grade, feedback, source, import_code, logged_at)
         VALUES(?, ?, ?, ?, ?, ?, 'import', ?, ?)",
        (
            Uuid::new_v4().to_string(),
            entry.item_id,
            entry.student_id,
            entry.old_grade,
            entry.new_grade,
            entry.feedback,
            entry.import_code,
            entry.logged_at,
        ),
    )?;
    Ok(())
}
