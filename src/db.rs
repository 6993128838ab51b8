use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn db_path(workspace: &Path) -> std::path::PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    // The IPC thread and workers hold separate connections to the same file.
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get::<_, String>(0))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            idnumber TEXT,
            username TEXT,
            email TEXT,
            last_name TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrolments(
            course_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(course_id, student_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrolments_student ON enrolments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_groups(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(group_id, student_id),
            FOREIGN KEY(group_id) REFERENCES course_groups(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scales(
            id TEXT PRIMARY KEY,
            course_id TEXT,
            name TEXT NOT NULL,
            items TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_items(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            idnumber TEXT,
            item_type TEXT NOT NULL DEFAULT 'value',
            grade_min REAL NOT NULL DEFAULT 0,
            grade_max REAL NOT NULL DEFAULT 100,
            scale_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(scale_id) REFERENCES scales(id)
        )",
        [],
    )?;
    // Older workspaces predate item locking.
    ensure_grade_items_locked(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_items_course ON grade_items(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            grade_item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            final_grade REAL,
            feedback TEXT,
            updated_at TEXT,
            FOREIGN KEY(grade_item_id) REFERENCES grade_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(grade_item_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_history(
            id TEXT PRIMARY KEY,
            grade_item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            old_grade REAL,
            new_grade REAL,
            feedback TEXT,
            source TEXT NOT NULL,
            import_code TEXT,
            logged_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_history_item ON grade_history(grade_item_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staged_imports(
            handle TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            format TEXT NOT NULL,
            delimiter TEXT,
            content TEXT NOT NULL,
            digest TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_batches(
            import_code TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_values(
            import_code TEXT NOT NULL,
            student_id TEXT NOT NULL,
            grade_item_id TEXT NOT NULL,
            value_kind TEXT NOT NULL,
            final_grade REAL,
            feedback TEXT,
            row_no INTEGER NOT NULL,
            PRIMARY KEY(import_code, student_id, grade_item_id),
            FOREIGN KEY(import_code) REFERENCES import_batches(import_code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_tasks(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            course_id TEXT NOT NULL,
            status TEXT NOT NULL,
            job_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )",
        [],
    )?;
    ensure_import_tasks_progress_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_tasks_status_course ON import_tasks(status, course_id)",
        [],
    )?;

    Ok(())
}

fn ensure_grade_items_locked(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_items", "locked")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_items ADD COLUMN locked INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_import_tasks_progress_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "import_tasks", "progress_step")? {
        conn.execute(
            "ALTER TABLE import_tasks ADD COLUMN progress_step INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "import_tasks", "progress_total")? {
        conn.execute(
            "ALTER TABLE import_tasks ADD COLUMN progress_total INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "import_tasks", "progress_message")? {
        conn.execute(
            "ALTER TABLE import_tasks ADD COLUMN progress_message TEXT",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    to_rfc3339(chrono::Utc::now())
}

/// Fixed-width UTC timestamps so stored values compare lexically.
pub fn to_rfc3339(t: chrono::DateTime<chrono::Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
