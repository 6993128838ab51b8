#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde_json::json;

pub struct Sidecar {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Sidecar {
    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
        );
        value.get("result").cloned().unwrap_or(serde_json::Value::Null)
    }

    /// Returns the `error` object of a response that must fail.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error object")
    }

    pub fn select_workspace(&mut self, workspace: &Path) {
        let _ = self.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
    }

    /// Poll `import.status` until the task reaches a terminal state.
    pub fn wait_for_task(&mut self, task_id: &str) -> serde_json::Value {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let status = self.request_ok("import.status", json!({ "taskId": task_id }));
            let state = status.get("state").and_then(|v| v.as_str()).unwrap_or("");
            if state == "committed" || state == "failed" {
                return status;
            }
            assert!(Instant::now() < deadline, "task {} stuck in {}", task_id, state);
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

/// Sidecar with background workers disabled; tests drain with `import.runPending`.
pub fn spawn_sidecar() -> Sidecar {
    spawn_sidecar_with(&[("GRADEIMPORTD_WORKERS", "0")])
}

pub fn spawn_sidecar_with(env: &[(&str, &str)]) -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_gradeimportd");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("GRADEIMPORTD_WORKERS")
        .env_remove("GRADEIMPORTD_STRICT_MAPPING");
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn gradeimportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
        next_id: 0,
    }
}

pub fn open_workspace_db(workspace: &Path) -> Connection {
    let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open workspace db");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn
}

/// One course (`c1`) with three enrolled students, a numeric item `MathQuiz`
/// (idnumber `MQ1`, 0..100) and a scale item `Effort`; plus course `c2`.
/// The schema must already exist (select the workspace first).
pub fn seed_gradebook(workspace: &Path) {
    let conn = open_workspace_db(workspace);
    conn.execute_batch(
        "INSERT INTO courses(id, name) VALUES('c1', 'Math 8');
         INSERT INTO courses(id, name) VALUES('c2', 'Science 8');
         INSERT INTO students(id, idnumber, username, email, last_name, first_name)
           VALUES('101', 'S-101', 'ada', 'ada@example.org', 'Lovelace', 'Ada');
         INSERT INTO students(id, idnumber, username, email, last_name, first_name)
           VALUES('102', 'S-102', 'alan', 'alan@example.org', 'Turing', 'Alan');
         INSERT INTO students(id, idnumber, username, email, last_name, first_name)
           VALUES('103', 'S-103', 'grace', 'grace@example.org', 'Hopper', 'Grace');
         INSERT INTO enrolments(course_id, student_id) VALUES('c1', '101');
         INSERT INTO enrolments(course_id, student_id) VALUES('c1', '102');
         INSERT INTO enrolments(course_id, student_id) VALUES('c1', '103');
         INSERT INTO scales(id, course_id, name, items)
           VALUES('sc1', 'c1', 'Effort', 'Poor, Fair, Good, Excellent');
         INSERT INTO grade_items(id, course_id, name, idnumber, item_type, grade_min, grade_max, sort_order)
           VALUES('i-math', 'c1', 'MathQuiz', 'MQ1', 'value', 0, 100, 0);
         INSERT INTO grade_items(id, course_id, name, idnumber, item_type, grade_min, grade_max, scale_id, sort_order)
           VALUES('i-effort', 'c1', 'Effort', 'EFF', 'scale', 1, 4, 'sc1', 1);",
    )
    .expect("seed gradebook");
}

pub fn grade_of(workspace: &Path, item_id: &str, student_id: &str) -> Option<f64> {
    let conn = open_workspace_db(workspace);
    conn.query_row(
        "SELECT final_grade FROM grades WHERE grade_item_id = ? AND student_id = ?",
        (item_id, student_id),
        |r| r.get::<_, Option<f64>>(0),
    )
    .ok()
    .flatten()
}

pub fn count_rows(workspace: &Path, table: &str) -> i64 {
    let conn = open_workspace_db(workspace);
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .expect("count rows")
}
