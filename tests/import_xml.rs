mod test_support;

use serde_json::json;
use test_support::{count_rows, grade_of, seed_gradebook, spawn_sidecar, temp_dir};

const RESULTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<results>
  <result>
    <assignment>MQ1</assignment>
    <student>S-101</student>
    <score>88</score>
    <feedback><![CDATA[Solid <b>work</b>]]></feedback>
  </result>
  <result>
    <assignment>EFF</assignment>
    <student>S-102</student>
    <score>Good</score>
  </result>
</results>
"#;

fn schedule_and_drain(sidecar: &mut test_support::Sidecar, params: serde_json::Value) -> serde_json::Value {
    let scheduled = sidecar.request_ok("import.schedule", params);
    let task_id = scheduled.get("taskId").and_then(|v| v.as_str()).expect("taskId").to_string();
    let _ = sidecar.request_ok("import.runPending", json!({}));
    sidecar.request_ok("import.status", json!({ "taskId": task_id }))
}

#[test]
fn staged_xml_results_are_committed() {
    let workspace = temp_dir("gradeimportd-xml-staged");
    let mut sidecar = spawn_sidecar();
    sidecar.select_workspace(&workspace);
    seed_gradebook(&workspace);

    let staged = sidecar.request_ok("import.stageXml", json!({ "courseId": "c1", "text": RESULTS }));
    let handle = staged.get("stagingHandle").and_then(|v| v.as_str()).expect("handle");
    let status = schedule_and_drain(
        &mut sidecar,
        json!({ "courseId": "c1", "format": "xml", "stagingHandle": handle }),
    );
    assert_eq!(status.get("state").and_then(|v| v.as_str()), Some("committed"));
    assert_eq!(grade_of(&workspace, "i-math", "101"), Some(88.0));
    assert_eq!(grade_of(&workspace, "i-effort", "102"), Some(3.0));

    let conn = test_support::open_workspace_db(&workspace);
    let feedback: Option<String> = conn
        .query_row(
            "SELECT feedback FROM grades WHERE grade_item_id = 'i-math' AND student_id = '101'",
            [],
            |r| r.get(0),
        )
        .expect("grade row");
    assert_eq!(feedback.as_deref(), Some("Solid <b>work</b>"));
}

#[test]
fn xml_can_be_read_from_a_file_path() {
    let workspace = temp_dir("gradeimportd-xml-file");
    let mut sidecar = spawn_sidecar();
    sidecar.select_workspace(&workspace);
    seed_gradebook(&workspace);

    let path = workspace.join("results.xml");
    std::fs::write(&path, RESULTS).expect("write xml");
    let status = schedule_and_drain(
        &mut sidecar,
        json!({ "courseId": "c1", "format": "xml", "filePath": path.to_string_lossy() }),
    );
    assert_eq!(status.get("state").and_then(|v| v.as_str()), Some("committed"));
    assert_eq!(count_rows(&workspace, "grades"), 2);
}

#[test]
fn malformed_xml_fails_before_validation() {
    let workspace = temp_dir("gradeimportd-xml-malformed");
    let mut sidecar = spawn_sidecar();
    sidecar.select_workspace(&workspace);
    seed_gradebook(&workspace);

    let staged = sidecar.request_ok(
        "import.stageXml",
        json!({ "courseId": "c1", "text": "<results><result><assignment>MQ1</assignment>" }),
    );
    let handle = staged.get("stagingHandle").and_then(|v| v.as_str()).expect("handle");
    let status = schedule_and_drain(
        &mut sidecar,
        json!({ "courseId": "c1", "format": "xml", "stagingHandle": handle }),
    );
    assert_eq!(status.get("state").and_then(|v| v.as_str()), Some("failed"));
    assert_eq!(
        status.get("progress").and_then(|p| p.get("step")).and_then(|v| v.as_u64()),
        Some(1)
    );
    let first = status
        .get("errors")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .expect("first error");
    assert!(first.starts_with("parse error"), "{first}");
    assert_eq!(count_rows(&workspace, "grades"), 0);
}
