use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::error::ImportError;
use crate::gradebook;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    db_conn, get_bool, get_opt_str, get_opt_u64, get_required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::loader::{ColumnMapping, ColumnTarget};
use crate::queue::{SqliteTaskQueue, TaskId, TaskQueue};
use crate::staging::{self, StagedImport, StagingHandle};
use crate::task::{ImportOptions, ImportTask};
use crate::worker;

const DEFAULT_PREVIEW_ROWS: u64 = 10;

fn require_course(conn: &Connection, course_id: &str) -> Result<(), HandlerErr> {
    if gradebook::course_exists(conn, course_id)? {
        Ok(())
    } else {
        Err(HandlerErr::Coded {
            code: "not_found",
            message: format!("course not found: {}", course_id),
            details: Some(json!({ "courseId": course_id })),
        })
    }
}

/// Upload content comes inline as `text` or from a local file at `inPath`.
fn read_content(params: &Value) -> Result<String, HandlerErr> {
    if let Some(text) = get_opt_str(params, "text")? {
        return Ok(text);
    }
    let Some(path) = get_opt_str(params, "inPath")? else {
        return Err(HandlerErr::Params("missing text or inPath".to_string()));
    };
    std::fs::read_to_string(&path).map_err(|e| HandlerErr::Coded {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "inPath": path })),
    })
}

fn stage_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_course(conn, &course_id)?;
    let delimiter = match get_opt_str(params, "delimiter")? {
        None => b',',
        Some(name) => staging::parse_delimiter(&name)
            .ok_or_else(|| HandlerErr::Params(format!("unsupported delimiter: {}", name)))?,
    };
    let preview_rows = get_opt_u64(params, "previewRows")?.unwrap_or(DEFAULT_PREVIEW_ROWS) as usize;
    let text = read_content(params)?;

    // Reject unreadable content now so the submitter can fix the mapping form.
    let parsed = StagedImport::parse_csv(&text, delimiter)?;
    let handle = staging::stage_csv(conn, &course_id, &text, delimiter)?;
    let preview: Vec<Value> = parsed
        .rows()
        .take(preview_rows)
        .map(|r| json!({ "line": r.line, "cells": r.cells }))
        .collect();
    Ok(json!({
        "stagingHandle": handle.as_str(),
        "headers": parsed.headers(),
        "rowCount": parsed.row_count(),
        "preview": preview,
    }))
}

fn stage_xml(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_course(conn, &course_id)?;
    let text = read_content(params)?;
    let handle = staging::stage_xml(conn, &course_id, &text)?;
    Ok(json!({ "stagingHandle": handle.as_str() }))
}

fn parse_mapping(params: &Value) -> Result<ColumnMapping, HandlerErr> {
    let mut mapping = ColumnMapping::default();
    let Some(raw) = params.get("mapping") else {
        return Ok(mapping);
    };
    if raw.is_null() {
        return Ok(mapping);
    }
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::Params("mapping must be an object".to_string()));
    };
    for (header, spec) in obj {
        let target = spec
            .as_str()
            .and_then(ColumnTarget::parse_spec)
            .ok_or_else(|| HandlerErr::Coded {
                code: "mapping_error",
                message: format!("unrecognized mapping for header {:?}", header),
                details: Some(json!({ "header": header, "mapping": spec })),
            })?;
        mapping.set(header.clone(), target);
    }
    Ok(mapping)
}

fn parse_options(params: &Value) -> Result<ImportOptions, HandlerErr> {
    let defaults = ImportOptions::default();
    Ok(ImportOptions {
        separate_groups: get_bool(params, "separateGroups", defaults.separate_groups)?,
        current_group: get_opt_str(params, "currentGroup")?,
        verbose_scales: get_bool(params, "verboseScales", defaults.verbose_scales)?,
        send_feedback: get_bool(params, "importFeedback", defaults.send_feedback)?,
        suppress_history: get_bool(params, "suppressHistory", defaults.suppress_history)?,
    })
}

fn require_staged(conn: &Connection, handle: &StagingHandle, course_id: &str) -> Result<(), HandlerErr> {
    if staging::exists(conn, handle, course_id)? {
        Ok(())
    } else {
        Err(ImportError::StagingNotFound {
            handle: handle.to_string(),
        }
        .into())
    }
}

fn schedule(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    require_course(conn, &course_id)?;
    let queue = SqliteTaskQueue::new(conn);
    if let Some(existing) = ImportTask::find_by_course(&queue, &course_id)? {
        return Err(HandlerErr::Coded {
            code: "import_in_progress",
            message: format!("an import is already pending for course {}", course_id),
            details: Some(json!({ "taskId": existing.as_str() })),
        });
    }

    let options = parse_options(params)?;
    let task = ImportTask::create(&course_id, options);
    let format = get_required_str(params, "format")?;
    let mut task = match format.as_str() {
        "csv" => {
            let handle = StagingHandle::from(get_required_str(params, "stagingHandle")?);
            require_staged(conn, &handle, &course_id)?;
            task.with_csv(handle, parse_mapping(params)?)
        }
        "xml" => match get_opt_str(params, "stagingHandle")? {
            Some(handle) => {
                let handle = StagingHandle::from(handle);
                require_staged(conn, &handle, &course_id)?;
                task.with_xml_staged(handle)
            }
            None => task.with_xml_file(PathBuf::from(get_required_str(params, "filePath")?)),
        },
        other => {
            return Err(HandlerErr::Params(format!(
                "format must be csv or xml, got {}",
                other
            )))
        }
    };

    let id = task.schedule(&queue)?;
    Ok(json!({ "taskId": id.as_str(), "state": task.state().as_str() }))
}

fn status(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = TaskId::from(get_required_str(params, "taskId")?);
    let queue = SqliteTaskQueue::new(conn);
    let Some(task) = queue.load(&id)? else {
        return Err(ImportError::TaskNotFound(id.to_string()).into());
    };
    let job = &task.job;
    Ok(json!({
        "taskId": task.id.as_str(),
        "kind": task.kind,
        "courseId": job.course_id,
        "state": job.state.as_str(),
        "progress": {
            "step": job.progress.step,
            "totalSteps": job.progress.total_steps,
            "message": job.progress.message,
        },
        "errors": job.errors,
        "rowErrors": job.row_errors,
        "gradesUpdated": job.grades_updated,
        "createdAt": task.created_at,
        "startedAt": task.started_at,
        "finishedAt": task.finished_at,
    }))
}

fn pending_for_course(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let queue = SqliteTaskQueue::new(conn);
    let found = ImportTask::find_by_course(&queue, &course_id)?;
    Ok(json!({ "taskId": found.as_ref().map(|id| id.as_str()) }))
}

fn run_pending(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let ran = worker::drain(conn, &state.locks, &state.config)?;
    let ran: Vec<Value> = ran
        .iter()
        .map(|(id, st)| json!({ "taskId": id.as_str(), "state": st.as_str() }))
        .collect();
    Ok(json!({ "ran": ran }))
}

fn purge_staging(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let ttl = get_opt_u64(params, "olderThanSecs")?
        .map(Duration::from_secs)
        .unwrap_or(state.config.staging_ttl);
    let purged = staging::purge_expired(conn, ttl)?;
    Ok(json!({ "purged": purged }))
}

fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn with_conn(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    respond(req, db_conn(state).and_then(|conn| f(conn, &req.params)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.stageCsv" => Some(with_conn(state, req, stage_csv)),
        "import.stageXml" => Some(with_conn(state, req, stage_xml)),
        "import.schedule" => Some(with_conn(state, req, schedule)),
        "import.status" => Some(with_conn(state, req, status)),
        "import.pendingForCourse" => Some(with_conn(state, req, pending_for_course)),
        "import.runPending" => Some(respond(req, run_pending(state))),
        "import.purgeStaging" => Some(respond(req, purge_staging(state, &req.params))),
        _ => None,
    }
}
