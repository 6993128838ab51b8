use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::staging;
use crate::worker::WorkerPool;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "workers": state.workers.as_ref().map(|w| w.size()).unwrap_or(0)
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    // Workers of the previous workspace must not outlive its connection.
    state.workers = None;

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };
    // Best-effort: uploads that were never scheduled should not pile up.
    match staging::purge_expired(&conn, state.config.staging_ttl) {
        Ok(0) => {}
        Ok(n) => tracing::info!(purged = n, "expired staged uploads removed"),
        Err(e) => tracing::warn!(error = %e, "staging purge failed"),
    }

    if state.config.workers > 0 {
        match WorkerPool::spawn(&path, &state.config, &state.locks) {
            Ok(pool) => state.workers = Some(pool),
            Err(e) => return err(&req.id, "worker_spawn_failed", format!("{e:?}"), None),
        }
    }

    state.workspace = Some(path.clone());
    state.db = Some(conn);
    tracing::info!(workspace = %path.display(), "workspace selected");
    ok(
        &req.id,
        json!({
            "workspacePath": path.to_string_lossy(),
            "workers": state.workers.as_ref().map(|w| w.size()).unwrap_or(0)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
