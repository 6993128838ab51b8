mod commit;
mod config;
mod db;
mod error;
mod gradebook;
mod ipc;
mod loader;
mod queue;
mod staging;
mod task;
mod worker;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_env(config::ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries IPC responses.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cfg = config::DaemonConfig::from_env()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cfg.workers,
        poll_ms = cfg.poll_interval.as_millis() as u64,
        "gradeimportd starting"
    );
    let mut state = ipc::AppState::new(cfg);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let method = req.method.clone();
        let resp = ipc::handle_request(&mut state, req);
        tracing::debug!(%method, ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false), "request handled");
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    // Joins any background workers before exit.
    drop(state);
    tracing::info!("stdin closed, shutting down");
    Ok(())
}
