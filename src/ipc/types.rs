use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::commit::CourseLocks;
use crate::config::DaemonConfig;
use crate::worker::WorkerPool;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub config: DaemonConfig,
    pub locks: CourseLocks,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub workers: Option<WorkerPool>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        AppState {
            config,
            locks: CourseLocks::default(),
            workspace: None,
            db: None,
            workers: None,
        }
    }
}
