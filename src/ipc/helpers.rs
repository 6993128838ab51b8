use rusqlite::Connection;
use serde_json::Value;

use crate::error::ImportError;
use crate::ipc::error::{err, import_err};
use crate::ipc::types::AppState;

/// Early-return error from a handler body; turned into an envelope once.
pub enum HandlerErr {
    Params(String),
    NoWorkspace,
    Coded {
        code: &'static str,
        message: String,
        details: Option<Value>,
    },
    Import(ImportError),
}

impl HandlerErr {
    pub fn response(self, id: &str) -> Value {
        match self {
            HandlerErr::Params(message) => err(id, "bad_params", message, None),
            HandlerErr::NoWorkspace => err(id, "no_workspace", "select a workspace first", None),
            HandlerErr::Coded {
                code,
                message,
                details,
            } => err(id, code, message, details),
            HandlerErr::Import(e) => import_err(id, &e),
        }
    }
}

impl From<ImportError> for HandlerErr {
    fn from(e: ImportError) -> Self {
        HandlerErr::Import(e)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::Import(ImportError::Db(e))
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or(HandlerErr::NoWorkspace)
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        Some(_) => Err(HandlerErr::Params(format!("{} must not be empty", key))),
        None => Err(HandlerErr::Params(format!("missing {}", key))),
    }
}

pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HandlerErr::Params(format!("{} must be a string", key))),
    }
}

pub fn get_bool(params: &Value, key: &str, default: bool) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(HandlerErr::Params(format!("{} must be a boolean", key))),
    }
}

pub fn get_opt_u64(params: &Value, key: &str) -> Result<Option<u64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| HandlerErr::Params(format!("{} must be a non-negative integer", key))),
    }
}
