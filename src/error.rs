use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("staged import not found: {handle}")]
    StagingNotFound { handle: String },

    #[error("parse error at {position}: {message}")]
    Parse { position: String, message: String },

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    /// Stable snake_case code used in IPC error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::StagingNotFound { .. } => "staging_not_found",
            ImportError::Parse { .. } => "parse_error",
            ImportError::Commit(_) => "commit_error",
            ImportError::TaskNotFound(_) => "not_found",
            ImportError::Db(_) => "db_failed",
            ImportError::Io(_) => "io_failed",
            ImportError::Json(_) => "bad_json",
        }
    }

    pub fn parse(position: impl Into<String>, message: impl Into<String>) -> Self {
        ImportError::Parse {
            position: position.into(),
            message: message.into(),
        }
    }
}

/// Category of a row-level failure collected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    /// Header cannot be tied to a student, grade item or feedback field.
    Mapping,
    /// Unknown, ambiguous or duplicated student/grade item reference.
    Resolution,
    /// Cell does not match the item's representation: a scale label or code,
    /// or a number inside the item's range.
    ScaleFormat,
    /// Student outside the current group under separate-groups mode.
    Group,
    /// Grade item is locked against edits.
    Locked,
}

/// One accumulated validation failure. `row` is `None` for header-level problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadError {
    pub row: Option<usize>,
    pub field: String,
    pub kind: LoadErrorKind,
    pub reason: String,
}

impl LoadError {
    pub fn header(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LoadError {
            row: None,
            field: field.into(),
            kind: LoadErrorKind::Mapping,
            reason: reason.into(),
        }
    }

    pub fn at(
        row: usize,
        field: impl Into<String>,
        kind: LoadErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        LoadError {
            row: Some(row),
            field: field.into(),
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {} [{}]: {}", row, self.field, self.reason),
            None => write!(f, "header [{}]: {}", self.field, self.reason),
        }
    }
}
