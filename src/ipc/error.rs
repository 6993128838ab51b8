use serde_json::json;

use crate::error::ImportError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Envelope for a domain failure, keyed by its stable code.
pub fn import_err(id: &str, e: &ImportError) -> serde_json::Value {
    let details = match e {
        ImportError::StagingNotFound { handle } => Some(json!({ "stagingHandle": handle })),
        ImportError::Parse { position, .. } => Some(json!({ "position": position })),
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}
