use std::io;

use ledgerkeep_core::LedgerError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Map `io::ErrorKind` to a stable coarse-grained error code string.
fn error_code(e: &io::Error) -> &'static str {
    match e.kind() {
        io::ErrorKind::NotFound => "not_found",
        io::ErrorKind::InvalidInput => "invalid_input",
        io::ErrorKind::PermissionDenied => "permission_denied",
        io::ErrorKind::InvalidData => "invalid_data",
        io::ErrorKind::AlreadyExists => "already_exists",
        _ => "internal_error",
    }
}

/// Anything that ends an invocation early.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl Failure {
    pub fn code(&self) -> &'static str {
        match self {
            Failure::Io(e) => error_code(e),
            Failure::Ledger(e) => e.code(),
        }
    }
}

/// Serialize `payload` as one JSONL record on stdout, tagged with `type`.
///
/// Non-object payloads are wrapped under `value`.
pub fn emit<T: Serialize>(kind: &str, payload: &T) -> Result<(), Failure> {
    let mut object = match serde_json::to_value(payload).map_err(LedgerError::from)? {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other);
            map
        }
    };
    object.insert("type".into(), Value::String(kind.to_string()));
    println!("{}", Value::Object(object));
    Ok(())
}

/// Final status line on stderr.
pub fn emit_done(result: &Result<(), Failure>) {
    let json = match result {
        Ok(()) => serde_json::json!({"type": "done", "ok": true}),
        Err(e) => serde_json::json!({
            "type": "done",
            "ok": false,
            "code": e.code(),
            "message": e.to_string(),
        }),
    };
    eprintln!("{}", json);
}
