// error.rs — Error types for the audit subsystem.
//
// These only surface from the log itself (open/append/read/verify). Sinks
// never return them to callers: emission is fire-and-forget.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to open or create the audit log file.
    #[error("failed to open audit log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write an event to the log.
    #[error("failed to append audit event: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// An event could not be serialized, or a log line is not valid JSON.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The hash chain is broken: a line was inserted, removed, or edited.
    #[error("integrity check failed at line {line}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },
}
