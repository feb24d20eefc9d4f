// error.rs — Error types for the trust subsystem.

use thiserror::Error;

use crate::state::TrustState;

/// Errors from trust tier / trajectory operations.
///
/// Store failures are always surfaced: an unrecorded transition or tier
/// change would break the audit trail.
#[derive(Debug, Error)]
pub enum TrustError {
    /// A file I/O operation in a store failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize a stored record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The (capability, action) key is malformed.
    #[error("invalid trust key: {reason}")]
    InvalidKey { reason: String },

    /// A state pair outside the EARNING → STABLE → DEGRADING → EARNING cycle.
    #[error("invalid trust transition from {from} to {to}")]
    InvalidTransition { from: TrustState, to: TrustState },

    /// Bootstrap was requested for a key that already has a trust record.
    #[error("capability '{capability_id}' action '{action_id}' is already tracked")]
    AlreadyTracked {
        capability_id: String,
        action_id: String,
    },

    /// A lock guarding shared engine state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Failure reported by an external collaborator (risk provider, quota
/// provider, review queue, history store, ...).
///
/// Callers decide the conservative fallback; this type only says what went
/// wrong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The collaborator could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The collaborator did not answer in time.
    #[error("provider timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The collaborator answered but refused the request.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl<T> From<std::sync::PoisonError<T>> for TrustError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        TrustError::LockPoisoned(e.to_string())
    }
}
