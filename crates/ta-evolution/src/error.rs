// error.rs — Error types for the evolution subsystem.

use thiserror::Error;
use uuid::Uuid;

use ta_policy::PolicyError;
use ta_trust::{ProviderError, TrustError};

use crate::decision::DecisionStatus;

/// Errors from evolution decision operations.
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// A file I/O operation in the decision store failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize or deserialize a stored decision.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decision not found: {0}")]
    NotFound(Uuid),

    /// Decisions are append-only; an id can be inserted once.
    #[error("decision {0} already exists")]
    Duplicate(Uuid),

    /// The decision is not in the status the operation needs.
    #[error("decision {decision_id} is {status}, expected {expected}")]
    InvalidStatus {
        decision_id: Uuid,
        status: DecisionStatus,
        expected: DecisionStatus,
    },

    /// The decision passed its expiry before a review outcome; it is now
    /// marked EXPIRED.
    #[error("decision {decision_id} expired at {expired_at}")]
    DecisionExpired {
        decision_id: Uuid,
        expired_at: String,
    },

    /// Approve and reject need an identified approver.
    #[error("an approver must be identified")]
    MissingApprover,

    /// The execution/violation history could not be read; no decision is
    /// written without evidence.
    #[error("history store error: {0}")]
    History(ProviderError),

    /// The human review queue could not accept the decision; it stays
    /// PROPOSED.
    #[error("review queue error: {0}")]
    ReviewQueue(ProviderError),

    /// The tier or trajectory engine failed.
    #[error("trust engine error: {0}")]
    Trust(#[from] TrustError),

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for EvolutionError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        EvolutionError::LockPoisoned(e.to_string())
    }
}

/// Errors loading `.ta/governance.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid governance config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The policy section does not compile (e.g. a bad blacklist pattern).
    #[error("invalid policy config: {0}")]
    Policy(#[from] PolicyError),
}
