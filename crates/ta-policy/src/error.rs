// error.rs — Error types for the policy subsystem.
//
// A policy *denial* is not an error: it is a `PolicyDecision` with
// `allowed == false`. Errors here mean the request could not be evaluated
// at all (malformed input, unknown capability) or a store failed.

use thiserror::Error;

use ta_trust::{ProviderError, TrustError};

/// Errors that can occur during policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The invocation or tool descriptor is malformed. Raised before any
    /// gate runs.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A capability id does not follow the identifier rules.
    #[error("invalid capability id '{id}': {reason}")]
    InvalidCapabilityId { id: String, reason: String },

    /// No execution backend is registered for the capability.
    #[error("no backend registered for capability '{capability_id}'")]
    UnknownCapability { capability_id: String },

    /// A backend is already registered under this capability id.
    #[error("capability '{capability_id}' is already registered")]
    DuplicateCapability { capability_id: String },

    /// A blacklist entry is not a valid glob pattern.
    #[error("invalid side-effect pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The tier or trajectory engine failed (store error, bad key).
    #[error("trust engine error: {0}")]
    Trust(#[from] TrustError),

    /// A collaborator failed where no conservative fallback exists.
    #[error("collaborator error: {0}")]
    Provider(#[from] ProviderError),

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PolicyError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        PolicyError::LockPoisoned(e.to_string())
    }
}

impl PolicyError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        PolicyError::Validation {
            reason: reason.into(),
        }
    }
}
