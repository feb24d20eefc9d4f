// registry.rs — Typed capability ids and the execution backend registry.
//
// Backends are looked up by a validated CapabilityId rather than by raw
// strings, so a malformed or unregistered id is caught before anything runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ta_trust::ProviderError;

use crate::error::PolicyError;
use crate::tool::Invocation;

/// A validated capability identifier: non-empty lowercase ASCII letters,
/// digits, `.`, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityId(String);

impl CapabilityId {
    pub fn new(id: impl Into<String>) -> Result<Self, PolicyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PolicyError::InvalidCapabilityId {
                id,
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')))
        {
            return Err(PolicyError::InvalidCapabilityId {
                reason: format!("character '{}' is not allowed", bad),
                id,
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CapabilityId {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CapabilityId> for String {
    fn from(id: CapabilityId) -> Self {
        id.0
    }
}

/// Outcome of one backend execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub backend_unavailable: bool,
    /// The sandbox reported an attempted escape.
    #[serde(default)]
    pub sandbox_violation: bool,
}

impl ExecutionResult {
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            success: false,
            error: Some(format!("execution timed out after {}ms", timeout.as_millis())),
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            backend_unavailable: true,
            ..Default::default()
        }
    }
}

/// A sandboxed runner that executes one capability.
pub trait ExecutionBackend: Send + Sync {
    fn is_available(&self) -> bool;

    /// Run the invocation. Must return within `timeout`; a backend that
    /// cannot finish in time returns `ProviderError::Timeout`.
    fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<ExecutionResult, ProviderError>;
}

/// Maps capability ids to their execution backends.
#[derive(Default)]
pub struct CapabilityRegistry {
    backends: RwLock<HashMap<CapabilityId, Arc<dyn ExecutionBackend>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Invalid ids and duplicates are rejected.
    pub fn register(
        &self,
        id: &str,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<CapabilityId, PolicyError> {
        let id = CapabilityId::new(id)?;
        let mut backends = self.backends.write()?;
        if backends.contains_key(&id) {
            return Err(PolicyError::DuplicateCapability {
                capability_id: id.to_string(),
            });
        }
        backends.insert(id.clone(), backend);
        tracing::debug!(capability_id = %id, "registered execution backend");
        Ok(id)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ExecutionBackend>, PolicyError> {
        let id = CapabilityId::new(id)?;
        self.backends
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownCapability {
                capability_id: id.to_string(),
            })
    }

    pub fn ids(&self) -> Result<Vec<CapabilityId>, PolicyError> {
        let mut ids: Vec<_> = self.backends.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
