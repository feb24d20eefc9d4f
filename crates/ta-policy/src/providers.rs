// providers.rs — Collaborator contracts consumed by the policy engine, and
// the reference implementations shipped with it.
//
// Every trait here is a seam to something outside the engine (quota
// accounting, admin tokens, task records, authorization, the sandbox, the
// execution counter). Failures come back as `ProviderError`; the engine
// decides the fail-closed outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};

use ta_audit::hasher::hash_str;
use ta_trust::{Clock, ProviderError};

// ── Quota ──

/// Snapshot of one quota's usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuotaState {
    pub calls_used: u64,
    pub call_limit: Option<u64>,
    pub concurrent: u64,
    pub concurrent_limit: Option<u64>,
    pub runtime_ms_used: u64,
    pub runtime_limit_ms: Option<u64>,
}

/// Answer of `QuotaProvider::check_quota`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaCheck {
    pub allowed: bool,
    /// Allowed, but close to a limit.
    pub warning: bool,
    pub reason: Option<String>,
    pub state: QuotaState,
}

/// Quota accounting keyed by quota id (the tool id).
pub trait QuotaProvider: Send + Sync {
    /// Read-only check; reserves nothing.
    fn check_quota(&self, quota_id: &str) -> Result<QuotaCheck, ProviderError>;

    /// Check and, when allowed, reserve one call and one concurrency slot in
    /// a single atomic step.
    fn try_acquire(&self, quota_id: &str) -> Result<QuotaCheck, ProviderError>;

    /// Record runtime and move the concurrency count. A positive delta also
    /// counts one call.
    fn update_quota(
        &self,
        quota_id: &str,
        runtime_ms: u64,
        concurrent_delta: i64,
    ) -> Result<(), ProviderError>;

    /// Hand back a reservation that never executed: frees its slot and
    /// uncounts its call.
    fn cancel(&self, quota_id: &str) -> Result<(), ProviderError>;
}

/// A reserved quota slot. Dropping it releases the slot: with the recorded
/// runtime once `complete` was called, as a cancellation otherwise.
pub struct QuotaSlot {
    quota: Arc<dyn QuotaProvider>,
    quota_id: String,
    runtime_ms: Option<u64>,
}

impl QuotaSlot {
    pub(crate) fn new(quota: Arc<dyn QuotaProvider>, quota_id: impl Into<String>) -> Self {
        Self {
            quota,
            quota_id: quota_id.into(),
            runtime_ms: None,
        }
    }

    pub fn quota_id(&self) -> &str {
        &self.quota_id
    }

    /// Release the slot after an execution that took `runtime_ms`.
    pub fn complete(mut self, runtime_ms: u64) {
        self.runtime_ms = Some(runtime_ms);
    }
}

impl std::fmt::Debug for QuotaSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaSlot")
            .field("quota_id", &self.quota_id)
            .field("runtime_ms", &self.runtime_ms)
            .finish()
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        let released = match self.runtime_ms {
            Some(runtime_ms) => self.quota.update_quota(&self.quota_id, runtime_ms, -1),
            None => self.quota.cancel(&self.quota_id),
        };
        if let Err(e) = released {
            tracing::warn!(quota_id = %self.quota_id, "failed to release quota slot: {}", e);
        }
    }
}

/// Limits of one quota. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuotaLimits {
    pub max_calls: Option<u64>,
    pub max_concurrent: Option<u64>,
    pub max_runtime_ms: Option<u64>,
}

/// In-process quota accounting. Quotas without configured limits are
/// unlimited. Each check and update holds one lock, so updates for a quota
/// id are atomic.
pub struct InMemoryQuotaProvider {
    limits: HashMap<String, QuotaLimits>,
    usage: Mutex<HashMap<String, QuotaState>>,
    warning_ratio: f64,
}

impl InMemoryQuotaProvider {
    /// `warning_ratio` is the fraction of any limit at which checks start
    /// warning (e.g. 0.8).
    pub fn new(warning_ratio: f64) -> Self {
        Self {
            limits: HashMap::new(),
            usage: Mutex::new(HashMap::new()),
            warning_ratio,
        }
    }

    pub fn with_limits(mut self, quota_id: impl Into<String>, limits: QuotaLimits) -> Self {
        self.limits.insert(quota_id.into(), limits);
        self
    }

    fn state_for(&self, quota_id: &str, usage: &HashMap<String, QuotaState>) -> QuotaState {
        let limits = self.limits.get(quota_id).cloned().unwrap_or_default();
        let mut state = usage.get(quota_id).cloned().unwrap_or_default();
        state.call_limit = limits.max_calls;
        state.concurrent_limit = limits.max_concurrent;
        state.runtime_limit_ms = limits.max_runtime_ms;
        state
    }
}

impl Default for InMemoryQuotaProvider {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl InMemoryQuotaProvider {
    fn usage(&self) -> Result<MutexGuard<'_, HashMap<String, QuotaState>>, ProviderError> {
        self.usage
            .lock()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    fn evaluate(&self, quota_id: &str, state: QuotaState) -> QuotaCheck {
        let dimensions = [
            ("calls", state.calls_used, state.call_limit),
            ("concurrent", state.concurrent, state.concurrent_limit),
            ("runtime_ms", state.runtime_ms_used, state.runtime_limit_ms),
        ];

        let mut exceeded = Vec::new();
        let mut near = Vec::new();
        for (name, used, limit) in dimensions {
            let Some(limit) = limit else { continue };
            if used >= limit {
                exceeded.push(format!("{} {}/{}", name, used, limit));
            } else if limit > 0 && used as f64 >= limit as f64 * self.warning_ratio {
                near.push(format!("{} {}/{}", name, used, limit));
            }
        }

        if !exceeded.is_empty() {
            QuotaCheck {
                allowed: false,
                warning: false,
                reason: Some(format!("quota '{}' exhausted: {}", quota_id, exceeded.join(", "))),
                state,
            }
        } else if !near.is_empty() {
            QuotaCheck {
                allowed: true,
                warning: true,
                reason: Some(format!("quota '{}' nearly exhausted: {}", quota_id, near.join(", "))),
                state,
            }
        } else {
            QuotaCheck {
                allowed: true,
                warning: false,
                reason: None,
                state,
            }
        }
    }
}

impl QuotaProvider for InMemoryQuotaProvider {
    fn check_quota(&self, quota_id: &str) -> Result<QuotaCheck, ProviderError> {
        let usage = self.usage()?;
        Ok(self.evaluate(quota_id, self.state_for(quota_id, &usage)))
    }

    fn try_acquire(&self, quota_id: &str) -> Result<QuotaCheck, ProviderError> {
        let mut usage = self.usage()?;
        let check = self.evaluate(quota_id, self.state_for(quota_id, &usage));
        if check.allowed {
            let state = usage.entry(quota_id.to_string()).or_default();
            state.calls_used = state.calls_used.saturating_add(1);
            state.concurrent = state.concurrent.saturating_add(1);
        }
        Ok(check)
    }

    fn update_quota(
        &self,
        quota_id: &str,
        runtime_ms: u64,
        concurrent_delta: i64,
    ) -> Result<(), ProviderError> {
        let mut usage = self.usage()?;
        let state = usage.entry(quota_id.to_string()).or_default();
        state.runtime_ms_used = state.runtime_ms_used.saturating_add(runtime_ms);
        if concurrent_delta > 0 {
            state.calls_used = state.calls_used.saturating_add(1);
            state.concurrent = state.concurrent.saturating_add(concurrent_delta.unsigned_abs());
        } else {
            state.concurrent = state.concurrent.saturating_sub(concurrent_delta.unsigned_abs());
        }
        Ok(())
    }

    fn cancel(&self, quota_id: &str) -> Result<(), ProviderError> {
        let mut usage = self.usage()?;
        let state = usage.entry(quota_id.to_string()).or_default();
        state.calls_used = state.calls_used.saturating_sub(1);
        state.concurrent = state.concurrent.saturating_sub(1);
        Ok(())
    }
}

// ── Admin tokens ──

/// Validates admin approval tokens.
pub trait AdminTokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Holds SHA-256 digests of issued tokens; the tokens themselves are never
/// stored.
#[derive(Default)]
pub struct StaticTokenValidator {
    digests: RwLock<HashSet<String>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate, register and return a fresh random token.
    pub fn issue(&self) -> String {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        self.add_token(&token);
        token
    }

    /// Register a token supplied from outside (e.g. an operator secret).
    pub fn add_token(&self, token: &str) {
        let mut digests = self.digests.write().unwrap_or_else(|p| p.into_inner());
        digests.insert(hash_str(token));
    }

    pub fn revoke(&self, token: &str) -> bool {
        let mut digests = self.digests.write().unwrap_or_else(|p| p.into_inner());
        digests.remove(&hash_str(token))
    }
}

impl AdminTokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let digests = self.digests.read().unwrap_or_else(|p| p.into_inner());
        digests.contains(&hash_str(token))
    }
}

// ── Tasks ──

/// Frozen-spec status of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpecStatus {
    pub task_id: String,
    pub frozen: bool,
    pub spec_hash: Option<String>,
}

/// Source of truth for task spec status.
pub trait TaskStore: Send + Sync {
    fn task_status(&self, task_id: &str) -> Result<Option<TaskSpecStatus>, ProviderError>;
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskSpecStatus>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, status: TaskSpecStatus) {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks.insert(status.task_id.clone(), status);
    }
}

impl TaskStore for MemoryTaskStore {
    fn task_status(&self, task_id: &str) -> Result<Option<TaskSpecStatus>, ProviderError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(tasks.get(task_id).cloned())
    }
}

// ── Authorization ──

/// Answer of the authorization provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationResult {
    pub allowed: bool,
    pub reason: String,
}

pub trait AuthorizationProvider: Send + Sync {
    fn check_authorization(
        &self,
        capability_id: &str,
        action_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<AuthorizationResult, ProviderError>;
}

/// Allows everything except explicitly denied (capability, user) pairs.
#[derive(Default)]
pub struct StaticAuthorization {
    denied: RwLock<HashSet<(String, String)>>,
}

impl StaticAuthorization {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(&self, capability_id: &str, user_id: &str) {
        let mut denied = self.denied.write().unwrap_or_else(|p| p.into_inner());
        denied.insert((capability_id.to_string(), user_id.to_string()));
    }
}

impl AuthorizationProvider for StaticAuthorization {
    fn check_authorization(
        &self,
        capability_id: &str,
        _action_id: &str,
        _session_id: &str,
        user_id: &str,
    ) -> Result<AuthorizationResult, ProviderError> {
        let denied = self
            .denied
            .read()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        if denied.contains(&(capability_id.to_string(), user_id.to_string())) {
            Ok(AuthorizationResult {
                allowed: false,
                reason: format!("user '{}' is not authorized for '{}'", user_id, capability_id),
            })
        } else {
            Ok(AuthorizationResult {
                allowed: true,
                reason: "authorized".to_string(),
            })
        }
    }
}

// ── Sandbox ──

/// Reports whether the sandboxed runner can take work.
pub trait SandboxProbe: Send + Sync {
    fn is_available(&self) -> Result<bool, ProviderError>;
}

/// A probe with a fixed answer, switchable at runtime.
pub struct StaticSandboxProbe {
    available: Mutex<bool>,
}

impl StaticSandboxProbe {
    pub fn new(available: bool) -> Self {
        Self {
            available: Mutex::new(available),
        }
    }

    pub fn set_available(&self, available: bool) {
        *self.available.lock().unwrap_or_else(|p| p.into_inner()) = available;
    }
}

impl SandboxProbe for StaticSandboxProbe {
    fn is_available(&self) -> Result<bool, ProviderError> {
        self.available
            .lock()
            .map(|a| *a)
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }
}

// ── Execution counter ──

/// Today's count as seen by `ExecutionCounter::try_acquire`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyCount {
    /// Whether this execution was counted.
    pub allowed: bool,
    /// Executions counted today before this one.
    pub count: u64,
}

/// Counts executions per (capability, action) per UTC day.
pub trait ExecutionCounter: Send + Sync {
    fn executions_today(&self, capability_id: &str, action_id: &str) -> Result<u64, ProviderError>;

    /// Count one execution unless today's count already reached `limit`.
    /// The check and the increment are one atomic step.
    fn try_acquire(
        &self,
        capability_id: &str,
        action_id: &str,
        limit: u64,
    ) -> Result<DailyCount, ProviderError>;
}

pub struct InMemoryExecutionCounter {
    clock: Arc<dyn Clock>,
    counts: Mutex<HashMap<(String, String, NaiveDate), u64>>,
}

impl InMemoryExecutionCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counts: Mutex::new(HashMap::new()),
        }
    }
}

impl ExecutionCounter for InMemoryExecutionCounter {
    fn executions_today(&self, capability_id: &str, action_id: &str) -> Result<u64, ProviderError> {
        let today = self.clock.now().date_naive();
        let counts = self
            .counts
            .lock()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(counts
            .get(&(capability_id.to_string(), action_id.to_string(), today))
            .copied()
            .unwrap_or(0))
    }

    fn try_acquire(
        &self,
        capability_id: &str,
        action_id: &str,
        limit: u64,
    ) -> Result<DailyCount, ProviderError> {
        let today = self.clock.now().date_naive();
        let mut counts = self
            .counts
            .lock()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        // Earlier days are never read again.
        counts.retain(|(_, _, day), _| *day >= today);
        let count = counts
            .entry((capability_id.to_string(), action_id.to_string(), today))
            .or_insert(0);
        let seen = *count;
        if seen >= limit {
            return Ok(DailyCount {
                allowed: false,
                count: seen,
            });
        }
        *count += 1;
        Ok(DailyCount {
            allowed: true,
            count: seen,
        })
    }
}
