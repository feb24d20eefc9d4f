// history.rs — Execution and violation history consulted as evidence.
//
// The history store is read-only from the evolution engine's point of view:
// it answers aggregate counts over a trailing window. `InMemoryHistory` is
// the reference implementation; it is fed by the governed invoker through
// the `InvocationObserver` hook, or directly by the embedding application.
// Entries older than the retention (at least the largest window ever
// queried) are dropped as new ones arrive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use ta_policy::{ExecutionResult, Gate, Invocation, InvocationObserver, PolicyDecision};
use ta_trust::{Clock, ProviderError};

/// Execution counts for one key over a window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    /// Length of the failure run at the end of the window, i.e. failures
    /// since the last success.
    pub trailing_failures: u64,
}

impl ExecutionStats {
    /// Successes over total, or `None` when nothing ran.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.successes as f64 / self.total as f64)
        }
    }
}

/// Violation counts for one key over a window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViolationStats {
    pub sandbox_violations: u64,
    pub policy_denials: u64,
    pub human_flags: u64,
}

impl ViolationStats {
    pub fn total(&self) -> u64 {
        self.sandbox_violations + self.policy_denials + self.human_flags
    }
}

/// Read-only aggregate counts over a trailing window ending now.
pub trait HistoryStore: Send + Sync {
    fn execution_stats(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<ExecutionStats, ProviderError>;

    fn violation_stats(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<ViolationStats, ProviderError>;
}

/// What happened, as recorded in the history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HistoryKind {
    Execution { success: bool },
    SandboxViolation,
    PolicyDenial,
    HumanFlag { note: String },
}

/// One entry of the in-memory history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub capability_id: String,
    pub action_id: String,
    pub at: DateTime<Utc>,
    pub kind: HistoryKind,
}

const DEFAULT_RETENTION_DAYS: u32 = 90;

/// In-memory history. Keys match exactly; the wildcard action is its own
/// bucket.
pub struct InMemoryHistory {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<HistoryEntry>>,
    retention_days: AtomicU32,
    unavailable: Mutex<bool>,
}

impl InMemoryHistory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
            retention_days: AtomicU32::new(DEFAULT_RETENTION_DAYS),
            unavailable: Mutex::new(false),
        }
    }

    /// Keep `days` of history. A query over a longer window raises it.
    pub fn with_retention_days(self, days: u32) -> Self {
        self.retention_days.store(days, Ordering::SeqCst);
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days.load(Ordering::SeqCst)
    }

    pub fn record(&self, capability_id: &str, action_id: &str, kind: HistoryKind) {
        let now = self.clock.now();
        let entry = HistoryEntry {
            capability_id: capability_id.to_string(),
            action_id: action_id.to_string(),
            at: now,
            kind,
        };
        let cutoff = now - Duration::days(i64::from(self.retention_days()));
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|e| e.at >= cutoff);
        entries.push(entry);
    }

    pub fn record_execution(&self, capability_id: &str, action_id: &str, success: bool) {
        self.record(capability_id, action_id, HistoryKind::Execution { success });
    }

    pub fn record_sandbox_violation(&self, capability_id: &str, action_id: &str) {
        self.record(capability_id, action_id, HistoryKind::SandboxViolation);
    }

    pub fn record_policy_denial(&self, capability_id: &str, action_id: &str) {
        self.record(capability_id, action_id, HistoryKind::PolicyDenial);
    }

    /// A human marked the capability as misbehaving.
    pub fn flag(&self, capability_id: &str, action_id: &str, note: impl Into<String>) {
        self.record(
            capability_id,
            action_id,
            HistoryKind::HumanFlag { note: note.into() },
        );
    }

    /// Make every query fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) = unavailable;
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn window(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<Vec<HistoryEntry>, ProviderError> {
        if *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ProviderError::Unavailable(
                "history store is unavailable".to_string(),
            ));
        }
        self.retention_days.fetch_max(window_days, Ordering::SeqCst);
        let now = self.clock.now();
        let since = now - Duration::days(i64::from(window_days));
        let mut entries: Vec<HistoryEntry> = self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.capability_id == capability_id && e.action_id == action_id)
            .filter(|e| e.at >= since && e.at <= now)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }
}

impl HistoryStore for InMemoryHistory {
    fn execution_stats(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<ExecutionStats, ProviderError> {
        let mut stats = ExecutionStats::default();
        for entry in self.window(capability_id, action_id, window_days)? {
            if let HistoryKind::Execution { success } = entry.kind {
                stats.total += 1;
                if success {
                    stats.successes += 1;
                    stats.trailing_failures = 0;
                } else {
                    stats.failures += 1;
                    stats.trailing_failures += 1;
                }
            }
        }
        Ok(stats)
    }

    fn violation_stats(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<ViolationStats, ProviderError> {
        let mut stats = ViolationStats::default();
        for entry in self.window(capability_id, action_id, window_days)? {
            match entry.kind {
                HistoryKind::SandboxViolation => stats.sandbox_violations += 1,
                HistoryKind::PolicyDenial => stats.policy_denials += 1,
                HistoryKind::HumanFlag { .. } => stats.human_flags += 1,
                HistoryKind::Execution { .. } => {}
            }
        }
        Ok(stats)
    }
}

impl InvocationObserver for InMemoryHistory {
    /// Only blacklist denials count as policy violations. Other gates reject
    /// malformed or unapproved requests, which says nothing about the
    /// capability itself.
    fn on_denied(&self, invocation: &Invocation, decision: &PolicyDecision) {
        if decision.denied_by(Gate::Policy) {
            self.record_policy_denial(&invocation.tool_id, &invocation.action_id);
        }
    }

    fn on_executed(&self, invocation: &Invocation, result: &ExecutionResult) {
        if result.backend_unavailable {
            return;
        }
        self.record_execution(&invocation.tool_id, &invocation.action_id, result.success);
        if result.sandbox_violation {
            self.record_sandbox_violation(&invocation.tool_id, &invocation.action_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta_trust::ManualClock;

    fn history() -> (Arc<ManualClock>, InMemoryHistory) {
        let clock = Arc::new(ManualClock::default());
        let history = InMemoryHistory::new(clock.clone());
        (clock, history)
    }

    #[test]
    fn trailing_failures_reset_on_success() {
        let (_, h) = history();
        for success in [false, false, true, false, false, false] {
            h.record_execution("web.fetch", "get", success);
        }
        let stats = h.execution_stats("web.fetch", "get", 30).unwrap();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 5);
        assert_eq!(stats.trailing_failures, 3);
        assert!((stats.success_rate().unwrap() - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn window_excludes_old_entries() {
        let (clock, h) = history();
        h.record_sandbox_violation("web.fetch", "get");
        h.record_execution("web.fetch", "get", false);
        clock.advance(Duration::days(31));
        h.record_policy_denial("web.fetch", "get");
        h.flag("web.fetch", "get", "sent email to the wrong list");

        let violations = h.violation_stats("web.fetch", "get", 30).unwrap();
        assert_eq!(violations.sandbox_violations, 0);
        assert_eq!(violations.policy_denials, 1);
        assert_eq!(violations.human_flags, 1);
        assert_eq!(violations.total(), 2);
        assert_eq!(h.execution_stats("web.fetch", "get", 30).unwrap().total, 0);
        assert_eq!(h.execution_stats("web.fetch", "get", 60).unwrap().total, 1);
    }

    #[test]
    fn entries_past_retention_are_dropped() {
        let clock = Arc::new(ManualClock::default());
        let h = InMemoryHistory::new(clock.clone()).with_retention_days(7);
        h.record_execution("web.fetch", "get", false);
        clock.advance(Duration::days(8));
        h.record_execution("web.fetch", "get", true);
        assert_eq!(h.entries().len(), 1);

        // Querying a wider window widens what is kept from now on.
        assert_eq!(h.execution_stats("web.fetch", "get", 30).unwrap().total, 1);
        assert_eq!(h.retention_days(), 30);
        clock.advance(Duration::days(20));
        h.record_sandbox_violation("web.fetch", "get");
        assert_eq!(h.entries().len(), 2);
    }

    #[test]
    fn keys_are_independent() {
        let (_, h) = history();
        h.record_execution("web.fetch", "get", true);
        h.record_execution("web.fetch", "*", false);
        assert_eq!(h.execution_stats("web.fetch", "get", 30).unwrap().failures, 0);
        assert_eq!(h.execution_stats("web.fetch", "*", 30).unwrap().failures, 1);
        assert_eq!(h.execution_stats("fs.write", "get", 30).unwrap().total, 0);
    }

    #[test]
    fn unavailable_history_errors() {
        let (_, h) = history();
        h.set_unavailable(true);
        assert!(matches!(
            h.execution_stats("web.fetch", "get", 30),
            Err(ProviderError::Unavailable(_))
        ));
        assert!(h.violation_stats("web.fetch", "get", 30).is_err());
    }

    #[test]
    fn observer_records_outcomes() {
        let (_, h) = history();
        let inv = Invocation::new("web.fetch", "get", "s-1", "alice");

        h.on_executed(
            &inv,
            &ExecutionResult {
                success: false,
                sandbox_violation: true,
                ..Default::default()
            },
        );
        h.on_executed(&inv, &ExecutionResult::backend_unavailable("down"));
        h.on_denied(&inv, &PolicyDecision::deny(Gate::Policy, "blacklisted"));
        h.on_denied(&inv, &PolicyDecision::deny(Gate::Quota, "quota exceeded"));

        let exec = h.execution_stats("web.fetch", "get", 30).unwrap();
        assert_eq!(exec.total, 1);
        assert_eq!(exec.failures, 1);
        let violations = h.violation_stats("web.fetch", "get", 30).unwrap();
        assert_eq!(violations.sandbox_violations, 1);
        assert_eq!(violations.policy_denials, 1);
    }
}
