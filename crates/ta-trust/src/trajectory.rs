// trajectory.rs — The trust trajectory engine.
//
// Each (capability, action) key carries a TrustStateRecord that moves around
// the EARNING → STABLE → DEGRADING → EARNING cycle as execution outcomes are
// reported. `record_event` updates the counters, evaluates the rules for the
// current state in priority order, and on the first match commits the
// transition and resets every counter.
//
// The rule set is loaded from the store once and cached until
// `invalidate_rules_cache` is called. When the store holds no rules the
// defaults derived from `TrajectoryThresholds` are used.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ta_audit::{event_types, AuditLevel, AuditSink, NullSink};

use crate::clock::{Clock, ManualClock};
use crate::config::{InertiaWeights, TrajectoryConfig};
use crate::error::TrustError;
use crate::locks::KeyLocks;
use crate::rules::{default_rules, select_rule, RuleOutcome, TrajectoryRule};
use crate::state::{TransitionEdge, TrustEvent, TrustKey, TrustState, TrustStateRecord, TrustTransition};
use crate::store::{MemoryTrustStore, TrustStore};

/// Transitions included in `TrajectoryInfo::recent_transitions`.
const RECENT_TRANSITIONS: usize = 10;

/// One week, the dwell time at which the time component of inertia saturates.
const INERTIA_HORIZON_HOURS: f64 = 168.0;

/// Read-only view of a key's trajectory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryInfo {
    pub capability_id: String,
    pub action_id: String,
    pub state: TrustState,
    /// False when no event has been recorded for the key yet.
    pub tracked: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub policy_rejections: u32,
    pub high_risk_events: u32,
    pub state_entered_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub time_in_state_hours: f64,
    /// Explanatory resistance to change, in [0, 1].
    pub inertia_score: f64,
    /// Most recent transitions, oldest first.
    pub recent_transitions: Vec<TrustTransition>,
}

/// Result of `record_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub state: TrustState,
    pub transition: Option<TrustTransition>,
}

/// One event fed to `simulate_trajectory`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatedEvent {
    pub event: TrustEvent,
    /// When the event happens; defaults to the previous event's time.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub risk_score: Option<f64>,
}

impl SimulatedEvent {
    pub fn new(event: TrustEvent) -> Self {
        Self {
            event,
            at: None,
            risk_score: None,
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}

/// State after one simulated event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationStep {
    pub index: usize,
    pub event: TrustEvent,
    pub at: DateTime<Utc>,
    pub state: TrustState,
    pub transition: Option<TrustTransition>,
}

/// `time * min(hours / 168, 1) + success * successes / total_events`,
/// clamped to [0, 1].
pub fn inertia_score(record: &TrustStateRecord, now: DateTime<Utc>, weights: &InertiaWeights) -> f64 {
    let time_part = (record.hours_in_state(now) / INERTIA_HORIZON_HOURS).min(1.0);
    let total = u64::from(record.consecutive_successes)
        + u64::from(record.consecutive_failures)
        + u64::from(record.policy_rejections)
        + u64::from(record.high_risk_events);
    let success_ratio = if total == 0 {
        0.0
    } else {
        record.consecutive_successes as f64 / total as f64
    };
    (weights.time * time_part + weights.success * success_ratio).clamp(0.0, 1.0)
}

/// Builds the human-readable explanation of a transition.
fn explain_transition(
    rule: &TrajectoryRule,
    outcome: &RuleOutcome,
    edge: TransitionEdge,
    trigger: TrustEvent,
    hours_in_state: f64,
) -> String {
    let conditions = outcome
        .fired()
        .iter()
        .map(|c| c.describe())
        .collect::<Vec<_>>()
        .join(", ");
    match (edge.from(), edge.to()) {
        (TrustState::Earning, TrustState::Stable) => format!(
            "Promoted from EARNING to STABLE by rule '{}' after {:.1}h of evidence: {}. \
             Trust is established; counters reset.",
            rule.rule_id, hours_in_state, conditions
        ),
        (TrustState::Stable, TrustState::Degrading) => format!(
            "Degraded from STABLE to DEGRADING by rule '{}' on a {} event: {}. \
             Trust must be re-earned.",
            rule.rule_id, trigger, conditions
        ),
        _ => format!(
            "Recovering from DEGRADING to EARNING by rule '{}' after {:.1}h: {}. \
             The capability must earn STABLE again.",
            rule.rule_id, hours_in_state, conditions
        ),
    }
}

/// Apply one event to one key against `store`. Shared by live recording and
/// simulation so both follow exactly the same path.
#[allow(clippy::too_many_arguments)]
fn apply_event(
    store: &dyn TrustStore,
    audit: &dyn AuditSink,
    rules: &[TrajectoryRule],
    key: &TrustKey,
    event: TrustEvent,
    now: DateTime<Utc>,
    risk_score: Option<f64>,
    policy_decision: Option<serde_json::Value>,
) -> Result<EventOutcome, TrustError> {
    let mut record = match store.load_state(key)? {
        Some(record) => record,
        None => TrustStateRecord::new(key, now),
    };
    record.apply_event(event, now);

    let Some((rule, outcome)) = select_rule(rules, &record, now) else {
        store.save_state(&record)?;
        return Ok(EventOutcome {
            state: record.current_state,
            transition: None,
        });
    };

    let edge = rule.edge()?;
    let hours = record.hours_in_state(now);
    let explain = explain_transition(rule, &outcome, edge, event, hours);
    let risk_context = serde_json::json!({
        "risk_score": risk_score,
        "consecutive_successes": record.consecutive_successes,
        "consecutive_failures": record.consecutive_failures,
        "policy_rejections": record.policy_rejections,
        "high_risk_events": record.high_risk_events,
        "time_in_state_hours": hours,
    });

    record.enter(edge, now)?;
    let transition = TrustTransition::new(
        key,
        edge,
        event,
        rule.rule_id.clone(),
        explain,
        risk_context,
        policy_decision,
        now,
    );
    store.commit_transition(&record, &transition)?;

    tracing::info!(
        capability_id = %key.capability_id,
        action_id = %key.action_id,
        from = %edge.from(),
        to = %edge.to(),
        rule_id = %rule.rule_id,
        "trust state transition"
    );
    let level = if edge.to() == TrustState::Degrading {
        AuditLevel::Warning
    } else {
        AuditLevel::Info
    };
    audit.emit(
        event_types::TRUST_TRANSITION,
        serde_json::json!({
            "capability_id": key.capability_id,
            "action_id": key.action_id,
            "transition_id": transition.transition_id,
            "old_state": transition.old_state,
            "new_state": transition.new_state,
            "trigger_event": transition.trigger_event,
            "rule_id": transition.rule_id,
            "explain": transition.explain,
        }),
        level,
    );

    Ok(EventOutcome {
        state: record.current_state,
        transition: Some(transition),
    })
}

/// Per-key trust state machine.
pub struct TrajectoryEngine {
    store: Arc<dyn TrustStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: TrajectoryConfig,
    rules: RwLock<Option<Arc<Vec<TrajectoryRule>>>>,
    locks: KeyLocks,
}

impl TrajectoryEngine {
    pub fn new(
        store: Arc<dyn TrustStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: TrajectoryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            config,
            rules: RwLock::new(None),
            locks: KeyLocks::default(),
        }
    }

    pub fn config(&self) -> &TrajectoryConfig {
        &self.config
    }

    /// The active rule set, loading it on first use.
    pub fn rules(&self) -> Result<Arc<Vec<TrajectoryRule>>, TrustError> {
        if let Some(rules) = self.rules.read()?.as_ref() {
            return Ok(Arc::clone(rules));
        }
        let mut cache = self.rules.write()?;
        if let Some(rules) = cache.as_ref() {
            return Ok(Arc::clone(rules));
        }
        let mut loaded = self.store.load_rules()?;
        if loaded.is_empty() {
            loaded = default_rules(&self.config.thresholds);
        }
        tracing::debug!(count = loaded.len(), "loaded trajectory rules");
        let rules = Arc::new(loaded);
        *cache = Some(Arc::clone(&rules));
        Ok(rules)
    }

    /// Drop the cached rule set; the next event reloads it from the store.
    pub fn invalidate_rules_cache(&self) -> Result<(), TrustError> {
        *self.rules.write()? = None;
        Ok(())
    }

    /// Persist a new rule set and invalidate the cache. Every rule must name
    /// an edge of the cycle.
    pub fn replace_rules(&self, rules: Vec<TrajectoryRule>) -> Result<(), TrustError> {
        for rule in &rules {
            rule.edge()?;
        }
        self.store.save_rules(&rules)?;
        self.invalidate_rules_cache()
    }

    /// Current state; EARNING for keys never seen.
    pub fn get_current_state(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<TrustState, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        Ok(self
            .store
            .load_state(&key)?
            .map(|r| r.current_state)
            .unwrap_or(TrustState::Earning))
    }

    /// Full read-only view of a key. Untracked keys report a fresh EARNING
    /// record without creating one.
    pub fn get_trajectory_info(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<TrajectoryInfo, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        let now = self.clock.now();
        let stored = self.store.load_state(&key)?;
        let tracked = stored.is_some();
        let record = stored.unwrap_or_else(|| TrustStateRecord::new(&key, now));

        let mut recent = self.store.transitions(&key)?;
        if recent.len() > RECENT_TRANSITIONS {
            recent.drain(..recent.len() - RECENT_TRANSITIONS);
        }

        Ok(TrajectoryInfo {
            capability_id: key.capability_id.clone(),
            action_id: key.action_id.clone(),
            state: record.current_state,
            tracked,
            consecutive_successes: record.consecutive_successes,
            consecutive_failures: record.consecutive_failures,
            policy_rejections: record.policy_rejections,
            high_risk_events: record.high_risk_events,
            state_entered_at: record.state_entered_at,
            last_event_at: record.last_event_at,
            time_in_state_hours: record.hours_in_state(now),
            inertia_score: inertia_score(&record, now, &self.config.inertia),
            recent_transitions: recent,
        })
    }

    /// Record an execution outcome and apply at most one transition.
    pub fn record_event(
        &self,
        capability_id: &str,
        action_id: &str,
        event: TrustEvent,
        risk_score: Option<f64>,
        policy_decision: Option<serde_json::Value>,
    ) -> Result<EventOutcome, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        let rules = self.rules()?;

        let lock = self.locks.for_key(&key)?;
        let _guard = lock.lock()?;

        let now = self.clock.now();
        tracing::debug!(
            capability_id = %key.capability_id,
            action_id = %key.action_id,
            event = %event,
            "recording trust event"
        );
        apply_event(
            self.store.as_ref(),
            self.audit.as_ref(),
            &rules,
            &key,
            event,
            now,
            risk_score,
            policy_decision,
        )
    }

    /// Transitions written for a key, oldest first.
    pub fn transition_history(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<Vec<TrustTransition>, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        self.store.transitions(&key)
    }

    /// Replay `events` against a fresh EARNING record without touching the
    /// live store. Uses the live rule set and the same evaluation path as
    /// `record_event`.
    pub fn simulate_trajectory(
        &self,
        capability_id: &str,
        action_id: &str,
        events: &[SimulatedEvent],
    ) -> Result<Vec<SimulationStep>, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        let rules = self.rules()?;
        let store = MemoryTrustStore::new();
        let clock = ManualClock::new(self.clock.now());

        let mut steps = Vec::with_capacity(events.len());
        for (index, sim) in events.iter().enumerate() {
            if let Some(at) = sim.at {
                clock.set(at);
            }
            let at = clock.now();
            let outcome = apply_event(
                &store,
                &NullSink,
                &rules,
                &key,
                sim.event,
                at,
                sim.risk_score,
                None,
            )?;
            steps.push(SimulationStep {
                index,
                event: sim.event,
                at,
                state: outcome.state,
                transition: outcome.transition,
            });
        }
        Ok(steps)
    }

    /// Register a capability imported from an external source.
    ///
    /// Imports always start in EARNING: the supplied score is recorded in the
    /// audit trail but never grants trust. The wildcard bucket of the
    /// capability is created; a key that is already tracked is refused.
    pub fn bootstrap_from_external_import(
        &self,
        capability_id: &str,
        initial_trust_score: f64,
        source: &str,
    ) -> Result<TrustStateRecord, TrustError> {
        let key = TrustKey::wildcard(capability_id)?;
        let lock = self.locks.for_key(&key)?;
        let _guard = lock.lock()?;

        if self.store.load_state(&key)?.is_some() {
            return Err(TrustError::AlreadyTracked {
                capability_id: key.capability_id,
                action_id: key.action_id,
            });
        }

        let record = TrustStateRecord::new(&key, self.clock.now());
        self.store.save_state(&record)?;

        tracing::info!(
            capability_id = %capability_id,
            source = %source,
            "bootstrapped imported capability in EARNING"
        );
        self.audit.emit(
            event_types::TRUST_BOOTSTRAP,
            serde_json::json!({
                "capability_id": key.capability_id,
                "action_id": key.action_id,
                "state": record.current_state,
                "imported_trust_score": initial_trust_score,
                "source": source,
            }),
            AuditLevel::Info,
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleThresholds;
    use chrono::Duration;
    use ta_audit::RecordingSink;

    struct Harness {
        engine: TrajectoryEngine,
        clock: Arc<ManualClock>,
        audit: Arc<RecordingSink>,
        store: Arc<MemoryTrustStore>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryTrustStore::new());
        let engine = TrajectoryEngine::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
            TrajectoryConfig::default(),
        );
        Harness {
            engine,
            clock,
            audit,
            store,
        }
    }

    fn record(h: &Harness, event: TrustEvent) -> EventOutcome {
        h.engine
            .record_event("web.fetch", "get", event, Some(20.0), None)
            .unwrap()
    }

    /// Drive a fresh key to STABLE.
    fn promote(h: &Harness) {
        record(h, TrustEvent::Success);
        h.clock.advance(Duration::hours(25));
        for _ in 0..9 {
            record(h, TrustEvent::Success);
        }
        assert_eq!(
            h.engine.get_current_state("web.fetch", "get").unwrap(),
            TrustState::Stable
        );
    }

    #[test]
    fn promotion_fires_once_on_tenth_success() {
        let h = harness();
        let first = record(&h, TrustEvent::Success);
        assert_eq!(first.state, TrustState::Earning);
        h.clock.advance(Duration::hours(25));

        let mut transitions = Vec::new();
        for i in 2..=10 {
            let outcome = record(&h, TrustEvent::Success);
            if let Some(t) = outcome.transition {
                transitions.push((i, t));
            }
        }
        assert_eq!(transitions.len(), 1);
        let (at, transition) = &transitions[0];
        assert_eq!(*at, 10);
        assert_eq!(transition.old_state, TrustState::Earning);
        assert_eq!(transition.new_state, TrustState::Stable);
        assert_eq!(transition.rule_id, "earning_to_stable");
        assert!(transition.explain.contains("Promoted"));

        // Counters reset on the transition; ten more successes do nothing.
        for _ in 0..10 {
            assert!(record(&h, TrustEvent::Success).transition.is_none());
        }
        assert_eq!(h.engine.transition_history("web.fetch", "get").unwrap().len(), 1);
        assert_eq!(h.audit.events_of_type(event_types::TRUST_TRANSITION).len(), 1);
    }

    #[test]
    fn no_promotion_without_dwell() {
        let h = harness();
        for _ in 0..20 {
            assert!(record(&h, TrustEvent::Success).transition.is_none());
        }
        let info = h.engine.get_trajectory_info("web.fetch", "get").unwrap();
        assert_eq!(info.state, TrustState::Earning);
        assert_eq!(info.consecutive_successes, 20);
    }

    #[test]
    fn single_exceeded_tolerance_degrades() {
        let h = harness();
        promote(&h);

        assert!(record(&h, TrustEvent::PolicyRejection).transition.is_none());
        let outcome = record(&h, TrustEvent::PolicyRejection);
        let transition = outcome.transition.unwrap();
        assert_eq!(outcome.state, TrustState::Degrading);
        assert_eq!(transition.trigger_event, TrustEvent::PolicyRejection);
        assert!(transition.explain.contains("policy_rejections 2 > 1"));

        let info = h.engine.get_trajectory_info("web.fetch", "get").unwrap();
        assert_eq!(info.policy_rejections, 0);
        let warnings: Vec<_> = h
            .audit
            .events_of_type(event_types::TRUST_TRANSITION)
            .into_iter()
            .filter(|e| e.level == AuditLevel::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn recovery_returns_to_earning() {
        let h = harness();
        promote(&h);
        for _ in 0..3 {
            record(&h, TrustEvent::Failure);
        }
        assert_eq!(
            h.engine.get_current_state("web.fetch", "get").unwrap(),
            TrustState::Degrading
        );

        h.clock.advance(Duration::hours(7));
        let mut last = None;
        for _ in 0..5 {
            last = Some(record(&h, TrustEvent::Success));
        }
        let last = last.unwrap();
        assert_eq!(last.state, TrustState::Earning);
        assert!(last.transition.unwrap().explain.contains("Recovering"));

        let pairs: Vec<_> = h
            .engine
            .transition_history("web.fetch", "get")
            .unwrap()
            .iter()
            .map(|t| (t.old_state, t.new_state))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (TrustState::Earning, TrustState::Stable),
                (TrustState::Stable, TrustState::Degrading),
                (TrustState::Degrading, TrustState::Earning),
            ]
        );
    }

    #[test]
    fn simulation_matches_live_recording_and_leaves_store_alone() {
        let h = harness();
        let start = h.clock.now();
        let mut events = vec![SimulatedEvent::new(TrustEvent::Success).at(start)];
        for _ in 0..9 {
            events.push(SimulatedEvent::new(TrustEvent::Success).at(start + Duration::hours(30)));
        }
        let steps = h.engine.simulate_trajectory("web.fetch", "get", &events).unwrap();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[9].state, TrustState::Stable);
        assert!(steps[..9].iter().all(|s| s.transition.is_none()));

        assert!(!h.engine.get_trajectory_info("web.fetch", "get").unwrap().tracked);
        assert!(h.audit.events().is_empty());
        assert!(h.store.transitions(&TrustKey::new("web.fetch", "get").unwrap()).unwrap().is_empty());
    }

    #[test]
    fn bootstrap_always_earning_and_refuses_overwrite() {
        let h = harness();
        let record = h
            .engine
            .bootstrap_from_external_import("imported.tool", 99.0, "registry")
            .unwrap();
        assert_eq!(record.current_state, TrustState::Earning);
        assert_eq!(record.action_id, "*");

        let again = h
            .engine
            .bootstrap_from_external_import("imported.tool", 99.0, "registry");
        assert!(matches!(again, Err(TrustError::AlreadyTracked { .. })));
        assert_eq!(h.audit.events_of_type(event_types::TRUST_BOOTSTRAP).len(), 1);
    }

    #[test]
    fn wildcard_is_an_independent_bucket() {
        let h = harness();
        h.engine
            .record_event("web.fetch", "*", TrustEvent::Failure, None, None)
            .unwrap();
        let specific = h.engine.get_trajectory_info("web.fetch", "get").unwrap();
        assert!(!specific.tracked);
        assert_eq!(specific.consecutive_failures, 0);
    }

    #[test]
    fn rules_cache_reloads_only_after_invalidation() {
        let h = harness();
        let quick = vec![TrajectoryRule::new(
            "quick",
            TransitionEdge::outgoing(TrustState::Earning),
            1,
            RuleThresholds {
                min_consecutive_successes: Some(1),
                ..Default::default()
            },
        )];
        // Populate the cache with defaults first.
        h.engine.rules().unwrap();
        h.store.save_rules(&quick).unwrap();
        assert!(record(&h, TrustEvent::Success).transition.is_none());

        h.engine.invalidate_rules_cache().unwrap();
        let outcome = record(&h, TrustEvent::Success);
        assert_eq!(outcome.transition.unwrap().rule_id, "quick");
    }

    #[test]
    fn replace_rules_rejects_invalid_edges() {
        let h = harness();
        let bad = TrajectoryRule {
            rule_id: "skip".to_string(),
            from_state: TrustState::Earning,
            to_state: TrustState::Earning,
            priority: 0,
            description: String::new(),
            thresholds: RuleThresholds::default(),
        };
        assert!(matches!(
            h.engine.replace_rules(vec![bad]),
            Err(TrustError::InvalidTransition { .. })
        ));
        assert!(h.store.load_rules().unwrap().is_empty());
    }

    #[test]
    fn inertia_blends_time_and_successes() {
        let key = TrustKey::new("web.fetch", "get").unwrap();
        let start = Utc::now();
        let mut record = TrustStateRecord::new(&key, start);
        let weights = InertiaWeights::default();
        assert_eq!(inertia_score(&record, start, &weights), 0.0);

        record.consecutive_successes = 3;
        record.high_risk_events = 1;
        let week_later = start + Duration::hours(168 * 2);
        let score = inertia_score(&record, week_later, &weights);
        assert!((score - (0.4 + 0.6 * 0.75)).abs() < 1e-9);
    }
}
