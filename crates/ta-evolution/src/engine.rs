// engine.rs — The evolution decision engine.
//
// `propose_action` gathers evidence from the tier engine, the trajectory
// engine and the history store, evaluates the three condition sets, and
// persists the selected action as a PROPOSED decision with an expiry. It
// never applies a decision. Humans approve or reject through
// `approve_decision` / `reject_decision`, the only status mutators besides
// expiry. Every status change is conditional on the decision still being
// PROPOSED, so a review and an expiry cannot both land.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use ta_audit::{event_types, AuditLevel, AuditSink};
use ta_trust::{Clock, ProviderError, TierEngine, TrajectoryEngine};

use crate::conditions::{evaluate, Evaluation};
use crate::config::EvolutionConfig;
use crate::decision::{DecisionStatus, EvolutionAction, EvolutionDecision, ReviewRecord};
use crate::error::EvolutionError;
use crate::evidence::{Evidence, TrajectorySnapshot};
use crate::history::HistoryStore;
use crate::review::{ReviewQueue, ReviewRouting};
use crate::store::{DecisionStore, ReviewUpdate};

pub struct EvolutionEngine {
    tiers: Arc<TierEngine>,
    trajectory: Arc<TrajectoryEngine>,
    history: Arc<dyn HistoryStore>,
    store: Arc<dyn DecisionStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    review_queue: Option<Arc<dyn ReviewQueue>>,
    config: EvolutionConfig,
}

impl EvolutionEngine {
    pub fn new(
        tiers: Arc<TierEngine>,
        trajectory: Arc<TrajectoryEngine>,
        history: Arc<dyn HistoryStore>,
        store: Arc<dyn DecisionStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: EvolutionConfig,
    ) -> Self {
        Self {
            tiers,
            trajectory,
            history,
            store,
            clock,
            audit,
            review_queue: None,
            config,
        }
    }

    /// Without a queue, submitting PROMOTE or REVOKE fails.
    pub fn with_review_queue(mut self, queue: Arc<dyn ReviewQueue>) -> Self {
        self.review_queue = Some(queue);
        self
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Collect the current evidence for a key. The risk provider is
    /// consulted once, through the tier engine; history failures are
    /// returned.
    pub fn gather_evidence(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<Evidence, EvolutionError> {
        let (risk, tier) = self.tiers.assess(capability_id, action_id)?;
        let trajectory = self.trajectory.get_trajectory_info(capability_id, action_id)?;
        let window_days = self.config.window_days;
        let executions = self
            .history
            .execution_stats(capability_id, action_id, window_days)
            .map_err(EvolutionError::History)?;
        let violations = self
            .history
            .violation_stats(capability_id, action_id, window_days)
            .map_err(EvolutionError::History)?;

        Ok(Evidence {
            capability_id: capability_id.to_string(),
            action_id: action_id.to_string(),
            risk,
            tier,
            trajectory: TrajectorySnapshot::from(&trajectory),
            executions,
            violations,
            window_days,
            gathered_at: self.clock.now(),
        })
    }

    /// Evaluate evidence with this engine's condition sets.
    pub fn evaluate(&self, evidence: &Evidence) -> Evaluation {
        evaluate(evidence, &self.config)
    }

    /// Gather evidence, select an action, and persist it as PROPOSED.
    pub fn propose_action(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<EvolutionDecision, EvolutionError> {
        let evidence = self.gather_evidence(capability_id, action_id)?;
        let evaluation = self.evaluate(&evidence);
        let decision = EvolutionDecision::propose(
            evidence,
            &evaluation,
            self.clock.now(),
            Duration::hours(i64::from(self.config.expiry_hours)),
        );
        self.store.insert(&decision)?;

        tracing::info!(
            decision_id = %decision.decision_id,
            capability_id = %capability_id,
            action_id = %action_id,
            action = %decision.action,
            "evolution decision proposed"
        );
        let level = if decision.action == EvolutionAction::Revoke {
            AuditLevel::Warning
        } else {
            AuditLevel::Info
        };
        self.audit.emit(
            event_types::EVOLUTION_PROPOSED,
            serde_json::json!({
                "decision_id": decision.decision_id,
                "capability_id": decision.capability_id,
                "action_id": decision.action_id,
                "action": decision.action,
                "review_level": decision.review_level,
                "risk_score": decision.risk_score,
                "trust_tier": decision.trust_tier,
                "trust_trajectory": decision.trust_trajectory,
                "causal_chain": decision.causal_chain,
                "expires_at": decision.expires_at,
            }),
            level,
        );
        Ok(decision)
    }

    pub fn get_decision(&self, decision_id: Uuid) -> Result<EvolutionDecision, EvolutionError> {
        self.store
            .get(decision_id)?
            .ok_or(EvolutionError::NotFound(decision_id))
    }

    /// Every decision, newest first.
    pub fn list_decisions(&self) -> Result<Vec<EvolutionDecision>, EvolutionError> {
        self.store.list()
    }

    /// Route a PROPOSED decision. PROMOTE and REVOKE go to the review queue;
    /// FREEZE and NONE are answered without contacting it. A queue failure
    /// leaves the decision PROPOSED.
    pub fn submit_for_review(
        &self,
        decision_id: Uuid,
        timeout_hours: u32,
    ) -> Result<ReviewRouting, EvolutionError> {
        let decision = self.actionable(decision_id)?;
        match decision.action {
            EvolutionAction::None => return Ok(ReviewRouting::NoActionRequired),
            EvolutionAction::Freeze => return Ok(ReviewRouting::AutoApplicable),
            EvolutionAction::Promote | EvolutionAction::Revoke => {}
        }

        let queue = self.review_queue.as_ref().ok_or_else(|| {
            EvolutionError::ReviewQueue(ProviderError::Unavailable(
                "no review queue configured".to_string(),
            ))
        })?;
        let review_id = queue
            .submit_for_review(&decision, timeout_hours)
            .map_err(|e| {
                tracing::warn!(decision_id = %decision_id, "review submission failed: {}", e);
                EvolutionError::ReviewQueue(e)
            })?;

        self.store.update_review(
            decision_id,
            DecisionStatus::Proposed,
            ReviewUpdate {
                status: DecisionStatus::Proposed,
                review: None,
                review_id: Some(review_id.clone()),
            },
        )?;
        tracing::info!(decision_id = %decision_id, review_id = %review_id, "decision submitted for review");
        self.audit.emit(
            event_types::EVOLUTION_SUBMITTED,
            serde_json::json!({
                "decision_id": decision_id,
                "capability_id": decision.capability_id,
                "action_id": decision.action_id,
                "action": decision.action,
                "review_id": review_id,
                "timeout_hours": timeout_hours,
            }),
            AuditLevel::Info,
        );
        Ok(ReviewRouting::Submitted { review_id })
    }

    pub fn approve_decision(
        &self,
        decision_id: Uuid,
        approver: &str,
        note: Option<&str>,
    ) -> Result<EvolutionDecision, EvolutionError> {
        self.review(decision_id, approver, note, DecisionStatus::Approved)
    }

    pub fn reject_decision(
        &self,
        decision_id: Uuid,
        approver: &str,
        note: Option<&str>,
    ) -> Result<EvolutionDecision, EvolutionError> {
        self.review(decision_id, approver, note, DecisionStatus::Rejected)
    }

    /// Mark every PROPOSED decision past its expiry as EXPIRED. Returns how
    /// many were expired. A decision reviewed in the meantime is left alone.
    pub fn expire_stale(&self) -> Result<usize, EvolutionError> {
        let now = self.clock.now();
        let mut expired = 0;
        for decision in self.store.list_by_status(DecisionStatus::Proposed)? {
            if !decision.is_expired(now) {
                continue;
            }
            match self.mark_expired(&decision) {
                Ok(()) => expired += 1,
                Err(EvolutionError::InvalidStatus { status, .. }) => {
                    tracing::debug!(decision_id = %decision.decision_id, status = %status, "decision reviewed before it could expire");
                }
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            tracing::info!(count = expired, "expired stale evolution decisions");
        }
        Ok(expired)
    }

    fn review(
        &self,
        decision_id: Uuid,
        approver: &str,
        note: Option<&str>,
        status: DecisionStatus,
    ) -> Result<EvolutionDecision, EvolutionError> {
        if approver.trim().is_empty() {
            return Err(EvolutionError::MissingApprover);
        }
        let decision = self.actionable(decision_id)?;
        let review = ReviewRecord {
            reviewer: approver.to_string(),
            reviewed_at: self.clock.now(),
            note: note.map(str::to_string),
        };
        let updated = self.store.update_review(
            decision_id,
            DecisionStatus::Proposed,
            ReviewUpdate {
                status,
                review: Some(review),
                review_id: None,
            },
        )?;

        tracing::info!(
            decision_id = %decision_id,
            action = %decision.action,
            status = %status,
            reviewer = %approver,
            "evolution decision reviewed"
        );
        self.audit.emit(
            event_types::EVOLUTION_REVIEWED,
            serde_json::json!({
                "decision_id": decision_id,
                "capability_id": decision.capability_id,
                "action_id": decision.action_id,
                "action": decision.action,
                "status": status,
                "reviewer": approver,
                "note": note,
            }),
            AuditLevel::Info,
        );
        Ok(updated)
    }

    /// Load a decision that can still be submitted or reviewed. An expired
    /// one is marked EXPIRED on the way out.
    fn actionable(&self, decision_id: Uuid) -> Result<EvolutionDecision, EvolutionError> {
        let decision = self.get_decision(decision_id)?;
        if decision.status != DecisionStatus::Proposed {
            return Err(EvolutionError::InvalidStatus {
                decision_id,
                status: decision.status,
                expected: DecisionStatus::Proposed,
            });
        }
        let now = self.clock.now();
        if decision.is_expired(now) {
            self.mark_expired(&decision)?;
            return Err(expired_error(&decision));
        }
        Ok(decision)
    }

    fn mark_expired(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError> {
        self.store.update_review(
            decision.decision_id,
            DecisionStatus::Proposed,
            ReviewUpdate::status(DecisionStatus::Expired),
        )?;
        tracing::info!(decision_id = %decision.decision_id, "evolution decision expired");
        self.audit.emit(
            event_types::EVOLUTION_EXPIRED,
            serde_json::json!({
                "decision_id": decision.decision_id,
                "capability_id": decision.capability_id,
                "action_id": decision.action_id,
                "action": decision.action,
                "expires_at": decision.expires_at,
            }),
            AuditLevel::Info,
        );
        Ok(())
    }
}

fn expired_error(decision: &EvolutionDecision) -> EvolutionError {
    EvolutionError::DecisionExpired {
        decision_id: decision.decision_id,
        expired_at: decision.expires_at.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ta_audit::RecordingSink;
    use ta_trust::{
        FixedRiskProvider, ManualClock, MemoryTrustStore, TierConfig, TrajectoryConfig, TrustEvent,
        TrustState,
    };

    use crate::history::InMemoryHistory;
    use crate::review::InMemoryReviewQueue;
    use crate::store::MemoryDecisionStore;

    /// Memory store with a slow `get`, and an optional review that lands
    /// right after `list` takes its snapshot.
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryDecisionStore,
        get_delay: Option<std::time::Duration>,
        review_after_list: Mutex<Option<(Uuid, ReviewUpdate)>>,
    }

    impl DecisionStore for ContendedStore {
        fn insert(&self, decision: &EvolutionDecision) -> Result<(), EvolutionError> {
            self.inner.insert(decision)
        }

        fn get(&self, decision_id: Uuid) -> Result<Option<EvolutionDecision>, EvolutionError> {
            let decision = self.inner.get(decision_id)?;
            if let Some(delay) = self.get_delay {
                std::thread::sleep(delay);
            }
            Ok(decision)
        }

        fn update_review(
            &self,
            decision_id: Uuid,
            expected: DecisionStatus,
            update: ReviewUpdate,
        ) -> Result<EvolutionDecision, EvolutionError> {
            self.inner.update_review(decision_id, expected, update)
        }

        fn list(&self) -> Result<Vec<EvolutionDecision>, EvolutionError> {
            let snapshot = self.inner.list()?;
            if let Some((id, update)) = self.review_after_list.lock().unwrap().take() {
                self.inner
                    .update_review(id, DecisionStatus::Proposed, update)
                    .unwrap();
            }
            Ok(snapshot)
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        risk: Arc<FixedRiskProvider>,
        trajectory: Arc<TrajectoryEngine>,
        history: Arc<InMemoryHistory>,
        queue: Arc<InMemoryReviewQueue>,
        audit: Arc<RecordingSink>,
        engine: EvolutionEngine,
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryDecisionStore::new()))
    }

    fn harness_with_store(decisions: Arc<dyn DecisionStore>) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryTrustStore::new());
        let risk = Arc::new(FixedRiskProvider::new(10.0));
        let audit = Arc::new(RecordingSink::new());
        let tiers = Arc::new(TierEngine::new(
            risk.clone(),
            store.clone(),
            clock.clone(),
            audit.clone(),
            TierConfig::default(),
        ));
        let trajectory = Arc::new(TrajectoryEngine::new(
            store,
            clock.clone(),
            audit.clone(),
            TrajectoryConfig::default(),
        ));
        let history = Arc::new(InMemoryHistory::new(clock.clone()));
        let queue = Arc::new(InMemoryReviewQueue::new());
        let engine = EvolutionEngine::new(
            tiers,
            trajectory.clone(),
            history.clone(),
            decisions,
            clock.clone(),
            audit.clone(),
            EvolutionConfig::default(),
        )
        .with_review_queue(queue.clone());
        Harness {
            clock,
            risk,
            trajectory,
            history,
            queue,
            audit,
            engine,
        }
    }

    fn succeed(h: &Harness, n: usize) {
        for _ in 0..n {
            h.trajectory
                .record_event("web.fetch", "get", TrustEvent::Success, None, None)
                .unwrap();
            h.history.record_execution("web.fetch", "get", true);
        }
    }

    #[test]
    fn untracked_key_proposes_none() {
        let h = harness();
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        assert_eq!(d.action, EvolutionAction::None);
        assert_eq!(d.trust_trajectory, TrustState::Earning);
        assert!(!d.unmet_reasons.is_empty());
        assert_eq!(d.causal_chain.len(), 6);
        assert_eq!(
            h.engine.submit_for_review(d.decision_id, 24).unwrap(),
            ReviewRouting::NoActionRequired
        );
        assert!(h.queue.queued().is_empty());
    }

    #[test]
    fn clean_earning_record_proposes_promote() {
        let h = harness();
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        assert_eq!(d.action, EvolutionAction::Promote);
        assert_eq!(d.status, DecisionStatus::Proposed);
        assert_eq!(d.expires_at - d.created_at, Duration::days(7));

        let proposed = h.audit.events_of_type(event_types::EVOLUTION_PROPOSED);
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].level, AuditLevel::Info);
        assert_eq!(h.engine.get_decision(d.decision_id).unwrap(), d);
    }

    #[test]
    fn high_tier_blocks_promotion() {
        let h = harness();
        h.risk.set_score("web.fetch", "get", 85.0);
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        assert_eq!(d.action, EvolutionAction::None);
        assert!(d.unmet_reasons.iter().any(|r| r.contains("tier HIGH")));
    }

    #[test]
    fn sandbox_violations_propose_revoke_at_warning_level() {
        let h = harness();
        succeed(&h, 10);
        h.history.record_sandbox_violation("web.fetch", "get");
        h.history.record_sandbox_violation("web.fetch", "get");
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        assert_eq!(d.action, EvolutionAction::Revoke);
        assert!(d.explanation.starts_with("Triggering violations:\n- sandbox violations 2 > 1"));
        let proposed = h.audit.events_of_type(event_types::EVOLUTION_PROPOSED);
        assert_eq!(proposed[0].level, AuditLevel::Warning);
    }

    #[test]
    fn high_risk_events_propose_freeze() {
        let h = harness();
        for _ in 0..2 {
            h.trajectory
                .record_event("web.fetch", "get", TrustEvent::HighRisk, Some(90.0), None)
                .unwrap();
        }
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        assert_eq!(d.action, EvolutionAction::Freeze);
        assert_eq!(
            h.engine.submit_for_review(d.decision_id, 24).unwrap(),
            ReviewRouting::AutoApplicable
        );
    }

    #[test]
    fn history_failure_writes_nothing() {
        let h = harness();
        h.history.set_unavailable(true);
        assert!(matches!(
            h.engine.propose_action("web.fetch", "get"),
            Err(EvolutionError::History(_))
        ));
        assert!(h.engine.list_decisions().unwrap().is_empty());
        assert!(h.audit.events_of_type(event_types::EVOLUTION_PROPOSED).is_empty());
    }

    #[test]
    fn submit_then_approve() {
        let h = harness();
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();

        let routing = h.engine.submit_for_review(d.decision_id, 48).unwrap();
        let review_id = match routing {
            ReviewRouting::Submitted { review_id } => review_id,
            other => panic!("unexpected routing {:?}", other),
        };
        let queued = h.queue.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].timeout_hours, 48);
        assert_eq!(
            h.engine.get_decision(d.decision_id).unwrap().review_id,
            Some(review_id)
        );

        assert!(matches!(
            h.engine.approve_decision(d.decision_id, "  ", None),
            Err(EvolutionError::MissingApprover)
        ));

        h.clock.advance(Duration::hours(2));
        let approved = h
            .engine
            .approve_decision(d.decision_id, "carol", Some("earned it"))
            .unwrap();
        assert_eq!(approved.status, DecisionStatus::Approved);
        let review = approved.review.clone().unwrap();
        assert_eq!(review.reviewer, "carol");
        assert_eq!(review.reviewed_at, h.clock.now());
        assert!(!approved.is_void());
        assert_eq!(approved.explanation, d.explanation);

        assert!(matches!(
            h.engine.reject_decision(d.decision_id, "dave", None),
            Err(EvolutionError::InvalidStatus { .. })
        ));
        assert_eq!(h.audit.events_of_type(event_types::EVOLUTION_REVIEWED).len(), 1);
        assert_eq!(h.audit.events_of_type(event_types::EVOLUTION_SUBMITTED).len(), 1);
    }

    #[test]
    fn queue_failure_leaves_decision_proposed() {
        let h = harness();
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        h.queue.set_unavailable(true);
        assert!(matches!(
            h.engine.submit_for_review(d.decision_id, 24),
            Err(EvolutionError::ReviewQueue(_))
        ));
        let stored = h.engine.get_decision(d.decision_id).unwrap();
        assert_eq!(stored.status, DecisionStatus::Proposed);
        assert!(stored.review_id.is_none());
    }

    #[test]
    fn reviewing_after_expiry_marks_expired() {
        let h = harness();
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        h.clock.advance(Duration::days(8));

        assert!(matches!(
            h.engine.approve_decision(d.decision_id, "carol", None),
            Err(EvolutionError::DecisionExpired { .. })
        ));
        let stored = h.engine.get_decision(d.decision_id).unwrap();
        assert_eq!(stored.status, DecisionStatus::Expired);
        assert!(stored.is_void());
        assert_eq!(h.audit.events_of_type(event_types::EVOLUTION_EXPIRED).len(), 1);
    }

    #[test]
    fn expire_stale_only_touches_old_proposals() {
        let h = harness();
        let old = h.engine.propose_action("web.fetch", "get").unwrap();
        let reviewed = h.engine.propose_action("web.fetch", "get").unwrap();
        h.engine
            .reject_decision(reviewed.decision_id, "carol", None)
            .unwrap();
        h.clock.advance(Duration::days(6));
        let fresh = h.engine.propose_action("web.fetch", "get").unwrap();
        h.clock.advance(Duration::days(2));

        assert_eq!(h.engine.expire_stale().unwrap(), 1);
        assert_eq!(
            h.engine.get_decision(old.decision_id).unwrap().status,
            DecisionStatus::Expired
        );
        assert_eq!(
            h.engine.get_decision(reviewed.decision_id).unwrap().status,
            DecisionStatus::Rejected
        );
        assert_eq!(
            h.engine.get_decision(fresh.decision_id).unwrap().status,
            DecisionStatus::Proposed
        );
        assert_eq!(h.engine.expire_stale().unwrap(), 0);
    }

    #[test]
    fn concurrent_approve_and_reject_land_exactly_once() {
        let h = harness_with_store(Arc::new(ContendedStore {
            get_delay: Some(std::time::Duration::from_millis(100)),
            ..Default::default()
        }));
        succeed(&h, 10);
        let d = h.engine.propose_action("web.fetch", "get").unwrap();

        let (approve, reject) = std::thread::scope(|scope| {
            let approve = scope.spawn(|| h.engine.approve_decision(d.decision_id, "carol", None));
            let reject = scope.spawn(|| h.engine.reject_decision(d.decision_id, "dave", None));
            (approve.join().unwrap(), reject.join().unwrap())
        });

        assert!(approve.is_ok() != reject.is_ok());
        let winner = approve.as_ref().or(reject.as_ref()).unwrap();
        let loser = if approve.is_ok() { &reject } else { &approve };
        assert!(matches!(loser, Err(EvolutionError::InvalidStatus { .. })));
        assert_eq!(
            h.engine.get_decision(d.decision_id).unwrap().status,
            winner.status
        );
        assert_eq!(h.audit.events_of_type(event_types::EVOLUTION_REVIEWED).len(), 1);
    }

    #[test]
    fn expire_stale_skips_a_decision_approved_meanwhile() {
        let store = Arc::new(ContendedStore::default());
        let h = harness_with_store(store.clone());
        let d = h.engine.propose_action("web.fetch", "get").unwrap();
        h.clock.advance(Duration::days(8));

        *store.review_after_list.lock().unwrap() = Some((
            d.decision_id,
            ReviewUpdate {
                status: DecisionStatus::Approved,
                review: Some(ReviewRecord {
                    reviewer: "carol".to_string(),
                    reviewed_at: d.created_at + Duration::hours(1),
                    note: None,
                }),
                review_id: None,
            },
        ));

        assert_eq!(h.engine.expire_stale().unwrap(), 0);
        let stored = h.engine.get_decision(d.decision_id).unwrap();
        assert_eq!(stored.status, DecisionStatus::Approved);
        assert!(!stored.is_void());
        assert!(h.audit.events_of_type(event_types::EVOLUTION_EXPIRED).is_empty());
    }

    #[test]
    fn invalid_key_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.engine.propose_action("", "get"),
            Err(EvolutionError::Trust(_))
        ));
    }
}
