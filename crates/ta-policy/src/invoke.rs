// invoke.rs — Governed invocation: gates, context, execution, trust events.
//
// GovernedInvoker strings the pieces together for one call:
//
// 1. Gate chain, admitted with the quota slot reserved. A Policy Gate denial
//    is also reported to the trajectory engine as a policy rejection.
// 2. Context checks. A requires-approval hold is released only by a valid
//    admin token.
// 3. Backend resolution, then today's execution count is reserved against
//    the tier's daily limit.
// 4. Execution on a worker thread, bounded by the timeout. A backend that
//    overruns is abandoned as timed out; its quota slot is released with
//    its runtime once it actually returns.
// 5. Timeout or unavailable backend fails closed as a failed result.
// 6. Success/failure reported to the trajectory engine, plus a high-risk
//    event when the capability sits in the HIGH tier.
//
// A reserved quota slot is released on every path out of `invoke`.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use ta_audit::{event_types, AuditLevel, AuditSink, NullSink};
use ta_trust::{EventOutcome, ProviderError, TrajectoryEngine, TrustEvent, TrustState, TrustTier, TrustTransition};

use crate::context::{daily_limit_denial, evaluate_context, ContextGatherer, PolicyContext};
use crate::engine::{Admission, Gate, PolicyDecision, PolicyEngine};
use crate::error::PolicyError;
use crate::providers::QuotaSlot;
use crate::registry::{CapabilityRegistry, ExecutionBackend, ExecutionResult};
use crate::tool::{Invocation, ToolDescriptor};

/// Notified of governed outcomes, e.g. to feed execution and violation
/// history.
pub trait InvocationObserver: Send + Sync {
    fn on_denied(&self, invocation: &Invocation, decision: &PolicyDecision);

    fn on_executed(&self, invocation: &Invocation, result: &ExecutionResult);
}

/// Everything that happened to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationOutcome {
    /// The deciding policy result. On execution this is an allow.
    pub decision: PolicyDecision,
    pub context: Option<PolicyContext>,
    /// `None` when the call never reached a backend.
    pub result: Option<ExecutionResult>,
    /// Trust state after the reported events, when any were reported.
    pub trust_state: Option<TrustState>,
    /// Transitions fired by the reported events, in order.
    pub transitions: Vec<TrustTransition>,
}

impl InvocationOutcome {
    fn denied(decision: PolicyDecision, context: Option<PolicyContext>) -> Self {
        Self {
            decision,
            context,
            result: None,
            trust_state: None,
            transitions: Vec::new(),
        }
    }

    pub fn executed(&self) -> bool {
        self.result.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.success)
    }

    fn absorb(&mut self, event: EventOutcome) {
        self.trust_state = Some(event.state);
        if let Some(transition) = event.transition {
            self.transitions.push(transition);
        }
    }
}

/// Runs invocations through policy, context checks and the backend registry.
pub struct GovernedInvoker {
    policy: Arc<PolicyEngine>,
    context: ContextGatherer,
    registry: Arc<CapabilityRegistry>,
    trajectory: Arc<TrajectoryEngine>,
    audit: Arc<dyn AuditSink>,
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl GovernedInvoker {
    pub fn new(
        policy: Arc<PolicyEngine>,
        context: ContextGatherer,
        registry: Arc<CapabilityRegistry>,
        trajectory: Arc<TrajectoryEngine>,
    ) -> Self {
        Self {
            policy,
            context,
            registry,
            trajectory,
            audit: Arc::new(NullSink),
            observers: Vec::new(),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Run one invocation under governance.
    ///
    /// Denials come back as an outcome with `allowed == false`; errors mean
    /// the request was malformed or a trust store failed.
    pub fn invoke(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
        timeout: Duration,
    ) -> Result<InvocationOutcome, PolicyError> {
        let Admission { trace, slot } = self.policy.admit(tool, invocation, admin_token)?;
        let decision = trace.decision;
        if !decision.allowed {
            self.notify_denied(invocation, &decision);
            let mut outcome = InvocationOutcome::denied(decision, None);
            if outcome.decision.gate == Some(Gate::Policy) {
                let policy_json = serde_json::to_value(&outcome.decision).ok();
                let event = self.trajectory.record_event(
                    &invocation.tool_id,
                    &invocation.action_id,
                    TrustEvent::PolicyRejection,
                    None,
                    policy_json,
                )?;
                outcome.absorb(event);
            }
            return Ok(outcome);
        }

        let ctx = self.context.gather(
            &invocation.tool_id,
            &invocation.action_id,
            &invocation.session_id,
            &invocation.actor,
        )?;
        let context_decision = evaluate_context(&ctx, &self.policy.config().context);
        if !context_decision.allowed {
            let released = context_decision.requires_approval
                && self.policy.validate_admin_token(admin_token);
            if !released {
                self.notify_denied(invocation, &context_decision);
                return Ok(InvocationOutcome::denied(context_decision, Some(ctx)));
            }
            tracing::info!(
                tool_id = %tool.tool_id,
                "trust-tier hold released by admin token"
            );
        }

        let backend = self.registry.resolve(&tool.tool_id)?;
        if let Some(denied) = self.reserve_daily_count(&ctx) {
            self.notify_denied(invocation, &denied);
            return Ok(InvocationOutcome::denied(denied, Some(ctx)));
        }

        let result = self.execute(tool, invocation, backend, slot, timeout);
        for observer in &self.observers {
            observer.on_executed(invocation, &result);
        }
        self.audit.emit(
            event_types::INVOCATION_EXECUTED,
            serde_json::json!({
                "capability_id": invocation.tool_id,
                "action_id": invocation.action_id,
                "invocation_id": invocation.invocation_id,
                "success": result.success,
                "timed_out": result.timed_out,
                "backend_unavailable": result.backend_unavailable,
                "duration_ms": result.duration_ms,
            }),
            if result.success {
                AuditLevel::Info
            } else {
                AuditLevel::Warning
            },
        );

        let mut outcome = InvocationOutcome {
            decision: PolicyDecision::allow(),
            context: Some(ctx.clone()),
            result: Some(result.clone()),
            trust_state: None,
            transitions: Vec::new(),
        };

        let event = if result.success {
            TrustEvent::Success
        } else {
            TrustEvent::Failure
        };
        let reported = self.trajectory.record_event(
            &invocation.tool_id,
            &invocation.action_id,
            event,
            Some(ctx.risk_score),
            None,
        )?;
        outcome.absorb(reported);

        if ctx.tier == TrustTier::High {
            let reported = self.trajectory.record_event(
                &invocation.tool_id,
                &invocation.action_id,
                TrustEvent::HighRisk,
                Some(ctx.risk_score),
                None,
            )?;
            outcome.absorb(reported);
        }

        Ok(outcome)
    }

    fn notify_denied(&self, invocation: &Invocation, decision: &PolicyDecision) {
        for observer in &self.observers {
            observer.on_denied(invocation, decision);
        }
    }

    /// Count this execution against today's limit. Returns the denial when
    /// the limit is reached or the counter cannot be reached.
    fn reserve_daily_count(&self, ctx: &PolicyContext) -> Option<PolicyDecision> {
        let limit = self.policy.config().context.daily_limit(ctx.tier);
        match self
            .context
            .counter()
            .try_acquire(&ctx.capability_id, &ctx.action_id, limit)
        {
            Ok(count) if count.allowed => None,
            Ok(count) => Some(daily_limit_denial(count.count, ctx.tier, limit)),
            Err(e) => {
                tracing::warn!(capability_id = %ctx.capability_id, "execution counter failed; failing closed: {}", e);
                Some(PolicyDecision::deny(
                    Gate::DailyLimit,
                    format!("execution count for today is unavailable: {}", e),
                ))
            }
        }
    }

    /// Run the backend on a worker thread and wait at most `timeout`.
    fn execute(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        backend: Arc<dyn ExecutionBackend>,
        slot: Option<QuotaSlot>,
        timeout: Duration,
    ) -> ExecutionResult {
        if !backend.is_available() {
            tracing::warn!(tool_id = %tool.tool_id, "backend unavailable; failing closed");
            return ExecutionResult::backend_unavailable(format!(
                "backend for '{}' is unavailable",
                tool.tool_id
            ));
        }

        let (tx, rx) = mpsc::channel();
        let call = invocation.clone();
        let spawned = thread::Builder::new()
            .name(format!("ta-exec-{}", tool.tool_id))
            .spawn(move || {
                let started = Instant::now();
                let outcome = backend.execute(&call, timeout);
                let elapsed_ms = millis(started.elapsed());
                // Release before reporting, so the caller never sees a held slot.
                if let Some(slot) = slot {
                    slot.complete(elapsed_ms);
                }
                let _ = tx.send((outcome, elapsed_ms));
            });
        if let Err(e) = spawned {
            tracing::warn!(tool_id = %tool.tool_id, "cannot start execution; failing closed: {}", e);
            return ExecutionResult::backend_unavailable(format!("cannot start execution: {}", e));
        }

        let mut result = match rx.recv_timeout(timeout) {
            Ok((Ok(mut result), elapsed_ms)) => {
                if result.duration_ms == 0 {
                    result.duration_ms = elapsed_ms;
                }
                result
            }
            Ok((Err(ProviderError::Timeout { .. }), _)) => ExecutionResult::timed_out(timeout),
            Ok((Err(e), _)) => ExecutionResult::backend_unavailable(e.to_string()),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(tool_id = %tool.tool_id, "backend overran its timeout; abandoning it");
                ExecutionResult::timed_out(timeout)
            }
            Err(RecvTimeoutError::Disconnected) => ExecutionResult::backend_unavailable(format!(
                "backend for '{}' stopped without a result",
                tool.tool_id
            )),
        };
        if !result.timed_out && Duration::from_millis(result.duration_ms) > timeout {
            // The backend overran its budget; its output is not trusted.
            result = ExecutionResult::timed_out(timeout);
        }
        if result.timed_out {
            tracing::warn!(tool_id = %tool.tool_id, "execution timed out");
        }
        result
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::providers::{
        InMemoryExecutionCounter, InMemoryQuotaProvider, QuotaLimits, QuotaProvider,
        StaticAuthorization, StaticSandboxProbe, StaticTokenValidator,
    };
    use crate::tool::{RiskLevel, ToolTrustTier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use ta_audit::RecordingSink;
    use ta_trust::{
        FixedRiskProvider, ManualClock, MemoryTrustStore, TierConfig, TierEngine, TrajectoryConfig,
    };

    enum Behavior {
        Succeed,
        Fail,
        Timeout,
        Offline,
    }

    struct ScriptedBackend {
        behavior: Mutex<Behavior>,
    }

    impl ScriptedBackend {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
            }
        }
    }

    impl ExecutionBackend for ScriptedBackend {
        fn is_available(&self) -> bool {
            !matches!(*self.behavior.lock().unwrap(), Behavior::Offline)
        }

        fn execute(
            &self,
            _invocation: &Invocation,
            timeout: Duration,
        ) -> Result<ExecutionResult, ProviderError> {
            match *self.behavior.lock().unwrap() {
                Behavior::Succeed => Ok(ExecutionResult {
                    success: true,
                    exit_code: Some(0),
                    output: "ok".to_string(),
                    duration_ms: 5,
                    ..Default::default()
                }),
                Behavior::Fail => Ok(ExecutionResult {
                    success: false,
                    exit_code: Some(1),
                    error: Some("boom".to_string()),
                    duration_ms: 5,
                    ..Default::default()
                }),
                Behavior::Timeout => Err(ProviderError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
                Behavior::Offline => Err(ProviderError::Unavailable("offline".to_string())),
            }
        }
    }

    /// Sleeps on every call and tracks how many calls overlap.
    struct SlowBackend {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ExecutionBackend for SlowBackend {
        fn is_available(&self) -> bool {
            true
        }

        fn execute(
            &self,
            _invocation: &Invocation,
            _timeout: Duration,
        ) -> Result<ExecutionResult, ProviderError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                success: true,
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    struct Fixture {
        invoker: GovernedInvoker,
        risk: Arc<FixedRiskProvider>,
        quota: Arc<InMemoryQuotaProvider>,
        tokens: Arc<StaticTokenValidator>,
        sandbox: Arc<StaticSandboxProbe>,
        trajectory: Arc<TrajectoryEngine>,
        audit: Arc<RecordingSink>,
    }

    fn fixture(behavior: Behavior) -> Fixture {
        fixture_with(
            Arc::new(ScriptedBackend::new(behavior)),
            InMemoryQuotaProvider::default(),
            PolicyConfig::default(),
        )
    }

    fn fixture_with(
        backend: Arc<dyn ExecutionBackend>,
        quota: InMemoryQuotaProvider,
        config: PolicyConfig,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryTrustStore::new());
        let audit = Arc::new(RecordingSink::new());
        let risk = Arc::new(FixedRiskProvider::new(10.0));
        let quota = Arc::new(quota);
        let tokens = Arc::new(StaticTokenValidator::new());
        let sandbox = Arc::new(StaticSandboxProbe::new(true));

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
        let policy = Arc::new(
            PolicyEngine::new(config)
                .unwrap()
                .with_quota_provider(quota.clone())
                .with_token_validator(tokens.clone())
                .with_audit_sink(audit.clone()),
        );
        let context = ContextGatherer::new(
            tiers,
            trajectory.clone(),
            Arc::new(StaticAuthorization::allow_all()),
            sandbox.clone(),
            Arc::new(InMemoryExecutionCounter::new(clock.clone())),
            clock,
        );
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register("web.fetch", backend).unwrap();
        registry
            .register("pay.charge", Arc::new(ScriptedBackend::new(Behavior::Succeed)))
            .unwrap();

        let invoker = GovernedInvoker::new(policy, context, registry, trajectory.clone())
            .with_audit_sink(audit.clone());
        Fixture {
            invoker,
            risk,
            quota,
            tokens,
            sandbox,
            trajectory,
            audit,
        }
    }

    fn tool() -> ToolDescriptor {
        ToolDescriptor::new("web.fetch", RiskLevel::Low, ToolTrustTier::T1)
    }

    fn invocation(tool_id: &str) -> Invocation {
        Invocation::new(tool_id, "get", "s-1", "alice")
            .with_frozen_spec("h")
            .with_project("p")
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn successful_call_records_success() {
        let f = fixture(Behavior::Succeed);
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.trust_state, Some(TrustState::Earning));
        let info = f.trajectory.get_trajectory_info("web.fetch", "get").unwrap();
        assert_eq!(info.consecutive_successes, 1);

        let state = f.quota.check_quota("web.fetch").unwrap().state;
        assert_eq!(state.calls_used, 1);
        assert_eq!(state.concurrent, 0);
        assert_eq!(f.audit.events_of_type(event_types::INVOCATION_EXECUTED).len(), 1);
    }

    #[test]
    fn blacklist_denial_counts_as_policy_rejection() {
        let f = fixture(Behavior::Succeed);
        let tool = ToolDescriptor::new("pay.charge", RiskLevel::High, ToolTrustTier::T2)
            .with_side_effects(["payments"]);
        let outcome = f
            .invoker
            .invoke(&tool, &invocation("pay.charge"), None, TIMEOUT)
            .unwrap();
        assert!(outcome.decision.denied_by(Gate::Policy));
        assert!(!outcome.executed());
        let info = f.trajectory.get_trajectory_info("pay.charge", "get").unwrap();
        assert_eq!(info.policy_rejections, 1);
    }

    #[test]
    fn other_gate_denials_leave_trajectory_alone() {
        let f = fixture(Behavior::Succeed);
        let outcome = f
            .invoker
            .invoke(&tool().disabled(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        assert!(outcome.decision.denied_by(Gate::Enabled));
        assert!(!f.trajectory.get_trajectory_info("web.fetch", "get").unwrap().tracked);
    }

    #[test]
    fn timeout_fails_closed_and_counts_as_failure() {
        let f = fixture(Behavior::Timeout);
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        let result = outcome.result.unwrap();
        assert!(result.timed_out);
        assert!(!result.success);
        let info = f.trajectory.get_trajectory_info("web.fetch", "get").unwrap();
        assert_eq!(info.consecutive_failures, 1);
        assert_eq!(f.quota.check_quota("web.fetch").unwrap().state.concurrent, 0);
    }

    #[test]
    fn unavailable_backend_fails_closed() {
        let f = fixture(Behavior::Offline);
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        assert!(outcome.result.unwrap().backend_unavailable);
        assert_eq!(
            f.trajectory.get_trajectory_info("web.fetch", "get").unwrap().consecutive_failures,
            1
        );
    }

    #[test]
    fn failed_call_records_failure() {
        let f = fixture(Behavior::Fail);
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        assert!(outcome.executed());
        assert!(!outcome.succeeded());
    }

    #[test]
    fn high_tier_holds_until_admin_token_then_records_high_risk() {
        let f = fixture(Behavior::Succeed);
        f.risk.set_score("web.fetch", "get", 85.0);

        let held = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        assert!(held.decision.denied_by(Gate::TrustTier));
        assert!(held.decision.requires_approval);
        assert!(!held.executed());

        let token = f.tokens.issue();
        let run = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), Some(&token), TIMEOUT)
            .unwrap();
        assert!(run.succeeded());
        let info = f.trajectory.get_trajectory_info("web.fetch", "get").unwrap();
        assert_eq!(info.high_risk_events, 1);
        // The high-risk event follows the success and breaks the streak.
        assert_eq!(info.consecutive_successes, 0);
    }

    #[test]
    fn high_tier_without_sandbox_is_denied_even_with_token() {
        let f = fixture(Behavior::Succeed);
        f.risk.set_score("web.fetch", "get", 85.0);
        f.sandbox.set_available(false);
        let token = f.tokens.issue();
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), Some(&token), TIMEOUT)
            .unwrap();
        assert!(outcome.decision.denied_by(Gate::Sandbox));
        assert!(!outcome.executed());
    }

    #[test]
    fn unregistered_capability_is_an_error() {
        let f = fixture(Behavior::Succeed);
        let tool = ToolDescriptor::new("fs.write", RiskLevel::Low, ToolTrustTier::T1);
        let result = f
            .invoker
            .invoke(&tool, &invocation("fs.write"), None, TIMEOUT);
        assert!(matches!(result, Err(PolicyError::UnknownCapability { .. })));
        let state = f.quota.check_quota("fs.write").unwrap().state;
        assert_eq!((state.concurrent, state.calls_used), (0, 0));
    }

    #[test]
    fn unavailable_backend_releases_its_quota_slot() {
        let f = fixture(Behavior::Offline);
        f.invoker
            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
            .unwrap();
        let state = f.quota.check_quota("web.fetch").unwrap().state;
        assert_eq!((state.concurrent, state.calls_used), (0, 0));
    }

    #[test]
    fn concurrent_invocations_respect_max_concurrent() {
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(150)));
        let quota = InMemoryQuotaProvider::default().with_limits(
            "web.fetch",
            QuotaLimits {
                max_concurrent: Some(1),
                ..Default::default()
            },
        );
        let f = fixture_with(backend.clone(), quota, PolicyConfig::default());

        let outcomes: Vec<InvocationOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        f.invoker
                            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
        let executed = outcomes.iter().filter(|o| o.executed()).count();
        let held_back = outcomes
            .iter()
            .filter(|o| o.decision.denied_by(Gate::Quota))
            .count();
        assert!(executed >= 1);
        assert_eq!(executed + held_back, 8);
        let state = f.quota.check_quota("web.fetch").unwrap().state;
        assert_eq!(state.concurrent, 0);
        assert_eq!(state.calls_used, executed as u64);
    }

    #[test]
    fn daily_limit_is_reserved_before_execution() {
        let mut config = PolicyConfig::default();
        config.context.daily_limit_low = 3;
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(100)));
        let f = fixture_with(backend, InMemoryQuotaProvider::default(), config);

        let outcomes: Vec<InvocationOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        f.invoker
                            .invoke(&tool(), &invocation("web.fetch"), None, TIMEOUT)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|o| o.executed()).count(), 3);
        let denied: Vec<_> = outcomes.iter().filter(|o| !o.executed()).collect();
        assert_eq!(denied.len(), 5);
        assert!(denied.iter().all(|o| o.decision.denied_by(Gate::DailyLimit)));
        // Refused calls hand their quota reservation back.
        assert_eq!(f.quota.check_quota("web.fetch").unwrap().state.calls_used, 3);
    }

    #[test]
    fn overrunning_backend_is_abandoned_at_the_timeout() {
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(1500)));
        let f = fixture_with(backend, InMemoryQuotaProvider::default(), PolicyConfig::default());

        let started = Instant::now();
        let outcome = f
            .invoker
            .invoke(&tool(), &invocation("web.fetch"), None, Duration::from_millis(100))
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        let result = outcome.result.unwrap();
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(
            f.trajectory.get_trajectory_info("web.fetch", "get").unwrap().consecutive_failures,
            1
        );
    }
}
