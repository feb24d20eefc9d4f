// engine.rs — Policy evaluation engine.
//
// Every invocation passes through `check_allowed()`, an ordered,
// short-circuiting chain of gates:
//
// 1. Enabled        disabled tool → Deny
// 2. Mode           PLANNING with declared side effects → Deny
// 3. SpecFrozen     EXECUTION without a frozen spec (re-verified against the
//                   task store when a task is named) → Deny
// 4. ProjectBinding no project id → Deny
// 5. Quota          quota exhausted → Deny; nearly exhausted → audit warning
// 6. Policy         side effect on the tier or global blacklist → Deny
// 7. AdminToken     approval required and no valid token → Deny +
//                   requires_approval
//
// The first gate that denies is the sole reason returned. A Quota or Policy
// denial of a tool that needs an admin token, requested without one, also
// carries requires_approval. Denials are structured decisions, never errors;
// only malformed input is an error. Missing or failing collaborators deny
// (fail closed).
//
// `check_allowed` only looks at the quota. `admit` reserves the quota slot
// in the same step as the check and hands it to the caller.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ta_audit::{event_types, AuditLevel, AuditSink, NullSink};

use crate::config::{CompiledBlacklists, PolicyConfig};
use crate::error::PolicyError;
use crate::providers::{AdminTokenValidator, QuotaProvider, QuotaSlot, TaskStore};
use crate::tool::{Invocation, InvocationMode, RiskLevel, ToolDescriptor, ToolTrustTier};

/// Identifier of the check that produced a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Enabled,
    Mode,
    SpecFrozen,
    ProjectBinding,
    Quota,
    Policy,
    AdminToken,
    // Context checks, applied after the gate chain.
    Authorization,
    Sandbox,
    DailyLimit,
    TrustTier,
}

impl Gate {
    /// The invocation gate chain, in evaluation order.
    pub const CHAIN: [Gate; 7] = [
        Gate::Enabled,
        Gate::Mode,
        Gate::SpecFrozen,
        Gate::ProjectBinding,
        Gate::Quota,
        Gate::Policy,
        Gate::AdminToken,
    ];
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gate::Enabled => "Enabled Gate",
            Gate::Mode => "Mode Gate",
            Gate::SpecFrozen => "Spec-Frozen Gate",
            Gate::ProjectBinding => "Project-Binding Gate",
            Gate::Quota => "Quota Gate",
            Gate::Policy => "Policy Gate",
            Gate::AdminToken => "Admin-Token Gate",
            Gate::Authorization => "Authorization check",
            Gate::Sandbox => "Sandbox check",
            Gate::DailyLimit => "Daily-limit check",
            Gate::TrustTier => "Trust-tier check",
        };
        write!(f, "{}", name)
    }
}

/// What a human approver needs to see to approve a held invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalContext {
    pub tool_id: String,
    pub action_id: String,
    /// Risk summary ("CRITICAL", "HIGH tier, score 82.0").
    pub risk: String,
    pub side_effects: Vec<String>,
    pub actor: String,
    pub requested_at: DateTime<Utc>,
    pub inputs: serde_json::Value,
}

/// The result of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Human-readable reason; `None` on allow.
    pub reason: Option<String>,
    pub requires_approval: bool,
    pub approval_context: Option<ApprovalContext>,
    /// The gate that denied; `None` on allow.
    pub gate: Option<Gate>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_approval: false,
            approval_context: None,
            gate: None,
        }
    }

    pub fn deny(gate: Gate, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("{}: {}", gate, reason.into())),
            requires_approval: false,
            approval_context: None,
            gate: Some(gate),
        }
    }

    /// Deny pending human approval.
    pub fn hold(gate: Gate, reason: impl Into<String>, context: ApprovalContext) -> Self {
        Self {
            requires_approval: true,
            approval_context: Some(context),
            ..Self::deny(gate, reason)
        }
    }

    pub fn denied_by(&self, gate: Gate) -> bool {
        !self.allowed && self.gate == Some(gate)
    }
}

/// A step in the evaluation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationStep {
    pub gate: Gate,
    /// "passed", "passed: quota warning ...", "denied: ...".
    pub outcome: String,
    /// Whether this step was the terminal decision point.
    pub terminal: bool,
}

/// Decision plus every gate that was evaluated, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationTrace {
    pub decision: PolicyDecision,
    pub steps: Vec<EvaluationStep>,
}

/// An evaluated invocation plus the quota slot reserved for it. The slot is
/// `None` on denial or when no quota provider is configured.
#[derive(Debug)]
pub struct Admission {
    pub trace: EvaluationTrace,
    pub slot: Option<QuotaSlot>,
}

impl Admission {
    pub fn decision(&self) -> &PolicyDecision {
        &self.trace.decision
    }
}

enum GateOutcome {
    Pass(String),
    Deny(PolicyDecision),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum QuotaMode {
    Check,
    Reserve,
}

/// The gate-chain policy engine.
pub struct PolicyEngine {
    config: PolicyConfig,
    blacklists: CompiledBlacklists,
    quota: Option<Arc<dyn QuotaProvider>>,
    tokens: Option<Arc<dyn AdminTokenValidator>>,
    tasks: Option<Arc<dyn TaskStore>>,
    audit: Arc<dyn AuditSink>,
}

impl PolicyEngine {
    /// Build an engine with no collaborators attached. Blacklist patterns
    /// are compiled here; an invalid pattern is an error.
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        let blacklists = CompiledBlacklists::compile(&config.blacklists)?;
        Ok(Self {
            config,
            blacklists,
            quota: None,
            tokens: None,
            tasks: None,
            audit: Arc::new(NullSink),
        })
    }

    pub fn with_quota_provider(mut self, quota: Arc<dyn QuotaProvider>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_token_validator(mut self, tokens: Arc<dyn AdminTokenValidator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn quota_provider(&self) -> Option<&Arc<dyn QuotaProvider>> {
        self.quota.as_ref()
    }

    /// Whether `token` is a valid admin token. False when no validator is
    /// configured.
    pub fn validate_admin_token(&self, token: Option<&str>) -> bool {
        match (token, &self.tokens) {
            (Some(token), Some(validator)) if !token.is_empty() => validator.validate(token),
            _ => false,
        }
    }

    /// Whether the tool needs an admin token: explicit flag, CRITICAL risk,
    /// or a registration tier that requires it by default.
    pub fn requires_admin_approval(&self, tool: &ToolDescriptor) -> bool {
        tool.requires_admin_approval
            || tool.risk_level == RiskLevel::Critical
            || self.config.admin_approval_tiers.contains(&tool.trust_tier)
    }

    /// Evaluate the gate chain and return the decision.
    pub fn check_allowed(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
    ) -> Result<PolicyDecision, PolicyError> {
        self.check_allowed_with_trace(tool, invocation, admin_token)
            .map(|trace| trace.decision)
    }

    /// Evaluate the gate chain and return the decision with a full trace.
    pub fn check_allowed_with_trace(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
    ) -> Result<EvaluationTrace, PolicyError> {
        self.evaluate(tool, invocation, admin_token, QuotaMode::Check)
            .map(|admission| admission.trace)
    }

    /// Evaluate the gate chain for an invocation about to run. On allow the
    /// quota slot stays reserved until the returned slot is dropped.
    pub fn admit(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
    ) -> Result<Admission, PolicyError> {
        self.evaluate(tool, invocation, admin_token, QuotaMode::Reserve)
    }

    fn evaluate(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
        mode: QuotaMode,
    ) -> Result<Admission, PolicyError> {
        invocation.validate_against(tool)?;

        let mut slot = None;
        let mut steps = Vec::with_capacity(Gate::CHAIN.len());
        for gate in Gate::CHAIN {
            let outcome = match gate {
                Gate::Enabled => self.enabled_gate(tool),
                Gate::Mode => self.mode_gate(tool, invocation),
                Gate::SpecFrozen => self.spec_frozen_gate(invocation),
                Gate::ProjectBinding => self.project_binding_gate(invocation),
                Gate::Quota => self.quota_gate(tool, invocation, mode, &mut slot),
                Gate::Policy => self.policy_gate(tool),
                Gate::AdminToken => self.admin_token_gate(tool, invocation, admin_token),
                // Context checks run after the chain.
                Gate::Authorization | Gate::Sandbox | Gate::DailyLimit | Gate::TrustTier => {
                    continue
                }
            };
            match outcome {
                GateOutcome::Pass(note) => {
                    tracing::debug!(gate = ?gate, tool_id = %tool.tool_id, "gate passed");
                    steps.push(EvaluationStep {
                        gate,
                        outcome: note,
                        terminal: false,
                    });
                }
                GateOutcome::Deny(mut decision) => {
                    if matches!(gate, Gate::Quota | Gate::Policy)
                        && self.requires_admin_approval(tool)
                        && admin_token.map_or(true, str::is_empty)
                    {
                        decision.requires_approval = true;
                        decision.approval_context = Some(approval_context(tool, invocation));
                    }
                    steps.push(EvaluationStep {
                        gate,
                        outcome: format!(
                            "denied: {}",
                            decision.reason.as_deref().unwrap_or_default()
                        ),
                        terminal: true,
                    });
                    self.report_denial(tool, invocation, &decision);
                    // A slot reserved before a later denial is cancelled here.
                    return Ok(Admission {
                        trace: EvaluationTrace { decision, steps },
                        slot: None,
                    });
                }
            }
        }

        if let Some(last) = steps.last_mut() {
            last.terminal = true;
        }
        Ok(Admission {
            trace: EvaluationTrace {
                decision: PolicyDecision::allow(),
                steps,
            },
            slot,
        })
    }

    fn report_denial(&self, tool: &ToolDescriptor, invocation: &Invocation, decision: &PolicyDecision) {
        tracing::info!(
            tool_id = %tool.tool_id,
            gate = ?decision.gate,
            requires_approval = decision.requires_approval,
            "invocation denied"
        );
        self.audit.emit(
            event_types::POLICY_DENIED,
            serde_json::json!({
                "capability_id": tool.tool_id,
                "action_id": invocation.action_id,
                "invocation_id": invocation.invocation_id,
                "actor": invocation.actor,
                "gate": decision.gate,
                "reason": decision.reason,
                "requires_approval": decision.requires_approval,
            }),
            AuditLevel::Info,
        );
    }

    fn enabled_gate(&self, tool: &ToolDescriptor) -> GateOutcome {
        if tool.enabled {
            GateOutcome::Pass("passed".to_string())
        } else {
            GateOutcome::Deny(PolicyDecision::deny(
                Gate::Enabled,
                format!("tool '{}' is disabled", tool.tool_id),
            ))
        }
    }

    fn mode_gate(&self, tool: &ToolDescriptor, invocation: &Invocation) -> GateOutcome {
        if invocation.mode == InvocationMode::Planning && tool.has_side_effects() {
            GateOutcome::Deny(PolicyDecision::deny(
                Gate::Mode,
                format!(
                    "tool '{}' declares side effects [{}] and cannot run in PLANNING mode",
                    tool.tool_id,
                    tool.side_effects.join(", ")
                ),
            ))
        } else {
            GateOutcome::Pass(format!("passed: {} mode", invocation.mode))
        }
    }

    fn spec_frozen_gate(&self, invocation: &Invocation) -> GateOutcome {
        if invocation.mode != InvocationMode::Execution {
            return GateOutcome::Pass("passed: not an execution".to_string());
        }
        let hash = invocation.spec_hash.as_deref().unwrap_or_default();
        if !invocation.spec_frozen || hash.trim().is_empty() {
            return GateOutcome::Deny(PolicyDecision::deny(
                Gate::SpecFrozen,
                "EXECUTION mode requires a frozen spec with a spec hash",
            ));
        }
        let Some(task_id) = invocation.task_id.as_deref() else {
            return GateOutcome::Pass("passed: spec frozen".to_string());
        };

        let Some(tasks) = &self.tasks else {
            tracing::warn!(task_id = %task_id, "no task store configured; failing closed");
            return GateOutcome::Deny(PolicyDecision::deny(
                Gate::SpecFrozen,
                format!("cannot verify task '{}': no task store configured", task_id),
            ));
        };
        match tasks.task_status(task_id) {
            Err(e) => {
                tracing::warn!(task_id = %task_id, "task store failed; failing closed: {}", e);
                GateOutcome::Deny(PolicyDecision::deny(
                    Gate::SpecFrozen,
                    format!("cannot verify task '{}': {}", task_id, e),
                ))
            }
            Ok(None) => GateOutcome::Deny(PolicyDecision::deny(
                Gate::SpecFrozen,
                format!("unknown task '{}'", task_id),
            )),
            Ok(Some(status)) if !status.frozen => GateOutcome::Deny(PolicyDecision::deny(
                Gate::SpecFrozen,
                format!("task '{}' spec is not frozen", task_id),
            )),
            Ok(Some(status)) if status.spec_hash.as_deref() != Some(hash) => {
                GateOutcome::Deny(PolicyDecision::deny(
                    Gate::SpecFrozen,
                    format!("spec hash does not match the frozen spec of task '{}'", task_id),
                ))
            }
            Ok(Some(_)) => GateOutcome::Pass(format!("passed: task '{}' verified", task_id)),
        }
    }

    fn project_binding_gate(&self, invocation: &Invocation) -> GateOutcome {
        match invocation.project_id.as_deref() {
            Some(project) if !project.trim().is_empty() => {
                GateOutcome::Pass(format!("passed: project '{}'", project))
            }
            _ => GateOutcome::Deny(PolicyDecision::deny(
                Gate::ProjectBinding,
                "invocation is not bound to a project",
            )),
        }
    }

    fn quota_gate(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        mode: QuotaMode,
        slot: &mut Option<QuotaSlot>,
    ) -> GateOutcome {
        let Some(quota) = &self.quota else {
            return GateOutcome::Pass("passed: no quota provider".to_string());
        };
        let checked = match mode {
            QuotaMode::Check => quota.check_quota(&tool.tool_id),
            QuotaMode::Reserve => quota.try_acquire(&tool.tool_id),
        };
        let check = match checked {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(tool_id = %tool.tool_id, "quota provider failed; failing closed: {}", e);
                return GateOutcome::Deny(PolicyDecision::deny(
                    Gate::Quota,
                    format!("quota for '{}' cannot be checked: {}", tool.tool_id, e),
                ));
            }
        };

        let payload = serde_json::json!({
            "capability_id": tool.tool_id,
            "action_id": invocation.action_id,
            "invocation_id": invocation.invocation_id,
            "reason": check.reason,
            "state": check.state,
        });
        if !check.allowed {
            self.audit
                .emit(event_types::QUOTA_EXCEEDED, payload, AuditLevel::Warning);
            return GateOutcome::Deny(PolicyDecision::deny(
                Gate::Quota,
                check
                    .reason
                    .unwrap_or_else(|| format!("quota for '{}' exceeded", tool.tool_id)),
            ));
        }
        if mode == QuotaMode::Reserve {
            *slot = Some(QuotaSlot::new(quota.clone(), tool.tool_id.as_str()));
        }
        if check.warning {
            tracing::warn!(tool_id = %tool.tool_id, "quota nearly exhausted");
            self.audit
                .emit(event_types::QUOTA_WARNING, payload, AuditLevel::Warning);
            return GateOutcome::Pass(format!(
                "passed: {}",
                check.reason.unwrap_or_else(|| "quota warning".to_string())
            ));
        }
        GateOutcome::Pass("passed".to_string())
    }

    fn policy_gate(&self, tool: &ToolDescriptor) -> GateOutcome {
        for effect in &tool.side_effects {
            if let Some(pattern) = self.blacklists.global_match(effect) {
                return GateOutcome::Deny(PolicyDecision::deny(
                    Gate::Policy,
                    format!(
                        "side effect '{}' is on the global blacklist ('{}')",
                        effect, pattern
                    ),
                ));
            }
            if let Some(pattern) = self.blacklists.tier_match(tool.trust_tier, effect) {
                return GateOutcome::Deny(PolicyDecision::deny(
                    Gate::Policy,
                    format!(
                        "side effect '{}' is on the {} blacklist ('{}')",
                        effect, tool.trust_tier, pattern
                    ),
                ));
            }
        }

        if tool.trust_tier == ToolTrustTier::T3 && self.blacklists.t3_deny_unless_allowed {
            if let Some(effect) = tool
                .side_effects
                .iter()
                .find(|e| !tool.allowed_side_effects.contains(*e))
            {
                return GateOutcome::Deny(PolicyDecision::deny(
                    Gate::Policy,
                    format!(
                        "side effect '{}' is not explicitly allowed for a T3 tool",
                        effect
                    ),
                ));
            }
        }
        GateOutcome::Pass("passed".to_string())
    }

    fn admin_token_gate(
        &self,
        tool: &ToolDescriptor,
        invocation: &Invocation,
        admin_token: Option<&str>,
    ) -> GateOutcome {
        if !self.requires_admin_approval(tool) {
            return GateOutcome::Pass("passed: no admin approval required".to_string());
        }

        let context = approval_context(tool, invocation);
        let token = admin_token.unwrap_or_default();
        if token.is_empty() {
            return GateOutcome::Deny(PolicyDecision::hold(
                Gate::AdminToken,
                format!("tool '{}' requires an admin token", tool.tool_id),
                context,
            ));
        }
        let Some(validator) = &self.tokens else {
            tracing::warn!(tool_id = %tool.tool_id, "no admin token validator configured; failing closed");
            return GateOutcome::Deny(PolicyDecision::hold(
                Gate::AdminToken,
                "admin token cannot be verified: no validator configured",
                context,
            ));
        };
        if validator.validate(token) {
            GateOutcome::Pass("passed: admin token valid".to_string())
        } else {
            GateOutcome::Deny(PolicyDecision::hold(
                Gate::AdminToken,
                "admin token is invalid",
                context,
            ))
        }
    }
}

fn approval_context(tool: &ToolDescriptor, invocation: &Invocation) -> ApprovalContext {
    ApprovalContext {
        tool_id: tool.tool_id.clone(),
        action_id: invocation.action_id.clone(),
        risk: tool.risk_level.to_string(),
        side_effects: tool.side_effects.clone(),
        actor: invocation.actor.clone(),
        requested_at: invocation.requested_at,
        inputs: invocation.inputs.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        InMemoryQuotaProvider, MemoryTaskStore, QuotaCheck, QuotaLimits, StaticTokenValidator,
        TaskSpecStatus,
    };
    use ta_audit::RecordingSink;
    use ta_trust::ProviderError;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default()).unwrap()
    }

    fn tool() -> ToolDescriptor {
        ToolDescriptor::new("web.fetch", RiskLevel::Low, ToolTrustTier::T1)
    }

    fn invocation() -> Invocation {
        Invocation::new("web.fetch", "get", "s-1", "alice")
            .with_frozen_spec("sha256:abc")
            .with_project("proj-1")
    }

    struct BrokenQuota;

    impl QuotaProvider for BrokenQuota {
        fn check_quota(&self, _quota_id: &str) -> Result<QuotaCheck, ProviderError> {
            Err(ProviderError::Unavailable("quota service down".to_string()))
        }

        fn try_acquire(&self, quota_id: &str) -> Result<QuotaCheck, ProviderError> {
            self.check_quota(quota_id)
        }

        fn update_quota(&self, _: &str, _: u64, _: i64) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("quota service down".to_string()))
        }

        fn cancel(&self, _: &str) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("quota service down".to_string()))
        }
    }

    fn single_call_quota() -> Arc<InMemoryQuotaProvider> {
        Arc::new(InMemoryQuotaProvider::default().with_limits(
            "web.fetch",
            QuotaLimits {
                max_concurrent: Some(1),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn allow_when_every_gate_passes() {
        let trace = engine()
            .check_allowed_with_trace(&tool(), &invocation(), None)
            .unwrap();
        assert_eq!(trace.decision, PolicyDecision::allow());
        assert_eq!(trace.steps.len(), 7);
        assert!(trace.steps.last().unwrap().terminal);
        assert!(trace.steps[..6].iter().all(|s| !s.terminal));
    }

    #[test]
    fn disabled_tool_is_denied_first() {
        let decision = engine()
            .check_allowed(&tool().disabled(), &invocation(), None)
            .unwrap();
        assert!(decision.denied_by(Gate::Enabled));
    }

    #[test]
    fn mode_gate_wins_over_admin_token_gate() {
        let tool = ToolDescriptor::new("web.fetch", RiskLevel::Critical, ToolTrustTier::T1)
            .with_side_effects(["net:http"])
            .requiring_admin_approval();
        let trace = engine()
            .check_allowed_with_trace(&tool, &invocation().planning(), None)
            .unwrap();
        let decision = &trace.decision;
        assert!(decision.denied_by(Gate::Mode));
        assert!(!decision.requires_approval);
        let reason = decision.reason.as_deref().unwrap();
        assert!(reason.starts_with("Mode Gate"));
        assert!(!reason.contains("Admin-Token"));
        assert_eq!(trace.steps.len(), 2);
    }

    #[test]
    fn planning_without_side_effects_skips_spec_check() {
        let inv = Invocation::new("web.fetch", "get", "s-1", "alice")
            .planning()
            .with_project("proj-1");
        assert!(engine().check_allowed(&tool(), &inv, None).unwrap().allowed);
    }

    #[test]
    fn execution_requires_frozen_spec() {
        let inv = Invocation::new("web.fetch", "get", "s-1", "alice").with_project("proj-1");
        let decision = engine().check_allowed(&tool(), &inv, None).unwrap();
        assert!(decision.denied_by(Gate::SpecFrozen));
    }

    #[test]
    fn task_is_reverified_against_store() {
        let inv = invocation().with_task("task-7");

        // No store configured → fail closed.
        let decision = engine().check_allowed(&tool(), &inv, None).unwrap();
        assert!(decision.denied_by(Gate::SpecFrozen));

        let tasks = Arc::new(MemoryTaskStore::new());
        let engine = engine().with_task_store(tasks.clone());
        assert!(engine
            .check_allowed(&tool(), &inv, None)
            .unwrap()
            .reason
            .unwrap()
            .contains("unknown task"));

        tasks.put(TaskSpecStatus {
            task_id: "task-7".to_string(),
            frozen: true,
            spec_hash: Some("sha256:other".to_string()),
        });
        assert!(engine.check_allowed(&tool(), &inv, None).unwrap().denied_by(Gate::SpecFrozen));

        tasks.put(TaskSpecStatus {
            task_id: "task-7".to_string(),
            frozen: true,
            spec_hash: Some("sha256:abc".to_string()),
        });
        assert!(engine.check_allowed(&tool(), &inv, None).unwrap().allowed);
    }

    #[test]
    fn missing_project_is_denied() {
        let inv = Invocation::new("web.fetch", "get", "s-1", "alice").with_frozen_spec("h");
        assert!(engine()
            .check_allowed(&tool(), &inv, None)
            .unwrap()
            .denied_by(Gate::ProjectBinding));
    }

    #[test]
    fn quota_exceeded_denies_and_audits() {
        let audit = Arc::new(RecordingSink::new());
        let quota = Arc::new(InMemoryQuotaProvider::default().with_limits(
            "web.fetch",
            QuotaLimits {
                max_calls: Some(1),
                ..Default::default()
            },
        ));
        quota.update_quota("web.fetch", 0, 1).unwrap();
        let engine = engine().with_quota_provider(quota).with_audit_sink(audit.clone());

        let decision = engine.check_allowed(&tool(), &invocation(), None).unwrap();
        assert!(decision.denied_by(Gate::Quota));
        assert_eq!(audit.events_of_type(event_types::QUOTA_EXCEEDED).len(), 1);
        assert_eq!(audit.events_of_type(event_types::POLICY_DENIED).len(), 1);
    }

    #[test]
    fn quota_warning_allows_and_audits() {
        let audit = Arc::new(RecordingSink::new());
        let quota = Arc::new(InMemoryQuotaProvider::new(0.5).with_limits(
            "web.fetch",
            QuotaLimits {
                max_calls: Some(2),
                ..Default::default()
            },
        ));
        quota.update_quota("web.fetch", 0, 1).unwrap();
        let engine = engine().with_quota_provider(quota).with_audit_sink(audit.clone());

        assert!(engine.check_allowed(&tool(), &invocation(), None).unwrap().allowed);
        let warnings = audit.events_of_type(event_types::QUOTA_WARNING);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, AuditLevel::Warning);
    }

    #[test]
    fn admit_reserves_the_slot_and_check_does_not() {
        let quota = single_call_quota();
        let engine = engine().with_quota_provider(quota.clone());

        assert!(engine.check_allowed(&tool(), &invocation(), None).unwrap().allowed);
        assert_eq!(quota.check_quota("web.fetch").unwrap().state.concurrent, 0);

        let first = engine.admit(&tool(), &invocation(), None).unwrap();
        assert!(first.decision().allowed);
        assert_eq!(first.slot.as_ref().unwrap().quota_id(), "web.fetch");

        let second = engine.admit(&tool(), &invocation(), None).unwrap();
        assert!(second.decision().denied_by(Gate::Quota));
        assert!(second.slot.is_none());

        first.slot.unwrap().complete(20);
        let state = quota.check_quota("web.fetch").unwrap().state;
        assert_eq!((state.concurrent, state.calls_used, state.runtime_ms_used), (0, 1, 20));
    }

    #[test]
    fn slot_reserved_before_a_later_denial_is_cancelled() {
        let quota = single_call_quota();
        let engine = engine().with_quota_provider(quota.clone());
        let tool = ToolDescriptor::new("web.fetch", RiskLevel::High, ToolTrustTier::T2)
            .with_side_effects(["payments"]);

        let admission = engine.admit(&tool, &invocation(), None).unwrap();
        assert!(admission.decision().denied_by(Gate::Policy));
        assert!(admission.slot.is_none());
        let state = quota.check_quota("web.fetch").unwrap().state;
        assert_eq!((state.concurrent, state.calls_used), (0, 0));
    }

    #[test]
    fn concurrent_admissions_respect_max_concurrent() {
        let quota = single_call_quota();
        let engine = Arc::new(engine().with_quota_provider(quota.clone()));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.admit(&tool(), &invocation(), None).unwrap()
                })
            })
            .collect();
        let admissions: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let admitted = admissions.iter().filter(|a| a.decision().allowed).count();
        assert_eq!(admitted, 1);
        assert_eq!(quota.check_quota("web.fetch").unwrap().state.concurrent, 1);
        drop(admissions);
        assert_eq!(quota.check_quota("web.fetch").unwrap().state.concurrent, 0);
    }

    #[test]
    fn quota_provider_failure_fails_closed() {
        let engine = engine().with_quota_provider(Arc::new(BrokenQuota));
        let decision = engine.check_allowed(&tool(), &invocation(), None).unwrap();
        assert!(decision.denied_by(Gate::Quota));
        assert!(decision.reason.unwrap().contains("quota service down"));
    }

    #[test]
    fn payments_at_t2_denied_by_blacklist() {
        let tool = ToolDescriptor::new("pay.charge", RiskLevel::High, ToolTrustTier::T2)
            .with_side_effects(["payments"]);
        let inv = Invocation::new("pay.charge", "run", "s-1", "alice")
            .with_frozen_spec("h")
            .with_project("p");
        let decision = engine().check_allowed(&tool, &inv, None).unwrap();
        assert!(decision.denied_by(Gate::Policy));
        assert!(decision.reason.unwrap().contains("T2 blacklist"));
    }

    #[test]
    fn global_blacklist_applies_to_t0() {
        let tool = ToolDescriptor::new("ops.sudo", RiskLevel::High, ToolTrustTier::T0)
            .with_side_effects(["privilege_escalation"]);
        let inv = Invocation::new("ops.sudo", "run", "s-1", "alice")
            .with_frozen_spec("h")
            .with_project("p");
        let decision = engine().check_allowed(&tool, &inv, None).unwrap();
        assert!(decision.reason.unwrap().contains("global blacklist"));
    }

    #[test]
    fn t3_side_effects_need_explicit_allowance() {
        let validator = Arc::new(StaticTokenValidator::new());
        let token = validator.issue();
        let engine = engine().with_token_validator(validator);
        let inv = Invocation::new("ext.plugin", "run", "s-1", "alice")
            .with_frozen_spec("h")
            .with_project("p");

        let tool = ToolDescriptor::new("ext.plugin", RiskLevel::Medium, ToolTrustTier::T3)
            .with_side_effects(["fs:write"]);
        assert!(engine
            .check_allowed(&tool, &inv, Some(&token))
            .unwrap()
            .denied_by(Gate::Policy));

        let tool = tool.with_allowed_side_effects(["fs:write"]);
        assert!(engine.check_allowed(&tool, &inv, Some(&token)).unwrap().allowed);
    }

    #[test]
    fn admin_required_without_token_holds_for_approval() {
        let tool = tool().requiring_admin_approval();
        let decision = engine()
            .with_token_validator(Arc::new(StaticTokenValidator::new()))
            .check_allowed(&tool, &invocation().with_inputs(serde_json::json!({"url": "x"})), None)
            .unwrap();
        assert!(decision.denied_by(Gate::AdminToken));
        assert!(decision.requires_approval);
        let context = decision.approval_context.unwrap();
        assert_eq!(context.tool_id, "web.fetch");
        assert_eq!(context.actor, "alice");
        assert_eq!(context.inputs["url"], "x");
    }

    #[test]
    fn missing_admin_token_flags_approval_on_quota_denial() {
        let quota = Arc::new(InMemoryQuotaProvider::default().with_limits(
            "web.fetch",
            QuotaLimits {
                max_calls: Some(1),
                ..Default::default()
            },
        ));
        quota.update_quota("web.fetch", 0, 1).unwrap();
        let engine = engine()
            .with_quota_provider(quota)
            .with_token_validator(Arc::new(StaticTokenValidator::new()));

        let decision = engine
            .check_allowed(&tool().requiring_admin_approval(), &invocation(), None)
            .unwrap();
        assert!(decision.denied_by(Gate::Quota));
        assert!(decision.requires_approval);
        assert!(decision.reason.as_deref().unwrap().starts_with("Quota Gate"));
        assert_eq!(decision.approval_context.unwrap().tool_id, "web.fetch");

        // Same denial for a tool without the admin requirement.
        let plain = engine.check_allowed(&tool(), &invocation(), None).unwrap();
        assert!(plain.denied_by(Gate::Quota));
        assert!(!plain.requires_approval);
        assert!(plain.approval_context.is_none());
    }

    #[test]
    fn missing_admin_token_flags_approval_on_policy_denial() {
        let validator = Arc::new(StaticTokenValidator::new());
        let token = validator.issue();
        let engine = engine().with_token_validator(validator);
        let tool = ToolDescriptor::new("pay.charge", RiskLevel::Critical, ToolTrustTier::T2)
            .with_side_effects(["payments"]);
        let inv = Invocation::new("pay.charge", "run", "s-1", "alice")
            .with_frozen_spec("h")
            .with_project("p");

        let decision = engine.check_allowed(&tool, &inv, None).unwrap();
        assert!(decision.denied_by(Gate::Policy));
        assert!(decision.requires_approval);
        assert!(decision.reason.as_deref().unwrap().contains("T2 blacklist"));

        // With a token the blacklist denial stands on its own.
        let with_token = engine.check_allowed(&tool, &inv, Some(&token)).unwrap();
        assert!(with_token.denied_by(Gate::Policy));
        assert!(!with_token.requires_approval);
    }

    #[test]
    fn critical_risk_requires_valid_token() {
        let validator = Arc::new(StaticTokenValidator::new());
        let token = validator.issue();
        let engine = engine().with_token_validator(validator);
        let tool = ToolDescriptor::new("web.fetch", RiskLevel::Critical, ToolTrustTier::T1);

        let bad = engine.check_allowed(&tool, &invocation(), Some("nope")).unwrap();
        assert!(bad.requires_approval);
        assert!(engine.check_allowed(&tool, &invocation(), Some(&token)).unwrap().allowed);
    }

    #[test]
    fn missing_validator_fails_closed() {
        let tool = tool().requiring_admin_approval();
        let decision = engine()
            .check_allowed(&tool, &invocation(), Some("anything"))
            .unwrap();
        assert!(decision.denied_by(Gate::AdminToken));
        assert!(decision.requires_approval);
    }

    #[test]
    fn malformed_request_is_an_error_not_a_denial() {
        let inv = Invocation::new("other.tool", "get", "s-1", "alice");
        assert!(matches!(
            engine().check_allowed(&tool(), &inv, None),
            Err(PolicyError::Validation { .. })
        ));
    }
}
