// context.rs — Runtime context checks applied after the gate chain.
//
// The gate chain looks at the tool and the request. The context checks look
// at the capability's live standing: who is asking, the current trust tier
// and trajectory, whether the sandbox is up, and how often it ran today.
//
// Order: authorization, sandbox, daily limit, trust tier. The first denial
// wins. Collaborator failures resolve to the conservative answer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ta_trust::{Clock, TierEngine, TrajectoryEngine, TrustState, TrustTier};

use crate::config::ContextLimits;
use crate::engine::{ApprovalContext, Gate, PolicyDecision};
use crate::error::PolicyError;
use crate::providers::{AuthorizationProvider, ExecutionCounter, SandboxProbe};

/// Everything the context checks look at, gathered fresh per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyContext {
    pub capability_id: String,
    pub action_id: String,
    pub session_id: String,
    pub user_id: String,
    pub tier: TrustTier,
    pub risk_score: f64,
    pub auth_allowed: bool,
    pub auth_status: String,
    pub sandbox_available: bool,
    /// `None` when the execution counter could not be read.
    pub execution_count_today: Option<u64>,
    pub trust_state: TrustState,
    pub gathered_at: DateTime<Utc>,
}

/// Builds a PolicyContext from the trust engines and runtime collaborators.
pub struct ContextGatherer {
    tiers: Arc<TierEngine>,
    trajectory: Arc<TrajectoryEngine>,
    auth: Arc<dyn AuthorizationProvider>,
    sandbox: Arc<dyn SandboxProbe>,
    counter: Arc<dyn ExecutionCounter>,
    clock: Arc<dyn Clock>,
}

impl ContextGatherer {
    pub fn new(
        tiers: Arc<TierEngine>,
        trajectory: Arc<TrajectoryEngine>,
        auth: Arc<dyn AuthorizationProvider>,
        sandbox: Arc<dyn SandboxProbe>,
        counter: Arc<dyn ExecutionCounter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tiers,
            trajectory,
            auth,
            sandbox,
            counter,
            clock,
        }
    }

    pub fn counter(&self) -> &Arc<dyn ExecutionCounter> {
        &self.counter
    }

    /// Gather the context. Trust store failures are returned; collaborator
    /// failures become the fail-closed value.
    pub fn gather(
        &self,
        capability_id: &str,
        action_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<PolicyContext, PolicyError> {
        let tier = self.tiers.get_tier(capability_id, action_id)?;
        let trust_state = self.trajectory.get_current_state(capability_id, action_id)?;

        let (auth_allowed, auth_status) =
            match self
                .auth
                .check_authorization(capability_id, action_id, session_id, user_id)
            {
                Ok(result) => (result.allowed, result.reason),
                Err(e) => {
                    tracing::warn!(capability_id = %capability_id, "authorization provider failed: {}", e);
                    (false, format!("authorization unavailable: {}", e))
                }
            };

        let sandbox_available = match self.sandbox.is_available() {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!("sandbox probe failed; treating as unavailable: {}", e);
                false
            }
        };

        let execution_count_today = match self.counter.executions_today(capability_id, action_id) {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(capability_id = %capability_id, "execution counter failed: {}", e);
                None
            }
        };

        Ok(PolicyContext {
            capability_id: capability_id.to_string(),
            action_id: action_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            tier: tier.tier,
            risk_score: tier.risk_score,
            auth_allowed,
            auth_status,
            sandbox_available,
            execution_count_today,
            trust_state,
            gathered_at: self.clock.now(),
        })
    }
}

/// Apply the context checks in order.
pub fn evaluate_context(ctx: &PolicyContext, limits: &ContextLimits) -> PolicyDecision {
    if !ctx.auth_allowed {
        return PolicyDecision::deny(
            Gate::Authorization,
            format!("not authorized: {}", ctx.auth_status),
        );
    }

    if ctx.tier.requires_sandbox() && !ctx.sandbox_available {
        return PolicyDecision::deny(
            Gate::Sandbox,
            format!(
                "{} tier requires the sandbox and the sandbox is unavailable",
                ctx.tier
            ),
        );
    }

    let limit = limits.daily_limit(ctx.tier);
    match ctx.execution_count_today {
        None => {
            return PolicyDecision::deny(
                Gate::DailyLimit,
                "execution count for today is unavailable",
            )
        }
        Some(count) if count >= limit => return daily_limit_denial(count, ctx.tier, limit),
        Some(_) => {}
    }

    let degrading_medium = ctx.trust_state == TrustState::Degrading && ctx.tier == TrustTier::Medium;
    if !ctx.tier.allows_auto_execution() || degrading_medium {
        let reason = if degrading_medium {
            "MEDIUM tier with a DEGRADING trajectory requires approval".to_string()
        } else {
            format!("{} tier does not allow unattended execution", ctx.tier)
        };
        return PolicyDecision::hold(
            Gate::TrustTier,
            reason,
            ApprovalContext {
                tool_id: ctx.capability_id.clone(),
                action_id: ctx.action_id.clone(),
                risk: format!("{} tier, score {:.1}, {}", ctx.tier, ctx.risk_score, ctx.trust_state),
                side_effects: Vec::new(),
                actor: ctx.user_id.clone(),
                requested_at: ctx.gathered_at,
                inputs: serde_json::Value::Null,
            },
        );
    }

    PolicyDecision::allow()
}

pub(crate) fn daily_limit_denial(count: u64, tier: TrustTier, limit: u64) -> PolicyDecision {
    PolicyDecision::deny(
        Gate::DailyLimit,
        format!(
            "{} executions today reached the {} tier limit of {}",
            count, tier, limit
        ),
    )
}
