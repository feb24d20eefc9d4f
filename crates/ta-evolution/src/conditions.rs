// conditions.rs — PROMOTE / FREEZE / REVOKE condition sets.
//
// Each candidate is evaluated independently against the same evidence.
// PROMOTE and FREEZE need every condition; REVOKE fires on any exceeded
// tolerance. The highest-priority met candidate is selected:
// REVOKE > FREEZE > PROMOTE > NONE.

use serde::{Deserialize, Serialize};

use ta_trust::TrustTier;

use crate::config::EvolutionConfig;
use crate::decision::EvolutionAction;
use crate::evidence::Evidence;

/// Outcome of one candidate's condition set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateResult {
    pub action: EvolutionAction,
    pub met: bool,
    /// Conditions that held. For REVOKE these are the triggering violations.
    pub satisfied: Vec<String>,
    /// Conditions that did not hold.
    pub unmet: Vec<String>,
}

impl CandidateResult {
    fn new(action: EvolutionAction) -> Self {
        Self {
            action,
            met: false,
            satisfied: Vec::new(),
            unmet: Vec::new(),
        }
    }

    fn check(&mut self, holds: bool, description: String) {
        if holds {
            self.satisfied.push(description);
        } else {
            self.unmet.push(description);
        }
    }
}

/// All three candidates plus the selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub selected: EvolutionAction,
    /// PROMOTE, FREEZE, REVOKE, in that order.
    pub candidates: Vec<CandidateResult>,
}

impl Evaluation {
    pub fn candidate(&self, action: EvolutionAction) -> Option<&CandidateResult> {
        self.candidates.iter().find(|c| c.action == action)
    }

    /// Empty when an action was selected; otherwise every candidate's unmet
    /// conditions, prefixed with the candidate.
    pub fn unmet_reasons(&self) -> Vec<String> {
        if self.selected != EvolutionAction::None {
            return Vec::new();
        }
        self.candidates
            .iter()
            .flat_map(|c| c.unmet.iter().map(move |r| format!("{}: {}", c.action, r)))
            .collect()
    }
}

/// Evaluate every candidate and select one. Pure; usable without stores.
pub fn evaluate(evidence: &Evidence, config: &EvolutionConfig) -> Evaluation {
    let candidates = vec![
        evaluate_promote(evidence, config),
        evaluate_freeze(evidence, config),
        evaluate_revoke(evidence, config),
    ];
    let selected = candidates
        .iter()
        .filter(|c| c.met)
        .map(|c| c.action)
        .max()
        .unwrap_or(EvolutionAction::None);
    tracing::debug!(
        capability_id = %evidence.capability_id,
        action_id = %evidence.action_id,
        selected = %selected,
        "evaluated evolution candidates"
    );
    Evaluation {
        selected,
        candidates,
    }
}

fn evaluate_promote(evidence: &Evidence, config: &EvolutionConfig) -> CandidateResult {
    let conditions = &config.promote;
    let trajectory = &evidence.trajectory;
    let mut result = CandidateResult::new(EvolutionAction::Promote);

    result.check(
        trajectory.state == conditions.required_state,
        format!(
            "trajectory state {} (required {})",
            trajectory.state, conditions.required_state
        ),
    );
    result.check(
        trajectory.consecutive_successes >= conditions.min_consecutive_successes,
        format!(
            "consecutive successes {} (minimum {})",
            trajectory.consecutive_successes, conditions.min_consecutive_successes
        ),
    );
    result.check(
        trajectory.policy_rejections <= conditions.max_policy_rejections,
        format!(
            "trajectory policy rejections {} (tolerance {})",
            trajectory.policy_rejections, conditions.max_policy_rejections
        ),
    );
    result.check(
        evidence.violations.policy_denials <= conditions.max_policy_denials,
        format!(
            "policy denials in {} days {} (tolerance {})",
            evidence.window_days, evidence.violations.policy_denials, conditions.max_policy_denials
        ),
    );
    if conditions.forbid_high_tier {
        result.check(
            evidence.tier() != TrustTier::High,
            format!("tier {} (must not be HIGH)", evidence.tier()),
        );
    }

    result.met = result.unmet.is_empty();
    result
}

fn evaluate_freeze(evidence: &Evidence, config: &EvolutionConfig) -> CandidateResult {
    let conditions = &config.freeze;
    let spike_tolerance = conditions
        .max_trailing_failures
        .unwrap_or(config.revoke.max_trailing_failures);
    let mut result = CandidateResult::new(EvolutionAction::Freeze);

    result.check(
        evidence.trajectory.high_risk_events >= conditions.min_high_risk_events,
        format!(
            "high-risk events {} (minimum {})",
            evidence.trajectory.high_risk_events, conditions.min_high_risk_events
        ),
    );
    result.check(
        evidence.executions.trailing_failures <= spike_tolerance,
        format!(
            "trailing failures {} (spike above {})",
            evidence.executions.trailing_failures, spike_tolerance
        ),
    );

    result.met = result.unmet.is_empty();
    result
}

fn evaluate_revoke(evidence: &Evidence, config: &EvolutionConfig) -> CandidateResult {
    let conditions = &config.revoke;
    let mut result = CandidateResult::new(EvolutionAction::Revoke);

    let failures = evidence.executions.trailing_failures;
    if failures > conditions.max_trailing_failures {
        result.satisfied.push(format!(
            "trailing consecutive failures {} > {}",
            failures, conditions.max_trailing_failures
        ));
    } else {
        result.unmet.push(format!(
            "trailing consecutive failures {} within tolerance {}",
            failures, conditions.max_trailing_failures
        ));
    }

    let violations = evidence.violations.sandbox_violations;
    if violations > conditions.max_sandbox_violations {
        result.satisfied.push(format!(
            "sandbox violations {} > {}",
            violations, conditions.max_sandbox_violations
        ));
    } else {
        result.unmet.push(format!(
            "sandbox violations {} within tolerance {}",
            violations, conditions.max_sandbox_violations
        ));
    }

    result.met = !result.satisfied.is_empty();
    if result.met {
        result.unmet.clear();
    }
    result
}
