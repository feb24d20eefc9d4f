// decision.rs — Evolution decisions and their explanations.
//
// A decision is written once as PROPOSED and never edited afterwards, except
// for its review fields: `status`, `review` and `review_id`.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ta_trust::{TrustState, TrustTier};

use crate::conditions::Evaluation;
use crate::evidence::Evidence;

/// Proposed change to a capability's standing. Variant order is priority,
/// lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvolutionAction {
    None,
    Promote,
    Freeze,
    Revoke,
}

impl EvolutionAction {
    pub fn review_level(self) -> ReviewLevel {
        match self {
            EvolutionAction::Promote | EvolutionAction::Revoke => ReviewLevel::HumanRequired,
            EvolutionAction::Freeze | EvolutionAction::None => ReviewLevel::None,
        }
    }
}

impl fmt::Display for EvolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvolutionAction::None => "NONE",
            EvolutionAction::Promote => "PROMOTE",
            EvolutionAction::Freeze => "FREEZE",
            EvolutionAction::Revoke => "REVOKE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewLevel {
    None,
    HumanRequired,
}

impl fmt::Display for ReviewLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewLevel::None => write!(f, "NONE"),
            ReviewLevel::HumanRequired => write!(f, "HUMAN_REQUIRED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Proposed,
    Approved,
    Rejected,
    Expired,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionStatus::Proposed => "PROPOSED",
            DecisionStatus::Approved => "APPROVED",
            DecisionStatus::Rejected => "REJECTED",
            DecisionStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Who reviewed a decision, and when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRecord {
    pub reviewer: String,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

/// A proposed evolution action with its full evidence and explanation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvolutionDecision {
    pub decision_id: Uuid,
    pub capability_id: String,
    pub action_id: String,
    pub action: EvolutionAction,
    pub risk_score: f64,
    pub trust_tier: TrustTier,
    pub trust_trajectory: TrustState,
    pub explanation: String,
    /// Ordered steps from identity to the selected action.
    pub causal_chain: Vec<String>,
    pub review_level: ReviewLevel,
    pub unmet_reasons: Vec<String>,
    pub evidence: Evidence,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: DecisionStatus,
    #[serde(default)]
    pub review: Option<ReviewRecord>,
    /// Handle returned by the review queue on submission.
    #[serde(default)]
    pub review_id: Option<String>,
}

impl EvolutionDecision {
    /// Build a PROPOSED decision from evidence and its evaluation.
    pub fn propose(
        evidence: Evidence,
        evaluation: &Evaluation,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let action = evaluation.selected;
        let expires_at = created_at + ttl;
        Self {
            decision_id: Uuid::new_v4(),
            capability_id: evidence.capability_id.clone(),
            action_id: evidence.action_id.clone(),
            action,
            risk_score: evidence.risk.score,
            trust_tier: evidence.tier.tier,
            trust_trajectory: evidence.trajectory.state,
            explanation: explanation(&evidence, evaluation, expires_at),
            causal_chain: causal_chain(&evidence, action),
            review_level: action.review_level(),
            unmet_reasons: evaluation.unmet_reasons(),
            evidence,
            created_at,
            expires_at,
            status: DecisionStatus::Proposed,
            review: None,
            review_id: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A void decision must not be applied: it was never approved, or the
    /// approval came after expiry.
    pub fn is_void(&self) -> bool {
        if self.status != DecisionStatus::Approved {
            return true;
        }
        match &self.review {
            Some(review) => review.reviewed_at >= self.expires_at,
            None => true,
        }
    }
}

/// identity → risk/tier → trajectory → executions → violations → selection.
pub(crate) fn causal_chain(evidence: &Evidence, action: EvolutionAction) -> Vec<String> {
    let t = &evidence.trajectory;
    let x = &evidence.executions;
    let v = &evidence.violations;
    vec![
        format!(
            "identity: capability {} action {}",
            evidence.capability_id, evidence.action_id
        ),
        format!(
            "risk: score {:.1} ({} tier) from {} samples over {} days{}",
            evidence.risk.score,
            evidence.tier.tier,
            evidence.risk.sample_size,
            evidence.risk.window_days,
            if evidence.risk.fallback { ", provider fallback" } else { "" }
        ),
        format!(
            "trajectory: {} for {:.1}h; {} consecutive successes, {} failures, {} policy rejections, {} high-risk events",
            t.state,
            t.time_in_state_hours,
            t.consecutive_successes,
            t.consecutive_failures,
            t.policy_rejections,
            t.high_risk_events
        ),
        format!(
            "executions: {} in {} days, {} succeeded, trailing failure run {}",
            x.total, evidence.window_days, x.successes, x.trailing_failures
        ),
        format!(
            "violations: {} sandbox violations, {} policy denials, {} human flags",
            v.sandbox_violations, v.policy_denials, v.human_flags
        ),
        format!("selected: {} (review {})", action, action.review_level()),
    ]
}

fn explanation(evidence: &Evidence, evaluation: &Evaluation, expires_at: DateTime<Utc>) -> String {
    let key = format!("{}/{}", evidence.capability_id, evidence.action_id);
    let satisfied = |action| {
        evaluation
            .candidate(action)
            .map(|c| c.satisfied.join("; "))
            .unwrap_or_default()
    };
    let standing = format!(
        "Current standing: {} tier at risk score {:.1}, trajectory {}, {} of {} executions succeeded in the last {} days.",
        evidence.tier.tier,
        evidence.risk.score,
        evidence.trajectory.state,
        evidence.executions.successes,
        evidence.executions.total,
        evidence.window_days
    );

    let paragraphs = match evaluation.selected {
        EvolutionAction::Revoke => {
            let violations = evaluation
                .candidate(EvolutionAction::Revoke)
                .map(|c| c.satisfied.iter().map(|s| format!("- {}", s)).collect::<Vec<_>>())
                .unwrap_or_default();
            vec![
                format!("Triggering violations:\n{}", violations.join("\n")),
                format!("Proposed action: REVOKE {}.", key),
                standing,
                format!(
                    "Revocation requires human review and must be decided before {}.",
                    expires_at.to_rfc3339()
                ),
            ]
        }
        EvolutionAction::Freeze => vec![
            format!("Proposed action: FREEZE {}.", key),
            format!(
                "Sustained high-risk activity without a failure spike: {}.",
                satisfied(EvolutionAction::Freeze)
            ),
            standing,
            "A freeze holds the current standing and may be applied without review.".to_string(),
        ],
        EvolutionAction::Promote => vec![
            format!("Proposed action: PROMOTE {}.", key),
            format!(
                "The capability has built a clean record: {}.",
                satisfied(EvolutionAction::Promote)
            ),
            standing,
            format!(
                "Promotion requires human review and must be decided before {}.",
                expires_at.to_rfc3339()
            ),
        ],
        EvolutionAction::None => vec![
            format!("No action proposed for {}.", key),
            standing,
            format!(
                "No condition set was met:\n{}",
                evaluation
                    .unmet_reasons()
                    .iter()
                    .map(|r| format!("- {}", r))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        ],
    };
    paragraphs.join("\n\n")
}
