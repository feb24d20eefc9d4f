// rules.rs — Trajectory rules and their threshold evaluation.
//
// A rule names one edge of the trust cycle and a set of optional thresholds
// over the record's counters and dwell time. How the thresholds combine
// depends on the edge:
//
// - STABLE → DEGRADING matches when ANY configured tolerance is exceeded.
//   Trust is lost on a single bad signal.
// - Every other edge matches when ALL configured conditions hold. Trust is
//   earned only when everything lines up.
//
// `max_*` values are tolerances: they are exceeded when the counter is
// strictly greater. `min_*` values are reached when the counter (or dwell
// hours) is at least the minimum. A rule with no configured condition never
// matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrajectoryThresholds;
use crate::error::TrustError;
use crate::state::{TransitionEdge, TrustState, TrustStateRecord};

/// Optional thresholds of one rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_consecutive_successes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_policy_rejections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_high_risk_events: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time_in_state_hours: Option<f64>,
}

impl RuleThresholds {
    pub fn is_empty(&self) -> bool {
        self.min_consecutive_successes.is_none()
            && self.max_consecutive_failures.is_none()
            && self.max_policy_rejections.is_none()
            && self.max_high_risk_events.is_none()
            && self.min_time_in_state_hours.is_none()
    }
}

/// One state-machine rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryRule {
    pub rule_id: String,
    pub from_state: TrustState,
    pub to_state: TrustState,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thresholds: RuleThresholds,
}

/// How a rule's conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Every configured condition must hold.
    All,
    /// Any exceeded tolerance triggers the rule.
    Any,
}

impl MatchMode {
    pub fn for_edge(edge: TransitionEdge) -> Self {
        if edge.from() == TrustState::Stable && edge.to() == TrustState::Degrading {
            MatchMode::Any
        } else {
            MatchMode::All
        }
    }
}

/// Whether a condition is a floor or a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Minimum,
    Tolerance,
}

/// One configured condition evaluated against a record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionCheck {
    pub name: &'static str,
    pub kind: ConditionKind,
    pub observed: f64,
    pub threshold: f64,
    /// Minimum reached, or tolerance respected.
    pub satisfied: bool,
}

impl ConditionCheck {
    fn minimum(name: &'static str, observed: f64, threshold: f64) -> Self {
        Self {
            name,
            kind: ConditionKind::Minimum,
            observed,
            threshold,
            satisfied: observed >= threshold,
        }
    }

    fn tolerance(name: &'static str, observed: u32, threshold: u32) -> Self {
        Self {
            name,
            kind: ConditionKind::Tolerance,
            observed: f64::from(observed),
            threshold: f64::from(threshold),
            satisfied: observed <= threshold,
        }
    }

    /// Short human-readable rendering, e.g. "consecutive_failures 3 > 2".
    pub fn describe(&self) -> String {
        let op = match (self.kind, self.satisfied) {
            (ConditionKind::Minimum, true) => ">=",
            (ConditionKind::Minimum, false) => "<",
            (ConditionKind::Tolerance, true) => "<=",
            (ConditionKind::Tolerance, false) => ">",
        };
        format!(
            "{} {} {} {}",
            self.name,
            trim_number(self.observed),
            op,
            trim_number(self.threshold)
        )
    }
}

fn trim_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{:.0}", v)
    } else {
        format!("{:.1}", v)
    }
}

/// Result of evaluating one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub matched: bool,
    pub mode: MatchMode,
    pub checks: Vec<ConditionCheck>,
}

impl RuleOutcome {
    /// The conditions that caused the match: all of them in `All` mode, the
    /// exceeded tolerances in `Any` mode.
    pub fn fired(&self) -> Vec<&ConditionCheck> {
        match self.mode {
            MatchMode::All => self.checks.iter().collect(),
            MatchMode::Any => self
                .checks
                .iter()
                .filter(|c| c.kind == ConditionKind::Tolerance && !c.satisfied)
                .collect(),
        }
    }
}

impl TrajectoryRule {
    pub fn new(
        rule_id: impl Into<String>,
        edge: TransitionEdge,
        priority: i32,
        thresholds: RuleThresholds,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            from_state: edge.from(),
            to_state: edge.to(),
            priority,
            description: String::new(),
            thresholds,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The edge this rule moves along; fails for pairs outside the cycle.
    pub fn edge(&self) -> Result<TransitionEdge, TrustError> {
        TransitionEdge::new(self.from_state, self.to_state)
    }

    /// Evaluate the thresholds against a record.
    pub fn evaluate(&self, record: &TrustStateRecord, now: DateTime<Utc>) -> RuleOutcome {
        let mode = match self.edge() {
            Ok(edge) => MatchMode::for_edge(edge),
            Err(_) => {
                return RuleOutcome {
                    matched: false,
                    mode: MatchMode::All,
                    checks: Vec::new(),
                }
            }
        };

        let t = &self.thresholds;
        let mut checks = Vec::new();
        if let Some(min) = t.min_consecutive_successes {
            checks.push(ConditionCheck::minimum(
                "consecutive_successes",
                f64::from(record.consecutive_successes),
                f64::from(min),
            ));
        }
        if let Some(max) = t.max_consecutive_failures {
            checks.push(ConditionCheck::tolerance(
                "consecutive_failures",
                record.consecutive_failures,
                max,
            ));
        }
        if let Some(max) = t.max_policy_rejections {
            checks.push(ConditionCheck::tolerance(
                "policy_rejections",
                record.policy_rejections,
                max,
            ));
        }
        if let Some(max) = t.max_high_risk_events {
            checks.push(ConditionCheck::tolerance(
                "high_risk_events",
                record.high_risk_events,
                max,
            ));
        }
        if let Some(min) = t.min_time_in_state_hours {
            checks.push(ConditionCheck::minimum(
                "time_in_state_hours",
                record.hours_in_state(now),
                min,
            ));
        }

        let matched = match mode {
            MatchMode::All => !checks.is_empty() && checks.iter().all(|c| c.satisfied),
            MatchMode::Any => checks
                .iter()
                .any(|c| c.kind == ConditionKind::Tolerance && !c.satisfied),
        };

        RuleOutcome {
            matched,
            mode,
            checks,
        }
    }
}

/// Pick the first matching rule for the record's current state.
///
/// Rules for other states are skipped; rules naming an invalid edge are
/// skipped with a warning. Candidates run in ascending priority, ties broken
/// by rule id.
pub fn select_rule<'a>(
    rules: &'a [TrajectoryRule],
    record: &TrustStateRecord,
    now: DateTime<Utc>,
) -> Option<(&'a TrajectoryRule, RuleOutcome)> {
    let mut candidates: Vec<&TrajectoryRule> = rules
        .iter()
        .filter(|r| r.from_state == record.current_state)
        .filter(|r| match r.edge() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(rule_id = %r.rule_id, "skipping trajectory rule: {}", e);
                false
            }
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    for rule in candidates {
        let outcome = rule.evaluate(record, now);
        tracing::debug!(
            rule_id = %rule.rule_id,
            matched = outcome.matched,
            "evaluated trajectory rule"
        );
        if outcome.matched {
            return Some((rule, outcome));
        }
    }
    None
}

/// The built-in rule set, one rule per edge.
pub fn default_rules(thresholds: &TrajectoryThresholds) -> Vec<TrajectoryRule> {
    vec![
        TrajectoryRule::new(
            "earning_to_stable",
            TransitionEdge::outgoing(TrustState::Earning),
            10,
            thresholds.earning_to_stable.clone(),
        )
        .with_description("sustained clean successes after a minimum dwell"),
        TrajectoryRule::new(
            "stable_to_degrading",
            TransitionEdge::outgoing(TrustState::Stable),
            10,
            thresholds.stable_to_degrading.clone(),
        )
        .with_description("any tolerance for failures, rejections or high-risk events exceeded"),
        TrajectoryRule::new(
            "degrading_to_earning",
            TransitionEdge::outgoing(TrustState::Degrading),
            10,
            thresholds.degrading_to_earning.clone(),
        )
        .with_description("clean recovery streak after a minimum dwell"),
    ]
}
