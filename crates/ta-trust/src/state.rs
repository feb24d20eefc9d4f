// state.rs — Trust trajectory states, per-key records, and transitions.
//
// The trajectory of a capability is a three-state cycle:
//
//   EARNING → STABLE → DEGRADING → EARNING
//
// There is exactly one outgoing edge per state. `TransitionEdge` is the only
// way to name a move between states and cannot be built for any other pair,
// so self-transitions and skips (EARNING → DEGRADING, DEGRADING → STABLE)
// are unrepresentable in the engine. Stores re-check the edge before writing
// because records can also arrive through deserialization.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrustError;

/// Action id meaning "all actions of this capability".
pub const WILDCARD_ACTION: &str = "*";

/// Behavioral trust state of a capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustState {
    /// Accumulating evidence; every new or recovering capability starts here.
    Earning,
    /// Trust established.
    Stable,
    /// Trust lost; must earn it back.
    Degrading,
}

impl TrustState {
    /// The only state this one may move to.
    pub fn successor(self) -> TrustState {
        match self {
            TrustState::Earning => TrustState::Stable,
            TrustState::Stable => TrustState::Degrading,
            TrustState::Degrading => TrustState::Earning,
        }
    }

    /// Whether `self → next` is an edge of the cycle.
    pub fn can_transition_to(self, next: TrustState) -> bool {
        self.successor() == next
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustState::Earning => write!(f, "EARNING"),
            TrustState::Stable => write!(f, "STABLE"),
            TrustState::Degrading => write!(f, "DEGRADING"),
        }
    }
}

/// A valid move between two trust states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEdge {
    from: TrustState,
    to: TrustState,
}

impl TransitionEdge {
    /// Build an edge, rejecting any pair outside the cycle.
    pub fn new(from: TrustState, to: TrustState) -> Result<Self, TrustError> {
        if from.can_transition_to(to) {
            Ok(Self { from, to })
        } else {
            Err(TrustError::InvalidTransition { from, to })
        }
    }

    /// The single outgoing edge of `from`.
    pub fn outgoing(from: TrustState) -> Self {
        Self {
            from,
            to: from.successor(),
        }
    }

    pub fn from(&self) -> TrustState {
        self.from
    }

    pub fn to(&self) -> TrustState {
        self.to
    }
}

/// Execution outcome reported to the trajectory engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustEvent {
    Success,
    Failure,
    PolicyRejection,
    HighRisk,
}

impl fmt::Display for TrustEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustEvent::Success => write!(f, "success"),
            TrustEvent::Failure => write!(f, "failure"),
            TrustEvent::PolicyRejection => write!(f, "policy_rejection"),
            TrustEvent::HighRisk => write!(f, "high_risk"),
        }
    }
}

/// Identity of one trust record: a capability and one of its actions, or
/// the wildcard bucket `*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustKey {
    pub capability_id: String,
    pub action_id: String,
}

impl TrustKey {
    pub fn new(
        capability_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Result<Self, TrustError> {
        let capability_id = capability_id.into();
        let action_id = action_id.into();
        for (field, value) in [("capability_id", &capability_id), ("action_id", &action_id)] {
            if value.trim().is_empty() {
                return Err(TrustError::InvalidKey {
                    reason: format!("{} must not be empty", field),
                });
            }
            if value.chars().any(char::is_control) {
                return Err(TrustError::InvalidKey {
                    reason: format!("{} contains control characters", field),
                });
            }
        }
        Ok(Self {
            capability_id,
            action_id,
        })
    }

    /// The wildcard bucket for a capability.
    pub fn wildcard(capability_id: impl Into<String>) -> Result<Self, TrustError> {
        Self::new(capability_id, WILDCARD_ACTION)
    }

    pub fn is_wildcard(&self) -> bool {
        self.action_id == WILDCARD_ACTION
    }
}

impl fmt::Display for TrustKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.capability_id, self.action_id)
    }
}

/// Per-key trajectory state and the counters the rules are evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustStateRecord {
    pub capability_id: String,
    pub action_id: String,
    pub current_state: TrustState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub policy_rejections: u32,
    pub high_risk_events: u32,
    pub state_entered_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TrustStateRecord {
    /// A fresh record: EARNING with every counter at zero.
    pub fn new(key: &TrustKey, now: DateTime<Utc>) -> Self {
        Self {
            capability_id: key.capability_id.clone(),
            action_id: key.action_id.clone(),
            current_state: TrustState::Earning,
            consecutive_successes: 0,
            consecutive_failures: 0,
            policy_rejections: 0,
            high_risk_events: 0,
            state_entered_at: now,
            last_event_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> TrustKey {
        TrustKey {
            capability_id: self.capability_id.clone(),
            action_id: self.action_id.clone(),
        }
    }

    /// Apply one event to the counters.
    ///
    /// A success breaks the failure streak; any negative event breaks the
    /// success streak. Rejection and high-risk counts are not cleared by
    /// successes; only a transition clears them.
    pub fn apply_event(&mut self, event: TrustEvent, at: DateTime<Utc>) {
        match event {
            TrustEvent::Success => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.consecutive_failures = 0;
            }
            TrustEvent::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            TrustEvent::PolicyRejection => {
                self.consecutive_successes = 0;
                self.policy_rejections = self.policy_rejections.saturating_add(1);
            }
            TrustEvent::HighRisk => {
                self.consecutive_successes = 0;
                self.high_risk_events = self.high_risk_events.saturating_add(1);
            }
        }
        self.last_event_at = Some(at);
        self.updated_at = at;
    }

    /// Move along `edge`, resetting all counters and the dwell clock.
    pub fn enter(&mut self, edge: TransitionEdge, at: DateTime<Utc>) -> Result<(), TrustError> {
        if edge.from() != self.current_state {
            return Err(TrustError::InvalidTransition {
                from: self.current_state,
                to: edge.to(),
            });
        }
        self.current_state = edge.to();
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.policy_rejections = 0;
        self.high_risk_events = 0;
        self.state_entered_at = at;
        self.updated_at = at;
        Ok(())
    }

    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now - self.state_entered_at;
        if elapsed < Duration::zero() {
            Duration::zero()
        } else {
            elapsed
        }
    }

    pub fn hours_in_state(&self, now: DateTime<Utc>) -> f64 {
        self.time_in_state(now).num_seconds() as f64 / 3600.0
    }
}

/// An append-only record of one state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustTransition {
    pub transition_id: Uuid,
    pub capability_id: String,
    pub action_id: String,
    pub old_state: TrustState,
    pub new_state: TrustState,
    pub trigger_event: TrustEvent,
    /// Rule that fired.
    pub rule_id: String,
    /// Human-readable explanation.
    pub explain: String,
    /// Risk score and counters at the moment of the transition.
    pub risk_context: serde_json::Value,
    /// Policy decision that accompanied the triggering event, if any.
    pub policy_context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TrustTransition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: &TrustKey,
        edge: TransitionEdge,
        trigger_event: TrustEvent,
        rule_id: impl Into<String>,
        explain: impl Into<String>,
        risk_context: serde_json::Value,
        policy_context: Option<serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transition_id: Uuid::new_v4(),
            capability_id: key.capability_id.clone(),
            action_id: key.action_id.clone(),
            old_state: edge.from(),
            new_state: edge.to(),
            trigger_event,
            rule_id: rule_id.into(),
            explain: explain.into(),
            risk_context,
            policy_context,
            created_at,
        }
    }

    /// Re-check the state pair. Stores call this before writing.
    pub fn validate(&self) -> Result<TransitionEdge, TrustError> {
        TransitionEdge::new(self.old_state, self.new_state)
    }
}
