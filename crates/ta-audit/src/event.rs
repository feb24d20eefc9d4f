// event.rs — Governance audit event data model.
//
// An AuditEvent is one line in the audit log. The event type is a dotted
// string ("trust.transition", "policy.denied") rather than a closed enum so
// that collaborators outside this workspace can emit their own types through
// the same sink. The types this workspace emits are listed in `event_types`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event type names emitted by the governance engines.
pub mod event_types {
    /// The quota provider reported the quota as exhausted; the call was denied.
    pub const QUOTA_EXCEEDED: &str = "policy.quota_exceeded";
    /// The quota provider reported the quota as close to its limit.
    pub const QUOTA_WARNING: &str = "policy.quota_warning";
    /// A gate in the policy chain denied an invocation.
    pub const POLICY_DENIED: &str = "policy.denied";
    /// A governed invocation ran (or failed closed) against its backend.
    pub const INVOCATION_EXECUTED: &str = "policy.invocation_executed";
    /// A newly computed tier differs from the last recorded one.
    pub const TIER_CHANGED: &str = "trust.tier_changed";
    /// A trajectory rule fired and the trust state moved along the cycle.
    pub const TRUST_TRANSITION: &str = "trust.transition";
    /// A capability was registered from an external import (always EARNING).
    pub const TRUST_BOOTSTRAP: &str = "trust.bootstrap";
    /// The evolution engine recorded a new proposal.
    pub const EVOLUTION_PROPOSED: &str = "evolution.decision_proposed";
    /// A proposal was handed to the human review queue.
    pub const EVOLUTION_SUBMITTED: &str = "evolution.decision_submitted";
    /// A reviewer approved or rejected a proposal.
    pub const EVOLUTION_REVIEWED: &str = "evolution.decision_reviewed";
    /// A proposal passed its expiry without a review outcome.
    pub const EVOLUTION_EXPIRED: &str = "evolution.decision_expired";
}

/// Severity attached to an audit event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditLevel::Debug => write!(f, "debug"),
            AuditLevel::Info => write!(f, "info"),
            AuditLevel::Warning => write!(f, "warning"),
            AuditLevel::Error => write!(f, "error"),
        }
    }
}

/// A single audit event, one line in the JSONL audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for this event.
    pub event_id: Uuid,

    /// When this event was emitted (UTC).
    pub timestamp: DateTime<Utc>,

    /// Dotted event type (see [`event_types`]).
    pub event_type: String,

    /// Severity of the event.
    pub level: AuditLevel,

    /// Capability the event is about, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,

    /// Action within the capability ("*" for all actions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,

    /// Event-specific structured data.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Hash of the previous line in the log. `None` for the first event.
    pub previous_hash: Option<String>,
}

impl AuditEvent {
    /// Create a new event with the current timestamp and a random id.
    pub fn new(event_type: impl Into<String>, level: AuditLevel) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            level,
            capability_id: None,
            action_id: None,
            payload: serde_json::Value::Null,
            previous_hash: None,
        }
    }

    /// Attach the (capability, action) key this event is about.
    pub fn with_subject(
        mut self,
        capability_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        self.capability_id = Some(capability_id.into());
        self.action_id = Some(action_id.into());
        self
    }

    /// Attach the payload. If the payload names a `capability_id` /
    /// `action_id` and no subject was set, the subject is lifted from it.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        if self.capability_id.is_none() {
            self.capability_id = payload
                .get("capability_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if self.action_id.is_none() {
            self.action_id = payload
                .get("action_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_subject_is_lifted() {
        let event = AuditEvent::new(event_types::TRUST_TRANSITION, AuditLevel::Info).with_payload(
            serde_json::json!({ "capability_id": "web.fetch", "action_id": "get" }),
        );
        assert_eq!(event.capability_id.as_deref(), Some("web.fetch"));
        assert_eq!(event.action_id.as_deref(), Some("get"));
    }

    #[test]
    fn explicit_subject_wins_over_payload() {
        let event = AuditEvent::new(event_types::POLICY_DENIED, AuditLevel::Info)
            .with_subject("fs.write", "*")
            .with_payload(serde_json::json!({ "capability_id": "other" }));
        assert_eq!(event.capability_id.as_deref(), Some("fs.write"));
        assert_eq!(event.action_id.as_deref(), Some("*"));
    }

    #[test]
    fn level_serializes_as_snake_case() {
        let json = serde_json::to_string(&AuditLevel::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }

    #[test]
    fn empty_subject_is_omitted_from_json() {
        let event = AuditEvent::new(event_types::QUOTA_WARNING, AuditLevel::Warning);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("capability_id"));
    }
}
