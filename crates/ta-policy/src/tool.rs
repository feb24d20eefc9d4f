// tool.rs — Tool descriptors and invocation requests.
//
// A ToolDescriptor is the static description of a capability: whether it is
// enabled, which side effects it declares, its risk level and the trust tier
// it was registered at. An Invocation is one request to run it.
//
// Side effects are short tags ("payments", "net:http", "fs:write"). Policy
// blacklists match them with glob patterns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;

/// Declared risk level of a tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    /// Always requires admin approval.
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Registration trust tier of a tool. T0 is the most trusted, T3 the least.
///
/// Distinct from the risk-derived `TrustTier`: this one is assigned when the
/// tool is registered and selects the side-effect blacklist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolTrustTier {
    T0,
    T1,
    T2,
    T3,
}

impl fmt::Display for ToolTrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolTrustTier::T0 => write!(f, "T0"),
            ToolTrustTier::T1 => write!(f, "T1"),
            ToolTrustTier::T2 => write!(f, "T2"),
            ToolTrustTier::T3 => write!(f, "T3"),
        }
    }
}

/// Static description of a governed tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub tool_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Side effects the tool may cause.
    #[serde(default)]
    pub side_effects: Vec<String>,
    pub risk_level: RiskLevel,
    pub trust_tier: ToolTrustTier,
    #[serde(default)]
    pub requires_admin_approval: bool,
    /// Side effects explicitly allowed for a T3 tool.
    #[serde(default)]
    pub allowed_side_effects: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ToolDescriptor {
    /// An enabled tool with no side effects.
    pub fn new(tool_id: impl Into<String>, risk_level: RiskLevel, trust_tier: ToolTrustTier) -> Self {
        Self {
            tool_id: tool_id.into(),
            enabled: true,
            side_effects: Vec::new(),
            risk_level,
            trust_tier,
            requires_admin_approval: false,
            allowed_side_effects: Vec::new(),
        }
    }

    pub fn with_side_effects<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.side_effects = effects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_side_effects<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_side_effects = effects.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring_admin_approval(mut self) -> Self {
        self.requires_admin_approval = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn has_side_effects(&self) -> bool {
        !self.side_effects.is_empty()
    }
}

/// Whether the invocation is planning (read-only) or executing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationMode {
    Planning,
    Execution,
}

impl fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationMode::Planning => write!(f, "PLANNING"),
            InvocationMode::Execution => write!(f, "EXECUTION"),
        }
    }
}

/// One request to run a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    pub invocation_id: Uuid,
    /// Tool being invoked; also the capability id for trust tracking.
    pub tool_id: String,
    /// Action within the tool.
    pub action_id: String,
    pub session_id: String,
    /// Who asked for the call.
    pub actor: String,
    pub mode: InvocationMode,
    #[serde(default)]
    pub spec_frozen: bool,
    #[serde(default)]
    pub spec_hash: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub inputs: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

impl Invocation {
    /// An execution-mode invocation with no spec, task or project binding.
    pub fn new(
        tool_id: impl Into<String>,
        action_id: impl Into<String>,
        session_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            tool_id: tool_id.into(),
            action_id: action_id.into(),
            session_id: session_id.into(),
            actor: actor.into(),
            mode: InvocationMode::Execution,
            spec_frozen: false,
            spec_hash: None,
            task_id: None,
            project_id: None,
            inputs: serde_json::Value::Null,
            requested_at: Utc::now(),
        }
    }

    pub fn planning(mut self) -> Self {
        self.mode = InvocationMode::Planning;
        self
    }

    pub fn with_frozen_spec(mut self, spec_hash: impl Into<String>) -> Self {
        self.spec_frozen = true;
        self.spec_hash = Some(spec_hash.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Stamp the request time, e.g. from an injected clock.
    pub fn at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = requested_at;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Structural checks run before any gate.
    pub fn validate_against(&self, tool: &ToolDescriptor) -> Result<(), PolicyError> {
        if tool.tool_id.trim().is_empty() {
            return Err(PolicyError::validation("tool id is empty"));
        }
        if self.tool_id != tool.tool_id {
            return Err(PolicyError::validation(format!(
                "invocation targets '{}' but descriptor is for '{}'",
                self.tool_id, tool.tool_id
            )));
        }
        if self.action_id.trim().is_empty() {
            return Err(PolicyError::validation("action id is empty"));
        }
        if self.actor.trim().is_empty() {
            return Err(PolicyError::validation("actor is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_from_json() {
        let tool: ToolDescriptor = serde_json::from_str(
            r#"{ "tool_id": "pay.charge", "risk_level": "CRITICAL", "trust_tier": "T2" }"#,
        )
        .unwrap();
        assert!(tool.enabled);
        assert!(!tool.has_side_effects());
        assert_eq!(tool.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn validation_catches_mismatch_and_empty_actor() {
        let tool = ToolDescriptor::new("web.fetch", RiskLevel::Low, ToolTrustTier::T1);
        let ok = Invocation::new("web.fetch", "get", "s-1", "alice");
        assert!(ok.validate_against(&tool).is_ok());

        let other = Invocation::new("fs.write", "append", "s-1", "alice");
        assert!(matches!(
            other.validate_against(&tool),
            Err(PolicyError::Validation { .. })
        ));

        let anonymous = Invocation::new("web.fetch", "get", "s-1", "  ");
        assert!(anonymous.validate_against(&tool).is_err());

        let unnamed = ToolDescriptor::new("", RiskLevel::Low, ToolTrustTier::T1);
        let inv = Invocation::new("", "get", "s-1", "alice");
        assert!(inv.validate_against(&unnamed).is_err());
    }

    #[test]
    fn tiers_order_from_most_trusted() {
        assert!(ToolTrustTier::T0 < ToolTrustTier::T3);
        assert_eq!(ToolTrustTier::T2.to_string(), "T2");
    }
}
