// config.rs — Policy gate and context-check configuration.
//
// Loaded as the `[policy]` table of `.ta/governance.toml`. Blacklist entries
// are glob patterns over side-effect tags, so "net:*" covers "net:http" and
// "net:smtp".

use glob::Pattern;
use serde::{Deserialize, Serialize};

use ta_trust::TrustTier;

use crate::error::PolicyError;
use crate::tool::ToolTrustTier;

/// Policy engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    #[serde(default)]
    pub blacklists: BlacklistConfig,

    /// Registration tiers whose tools need an admin token by default.
    #[serde(default = "default_admin_approval_tiers")]
    pub admin_approval_tiers: Vec<ToolTrustTier>,

    #[serde(default)]
    pub context: ContextLimits,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            blacklists: BlacklistConfig::default(),
            admin_approval_tiers: default_admin_approval_tiers(),
            context: ContextLimits::default(),
        }
    }
}

fn default_admin_approval_tiers() -> Vec<ToolTrustTier> {
    vec![ToolTrustTier::T3]
}

/// Side-effect blacklists per registration tier plus a global list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlacklistConfig {
    #[serde(default)]
    pub t0: Vec<String>,

    #[serde(default = "default_t1")]
    pub t1: Vec<String>,

    #[serde(default = "default_t2")]
    pub t2: Vec<String>,

    /// T3 tools may only cause side effects they explicitly allow.
    #[serde(default = "default_true")]
    pub t3_deny_unless_allowed: bool,

    /// Denied for every tier; `allowed_side_effects` does not override it.
    #[serde(default = "default_global")]
    pub global: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            t0: Vec::new(),
            t1: default_t1(),
            t2: default_t2(),
            t3_deny_unless_allowed: default_true(),
            global: default_global(),
        }
    }
}

impl BlacklistConfig {
    /// The tier-specific list. T3 has none; it is governed by
    /// `t3_deny_unless_allowed` instead.
    pub fn for_tier(&self, tier: ToolTrustTier) -> &[String] {
        match tier {
            ToolTrustTier::T0 => &self.t0,
            ToolTrustTier::T1 => &self.t1,
            ToolTrustTier::T2 => &self.t2,
            ToolTrustTier::T3 => &[],
        }
    }
}

fn default_t1() -> Vec<String> {
    vec!["payments".to_string()]
}

fn default_t2() -> Vec<String> {
    vec![
        "payments".to_string(),
        "credentials".to_string(),
        "system_exec".to_string(),
    ]
}

fn default_global() -> Vec<String> {
    vec![
        "privilege_escalation".to_string(),
        "data_exfiltration".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

/// Limits applied by the context checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextLimits {
    /// Executions per UTC day for a LOW-tier capability.
    #[serde(default = "default_daily_limit_low")]
    pub daily_limit_low: u64,

    #[serde(default = "default_daily_limit_medium")]
    pub daily_limit_medium: u64,

    #[serde(default = "default_daily_limit_high")]
    pub daily_limit_high: u64,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            daily_limit_low: default_daily_limit_low(),
            daily_limit_medium: default_daily_limit_medium(),
            daily_limit_high: default_daily_limit_high(),
        }
    }
}

impl ContextLimits {
    pub fn daily_limit(&self, tier: TrustTier) -> u64 {
        match tier {
            TrustTier::Low => self.daily_limit_low,
            TrustTier::Medium => self.daily_limit_medium,
            TrustTier::High => self.daily_limit_high,
        }
    }
}

fn default_daily_limit_low() -> u64 {
    1000
}

fn default_daily_limit_medium() -> u64 {
    200
}

fn default_daily_limit_high() -> u64 {
    50
}

/// Blacklists with their patterns compiled.
#[derive(Debug, Clone)]
pub(crate) struct CompiledBlacklists {
    tiers: [Vec<Pattern>; 3],
    global: Vec<Pattern>,
    pub(crate) t3_deny_unless_allowed: bool,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| PolicyError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl CompiledBlacklists {
    pub(crate) fn compile(config: &BlacklistConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            tiers: [
                compile(&config.t0)?,
                compile(&config.t1)?,
                compile(&config.t2)?,
            ],
            global: compile(&config.global)?,
            t3_deny_unless_allowed: config.t3_deny_unless_allowed,
        })
    }

    /// First pattern of the tier list that matches `effect`.
    pub(crate) fn tier_match(&self, tier: ToolTrustTier, effect: &str) -> Option<&Pattern> {
        let list: &[Pattern] = match tier {
            ToolTrustTier::T0 => &self.tiers[0],
            ToolTrustTier::T1 => &self.tiers[1],
            ToolTrustTier::T2 => &self.tiers[2],
            ToolTrustTier::T3 => &[],
        };
        list.iter().find(|p| p.matches(effect))
    }

    pub(crate) fn global_match(&self, effect: &str) -> Option<&Pattern> {
        self.global.iter().find(|p| p.matches(effect))
    }
}
