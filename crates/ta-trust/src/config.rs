// config.rs — Tier and trajectory configuration.
//
// Loaded as the `[trust]` table of `.ta/governance.toml` (see the
// evolution crate's GovernanceConfig). Every field has a serde default, so
// an empty table yields the documented defaults.

use serde::{Deserialize, Serialize};

use crate::rules::RuleThresholds;

/// Trust configuration: tier mapping plus trajectory thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustConfig {
    #[serde(default)]
    pub tier: TierConfig,

    #[serde(default)]
    pub trajectory: TrajectoryConfig,
}

/// Tier engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    /// Lookback window passed to the risk score provider.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Score used when the risk provider fails. 50.0 maps to MEDIUM.
    #[serde(default = "default_fallback_score")]
    pub fallback_score: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            fallback_score: default_fallback_score(),
        }
    }
}

fn default_lookback_days() -> u32 {
    30
}

fn default_fallback_score() -> f64 {
    50.0
}

/// Trajectory engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryConfig {
    /// Thresholds for the default rule set, used when the store holds no rules.
    #[serde(default)]
    pub thresholds: TrajectoryThresholds,

    /// Weights of the explanatory inertia score.
    #[serde(default)]
    pub inertia: InertiaWeights,
}

/// Per-edge thresholds of the default rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryThresholds {
    #[serde(default = "default_earning_to_stable")]
    pub earning_to_stable: RuleThresholds,

    #[serde(default = "default_stable_to_degrading")]
    pub stable_to_degrading: RuleThresholds,

    #[serde(default = "default_degrading_to_earning")]
    pub degrading_to_earning: RuleThresholds,
}

impl Default for TrajectoryThresholds {
    fn default() -> Self {
        Self {
            earning_to_stable: default_earning_to_stable(),
            stable_to_degrading: default_stable_to_degrading(),
            degrading_to_earning: default_degrading_to_earning(),
        }
    }
}

fn default_earning_to_stable() -> RuleThresholds {
    RuleThresholds {
        min_consecutive_successes: Some(10),
        max_consecutive_failures: None,
        max_policy_rejections: Some(0),
        max_high_risk_events: Some(0),
        min_time_in_state_hours: Some(24.0),
    }
}

// Tolerances: one failure or one rejection is absorbed, the next degrades.
fn default_stable_to_degrading() -> RuleThresholds {
    RuleThresholds {
        min_consecutive_successes: None,
        max_consecutive_failures: Some(2),
        max_policy_rejections: Some(1),
        max_high_risk_events: Some(1),
        min_time_in_state_hours: None,
    }
}

fn default_degrading_to_earning() -> RuleThresholds {
    RuleThresholds {
        min_consecutive_successes: Some(5),
        max_consecutive_failures: None,
        max_policy_rejections: Some(0),
        max_high_risk_events: Some(0),
        min_time_in_state_hours: Some(6.0),
    }
}

/// Weights of the inertia score: `time * min(hours / 168, 1) + success * ratio`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InertiaWeights {
    #[serde(default = "default_time_weight")]
    pub time: f64,

    #[serde(default = "default_success_weight")]
    pub success: f64,
}

impl Default for InertiaWeights {
    fn default() -> Self {
        Self {
            time: default_time_weight(),
            success: default_success_weight(),
        }
    }
}

fn default_time_weight() -> f64 {
    0.4
}

fn default_success_weight() -> f64 {
    0.6
}
