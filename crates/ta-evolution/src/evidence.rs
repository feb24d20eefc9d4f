// evidence.rs — The evidence an evolution decision is based on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ta_trust::{RiskAssessment, TierInfo, TrajectoryInfo, TrustState, TrustTier};

use crate::history::{ExecutionStats, ViolationStats};

/// Trajectory counters at the time evidence was gathered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectorySnapshot {
    pub state: TrustState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub policy_rejections: u32,
    pub high_risk_events: u32,
    pub time_in_state_hours: f64,
    pub inertia_score: f64,
}

impl From<&TrajectoryInfo> for TrajectorySnapshot {
    fn from(info: &TrajectoryInfo) -> Self {
        Self {
            state: info.state,
            consecutive_successes: info.consecutive_successes,
            consecutive_failures: info.consecutive_failures,
            policy_rejections: info.policy_rejections,
            high_risk_events: info.high_risk_events,
            time_in_state_hours: info.time_in_state_hours,
            inertia_score: info.inertia_score,
        }
    }
}

/// Everything `evaluate` looks at for one (capability, action) key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub capability_id: String,
    pub action_id: String,
    pub risk: RiskAssessment,
    pub tier: TierInfo,
    pub trajectory: TrajectorySnapshot,
    pub executions: ExecutionStats,
    pub violations: ViolationStats,
    pub window_days: u32,
    pub gathered_at: DateTime<Utc>,
}

impl Evidence {
    pub fn tier(&self) -> TrustTier {
        self.tier.tier
    }

    pub fn state(&self) -> TrustState {
        self.trajectory.state
    }
}
