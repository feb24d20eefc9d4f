// tier.rs — Trust tiers: risk score → LOW / MEDIUM / HIGH.
//
// Tier mapping is a pure function of the risk score with fixed bands:
//
//   [0, 30)   LOW     auto-execution allowed
//   [30, 70)  MEDIUM  auto-execution allowed
//   [70, 100] HIGH    sandbox required, no auto-execution
//
// The TierEngine asks the risk provider for a score, maps it, and appends a
// TierChangeRecord whenever the tier differs from the last recorded one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ta_audit::{event_types, AuditLevel, AuditSink};

use crate::clock::Clock;
use crate::config::TierConfig;
use crate::error::TrustError;
use crate::locks::KeyLocks;
use crate::risk::{RiskAssessment, RiskScoreProvider};
use crate::state::TrustKey;
use crate::store::TrustStore;

/// Lowest score that maps to MEDIUM.
pub const MEDIUM_FLOOR: f64 = 30.0;
/// Lowest score that maps to HIGH.
pub const HIGH_FLOOR: f64 = 70.0;

/// Risk-derived trust tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustTier {
    Low,
    Medium,
    High,
}

impl TrustTier {
    /// HIGH-tier capabilities only ever run sandboxed.
    pub fn requires_sandbox(self) -> bool {
        matches!(self, TrustTier::High)
    }

    pub fn allows_auto_execution(self) -> bool {
        matches!(self, TrustTier::Low | TrustTier::Medium)
    }

    /// Half-open score band `[low, high)`; HIGH includes 100.
    pub fn band(self) -> (f64, f64) {
        match self {
            TrustTier::Low => (0.0, MEDIUM_FLOOR),
            TrustTier::Medium => (MEDIUM_FLOOR, HIGH_FLOOR),
            TrustTier::High => (HIGH_FLOOR, 100.0),
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustTier::Low => write!(f, "LOW"),
            TrustTier::Medium => write!(f, "MEDIUM"),
            TrustTier::High => write!(f, "HIGH"),
        }
    }
}

/// Clamp a score into [0, 100]. Non-finite scores become 100.
pub fn normalize_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        100.0
    }
}

/// Map a risk score to its tier.
pub fn map_tier(score: f64) -> TrustTier {
    let score = normalize_score(score);
    if score >= HIGH_FLOOR {
        TrustTier::High
    } else if score >= MEDIUM_FLOOR {
        TrustTier::Medium
    } else {
        TrustTier::Low
    }
}

/// The tier of a key at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierInfo {
    pub tier: TrustTier,
    pub risk_score: f64,
    pub explanation: String,
    pub previous_tier: Option<TrustTier>,
    /// True when this computation wrote a TierChangeRecord (first
    /// computation for the key, or a different tier than last recorded).
    pub changed: bool,
    pub calculated_at: DateTime<Utc>,
}

/// Append-only record of a tier change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierChangeRecord {
    pub record_id: Uuid,
    pub capability_id: String,
    pub action_id: String,
    pub old_tier: Option<TrustTier>,
    pub new_tier: TrustTier,
    pub risk_score: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TierChangeRecord {
    pub fn key(&self) -> TrustKey {
        TrustKey {
            capability_id: self.capability_id.clone(),
            action_id: self.action_id.clone(),
        }
    }
}

/// Computes tiers and keeps the tier-change history.
pub struct TierEngine {
    risk: Arc<dyn RiskScoreProvider>,
    store: Arc<dyn TrustStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: TierConfig,
    locks: KeyLocks,
}

impl TierEngine {
    pub fn new(
        risk: Arc<dyn RiskScoreProvider>,
        store: Arc<dyn TrustStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        config: TierConfig,
    ) -> Self {
        Self {
            risk,
            store,
            clock,
            audit,
            config,
            locks: KeyLocks::default(),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Current tier of a key.
    pub fn get_tier(&self, capability_id: &str, action_id: &str) -> Result<TierInfo, TrustError> {
        self.assess(capability_id, action_id).map(|(_, info)| info)
    }

    /// Risk assessment plus tier, consulting the risk provider once.
    ///
    /// A provider failure is absorbed: the configured fallback score is used
    /// and the assessment is flagged `fallback`. Store failures are returned.
    pub fn assess(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<(RiskAssessment, TierInfo), TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        let window = self.config.lookback_days;

        let assessment = match self.risk.calculate_risk(capability_id, action_id, window) {
            Ok(assessment) => assessment,
            Err(e) => {
                tracing::warn!(
                    capability_id = %capability_id,
                    action_id = %action_id,
                    fallback_score = self.config.fallback_score,
                    "risk provider failed, using fallback score: {}",
                    e
                );
                RiskAssessment::fallback(self.config.fallback_score, window, &e)
            }
        };

        let score = normalize_score(assessment.score);
        let tier = map_tier(score);
        let now = self.clock.now();

        let lock = self.locks.for_key(&key)?;
        let _guard = lock.lock()?;

        let previous_tier = self.store.last_tier_change(&key)?.map(|r| r.new_tier);
        let changed = previous_tier != Some(tier);

        if changed {
            let reason = match previous_tier {
                Some(old) => format!(
                    "risk score {:.1} moved tier from {} to {}",
                    score, old, tier
                ),
                None => format!("initial tier {} from risk score {:.1}", tier, score),
            };
            let record = TierChangeRecord {
                record_id: Uuid::new_v4(),
                capability_id: key.capability_id.clone(),
                action_id: key.action_id.clone(),
                old_tier: previous_tier,
                new_tier: tier,
                risk_score: score,
                reason: reason.clone(),
                created_at: now,
            };
            self.store.append_tier_change(&record)?;
            tracing::info!(
                capability_id = %key.capability_id,
                action_id = %key.action_id,
                tier = %tier,
                "trust tier changed"
            );
            self.audit.emit(
                event_types::TIER_CHANGED,
                serde_json::json!({
                    "capability_id": key.capability_id,
                    "action_id": key.action_id,
                    "old_tier": previous_tier,
                    "new_tier": tier,
                    "risk_score": score,
                    "reason": reason,
                    "fallback": assessment.fallback,
                }),
                AuditLevel::Info,
            );
        }

        let (low, high) = tier.band();
        let mut explanation = format!(
            "risk score {:.1} over the last {} days falls in the {} band [{:.0}, {:.0}{}",
            score,
            window,
            tier,
            low,
            high,
            if tier == TrustTier::High { "]" } else { ")" }
        );
        if assessment.fallback {
            explanation.push_str("; risk provider unavailable, conservative default applied");
        }

        let info = TierInfo {
            tier,
            risk_score: score,
            explanation,
            previous_tier,
            changed,
            calculated_at: now,
        };
        Ok((assessment, info))
    }

    /// Tier changes recorded for a key, oldest first.
    pub fn tier_history(
        &self,
        capability_id: &str,
        action_id: &str,
    ) -> Result<Vec<TierChangeRecord>, TrustError> {
        let key = TrustKey::new(capability_id, action_id)?;
        self.store.tier_changes(&key)
    }
}
