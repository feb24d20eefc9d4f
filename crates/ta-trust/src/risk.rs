// risk.rs — Risk score provider contract.
//
// The scoring algorithm itself lives outside this workspace. The tier engine
// and evolution engine consume its output as a black box: a 0–100 score, a
// per-dimension breakdown, and the sample size it was computed from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Output of the risk score provider for one (capability, action) key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    /// Overall risk, 0 (benign) to 100 (dangerous).
    pub score: f64,
    /// Per-dimension scores that make up the overall score.
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    /// Provider's own explanation of the score.
    pub explanation: String,
    /// Number of executions the score was computed from.
    pub sample_size: u64,
    /// Lookback window the score covers.
    pub window_days: u32,
    /// True when the provider failed and this is the conservative default.
    #[serde(default)]
    pub fallback: bool,
}

impl RiskAssessment {
    /// The assessment used when the provider cannot be reached.
    pub fn fallback(score: f64, window_days: u32, cause: &ProviderError) -> Self {
        Self {
            score,
            dimensions: BTreeMap::new(),
            explanation: format!(
                "risk provider failed ({}); using conservative default score {:.1}",
                cause, score
            ),
            sample_size: 0,
            window_days,
            fallback: true,
        }
    }
}

/// Computes a risk score for a capability over a trailing window.
pub trait RiskScoreProvider: Send + Sync {
    fn calculate_risk(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<RiskAssessment, ProviderError>;
}

/// A provider that returns preset scores. Keys without a preset get
/// `default_score`. Can be switched into an unavailable mode to exercise
/// fallback paths.
pub struct FixedRiskProvider {
    default_score: f64,
    scores: Mutex<HashMap<(String, String), f64>>,
    unavailable: Mutex<bool>,
}

impl FixedRiskProvider {
    pub fn new(default_score: f64) -> Self {
        Self {
            default_score,
            scores: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(false),
        }
    }

    /// Preset the score for one key.
    pub fn set_score(&self, capability_id: &str, action_id: &str, score: f64) {
        let mut scores = self.scores.lock().unwrap_or_else(|p| p.into_inner());
        scores.insert((capability_id.to_string(), action_id.to_string()), score);
    }

    /// Make every call fail with `ProviderError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) = unavailable;
    }
}

impl RiskScoreProvider for FixedRiskProvider {
    fn calculate_risk(
        &self,
        capability_id: &str,
        action_id: &str,
        window_days: u32,
    ) -> Result<RiskAssessment, ProviderError> {
        if *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ProviderError::Unavailable("risk scorer offline".to_string()));
        }
        let score = self
            .scores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(capability_id.to_string(), action_id.to_string()))
            .copied()
            .unwrap_or(self.default_score);
        let mut dimensions = BTreeMap::new();
        dimensions.insert("preset".to_string(), score);
        Ok(RiskAssessment {
            score,
            dimensions,
            explanation: format!("preset score for {}/{}", capability_id, action_id),
            sample_size: 0,
            window_days,
            fallback: false,
        })
    }
}
