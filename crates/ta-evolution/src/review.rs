// review.rs — Routing decisions to human review.
//
// PROMOTE and REVOKE always go to a human through the review queue. FREEZE
// can be applied by the caller without review, and NONE needs nothing. The
// engine never applies a decision itself.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ta_trust::ProviderError;

use crate::decision::EvolutionDecision;

/// The human review collaborator.
pub trait ReviewQueue: Send + Sync {
    /// Hand a decision to reviewers. Returns the queue's handle for it.
    fn submit_for_review(
        &self,
        decision: &EvolutionDecision,
        timeout_hours: u32,
    ) -> Result<String, ProviderError>;
}

/// What `submit_for_review` did with a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "routing")]
pub enum ReviewRouting {
    /// Queued for a human; the decision now carries `review_id`.
    Submitted { review_id: String },
    /// FREEZE: the caller may apply it directly.
    AutoApplicable,
    /// NONE: nothing to do.
    NoActionRequired,
}

/// One submission seen by `InMemoryReviewQueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedReview {
    pub review_id: String,
    pub decision_id: Uuid,
    pub timeout_hours: u32,
}

/// Review queue that keeps submissions in memory, for embedding and tests.
#[derive(Default)]
pub struct InMemoryReviewQueue {
    queued: Mutex<Vec<QueuedReview>>,
    unavailable: Mutex<bool>,
}

impl InMemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> Vec<QueuedReview> {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) = unavailable;
    }
}

impl ReviewQueue for InMemoryReviewQueue {
    fn submit_for_review(
        &self,
        decision: &EvolutionDecision,
        timeout_hours: u32,
    ) -> Result<String, ProviderError> {
        if *self.unavailable.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(ProviderError::Unavailable(
                "review queue is unavailable".to_string(),
            ));
        }
        let review_id = format!("review-{}", Uuid::new_v4());
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(QueuedReview {
                review_id: review_id.clone(),
                decision_id: decision.decision_id,
                timeout_hours,
            });
        Ok(review_id)
    }
}
