//! # ta-evolution
//!
//! Evidence-based evolution decisions for governed capabilities.
//!
//! The [`EvolutionEngine`] is the top of the governance stack. For a
//! (capability, action) key it gathers an [`Evidence`] bundle (risk score
//! and tier from `ta_trust::TierEngine`, trajectory counters from
//! `ta_trust::TrajectoryEngine`, windowed execution and violation counts
//! from a [`HistoryStore`]), evaluates the PROMOTE, FREEZE and REVOKE
//! condition sets, and records the highest-priority met action as a
//! PROPOSED [`EvolutionDecision`] with a causal chain and explanation.
//!
//! Decisions are never applied here. PROMOTE and REVOKE go to a human
//! through a [`ReviewQueue`]; only [`EvolutionEngine::approve_decision`] and
//! [`EvolutionEngine::reject_decision`] change their status, and a decision
//! left unreviewed past its expiry becomes void.
//!
//! [`GovernanceConfig`] loads the configuration of all four crates from
//! `.ta/governance.toml`.

pub mod conditions;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod history;
pub mod review;
pub mod store;

pub use conditions::{evaluate, CandidateResult, Evaluation};
pub use config::{
    EvolutionConfig, FreezeConditions, GovernanceConfig, PromoteConditions, RevokeConditions,
    GOVERNANCE_CONFIG_PATH,
};
pub use decision::{DecisionStatus, EvolutionAction, EvolutionDecision, ReviewLevel, ReviewRecord};
pub use engine::EvolutionEngine;
pub use error::{ConfigError, EvolutionError};
pub use evidence::{Evidence, TrajectorySnapshot};
pub use history::{
    ExecutionStats, HistoryEntry, HistoryKind, HistoryStore, InMemoryHistory, ViolationStats,
};
pub use review::{InMemoryReviewQueue, QueuedReview, ReviewQueue, ReviewRouting};
pub use store::{DecisionStore, JsonFileDecisionStore, MemoryDecisionStore, ReviewUpdate};
