//! # ta-trust
//!
//! Trust tiers and trust trajectories for governed capabilities.
//!
//! Two engines live here:
//!
//! - [`TierEngine`] turns a risk score from an external [`RiskScoreProvider`]
//!   into a [`TrustTier`] (LOW / MEDIUM / HIGH) and records every tier change.
//!   A provider failure degrades to a conservative MEDIUM, never to LOW.
//! - [`TrajectoryEngine`] tracks how a capability behaves over time as a
//!   three-state cycle, EARNING → STABLE → DEGRADING → EARNING, driven by
//!   execution outcomes and configurable [`TrajectoryRule`]s.
//!
//! Both persist through the [`TrustStore`] trait ([`MemoryTrustStore`] or
//! [`JsonFileTrustStore`]) and report to a `ta_audit::AuditSink`.
//!
//! ## Quick Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ta_audit::NullSink;
//! use ta_trust::{
//!     MemoryTrustStore, SystemClock, TrajectoryConfig, TrajectoryEngine, TrustEvent,
//!     TrustState,
//! };
//!
//! let engine = TrajectoryEngine::new(
//!     Arc::new(MemoryTrustStore::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(NullSink),
//!     TrajectoryConfig::default(),
//! );
//! let outcome = engine
//!     .record_event("web.fetch", "get", TrustEvent::Success, Some(12.0), None)
//!     .unwrap();
//! assert_eq!(outcome.state, TrustState::Earning);
//! ```

pub mod clock;
pub mod config;
pub mod error;
mod locks;
pub mod risk;
pub mod rules;
pub mod state;
pub mod store;
pub mod tier;
pub mod trajectory;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{InertiaWeights, TierConfig, TrajectoryConfig, TrajectoryThresholds, TrustConfig};
pub use error::{ProviderError, TrustError};
pub use risk::{FixedRiskProvider, RiskAssessment, RiskScoreProvider};
pub use rules::{default_rules, MatchMode, RuleThresholds, TrajectoryRule};
pub use state::{
    TransitionEdge, TrustEvent, TrustKey, TrustState, TrustStateRecord, TrustTransition,
    WILDCARD_ACTION,
};
pub use store::{JsonFileTrustStore, MemoryTrustStore, TrustStore};
pub use tier::{map_tier, normalize_score, TierChangeRecord, TierEngine, TierInfo, TrustTier};
pub use trajectory::{
    inertia_score, EventOutcome, SimulatedEvent, SimulationStep, TrajectoryEngine, TrajectoryInfo,
};
