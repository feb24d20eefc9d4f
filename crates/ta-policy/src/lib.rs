//! # ta-policy
//!
//! Gate-chain policy engine for Trusted Autonomy.
//!
//! Every tool invocation is evaluated by the [`PolicyEngine`] through an
//! ordered, short-circuiting chain of seven gates (enabled, mode, frozen
//! spec, project binding, quota, side-effect blacklist, admin token). The
//! first gate that denies is the only reason returned, and the decision is
//! tagged with that [`Gate`].
//!
//! On top of the chain, [`evaluate_context`] applies runtime checks against a
//! [`PolicyContext`] built from the trust engines (authorization, sandbox,
//! daily limit, trust tier), and [`GovernedInvoker`] runs the whole flow:
//! policy, context, backend execution through the [`CapabilityRegistry`],
//! and trust events back to the trajectory engine.
//!
//! ## Key invariants
//!
//! - **Fail closed**: a missing or failing collaborator (quota provider,
//!   task store, token validator, sandbox) denies.
//! - **Deterministic order**: gates always run in [`Gate::CHAIN`] order.
//! - **Atomic reservations**: the quota slot and today's execution count are
//!   checked and reserved in one step ([`PolicyEngine::admit`],
//!   [`ExecutionCounter::try_acquire`]).
//! - **No silent high-risk execution**: HIGH-tier capabilities need the
//!   sandbox and a human approval token.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod invoke;
pub mod providers;
pub mod registry;
pub mod tool;

pub use config::{BlacklistConfig, ContextLimits, PolicyConfig};
pub use context::{evaluate_context, ContextGatherer, PolicyContext};
pub use engine::{
    Admission, ApprovalContext, EvaluationStep, EvaluationTrace, Gate, PolicyDecision, PolicyEngine,
};
pub use error::PolicyError;
pub use invoke::{GovernedInvoker, InvocationObserver, InvocationOutcome};
pub use providers::{
    AdminTokenValidator, AuthorizationProvider, AuthorizationResult, DailyCount, ExecutionCounter,
    InMemoryExecutionCounter, InMemoryQuotaProvider, MemoryTaskStore, QuotaCheck, QuotaLimits,
    QuotaProvider, QuotaSlot, QuotaState, SandboxProbe, StaticAuthorization, StaticSandboxProbe,
    StaticTokenValidator, TaskSpecStatus, TaskStore,
};
pub use registry::{CapabilityId, CapabilityRegistry, ExecutionBackend, ExecutionResult};
pub use tool::{Invocation, InvocationMode, RiskLevel, ToolDescriptor, ToolTrustTier};
