//! # ta-audit
//!
//! Audit trail for the trust & policy governance engine.
//!
//! Every governance-relevant fact (quota warnings, policy denials, trust
//! transitions, tier changes, evolution proposals, review outcomes) is
//! reported as an [`AuditEvent`] through the [`AuditSink`] collaborator
//! trait. Emission is fire-and-forget: a sink must never block or fail a
//! policy decision, so sinks swallow their own write failures and log them.
//!
//! The reference sink, [`AuditLogSink`], writes to an [`AuditLog`]: a JSONL
//! file where each event carries the SHA-256 hash of the previous line, so
//! tampering with history is detectable.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use ta_audit::{AuditLevel, AuditLog, AuditLogSink, AuditSink};
//!
//! let log = AuditLog::open("/tmp/governance-audit.jsonl").unwrap();
//! let sink = AuditLogSink::new(log);
//! sink.emit(
//!     "policy.quota_warning",
//!     serde_json::json!({ "capability_id": "web.fetch", "used": 90, "limit": 100 }),
//!     AuditLevel::Warning,
//! );
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;
pub mod sink;

pub use error::AuditError;
pub use event::{event_types, AuditEvent, AuditLevel};
pub use log::AuditLog;
pub use sink::{AuditLogSink, AuditSink, NullSink, RecordingSink};
