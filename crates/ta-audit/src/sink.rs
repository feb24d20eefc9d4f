// sink.rs — The AuditSink collaborator and its reference implementations.
//
// Engines report governance facts through `AuditSink::emit`. The contract is
// fire-and-forget: `emit` returns nothing, and an implementation that fails
// to persist an event logs the failure and moves on. Trust transitions and
// evolution decisions have their own stores whose write failures *are*
// surfaced; the sink is only the notification side channel.

use std::sync::Mutex;

use crate::event::{AuditEvent, AuditLevel};
use crate::log::AuditLog;

/// Receives governance audit events.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not panic and never reports failure to the caller.
    fn emit(&self, event_type: &str, payload: serde_json::Value, level: AuditLevel);
}

/// Writes events to a hash-chained [`AuditLog`].
pub struct AuditLogSink {
    log: Mutex<AuditLog>,
}

impl AuditLogSink {
    pub fn new(log: AuditLog) -> Self {
        Self {
            log: Mutex::new(log),
        }
    }
}

impl AuditSink for AuditLogSink {
    fn emit(&self, event_type: &str, payload: serde_json::Value, level: AuditLevel) {
        let mut event = AuditEvent::new(event_type, level).with_payload(payload);
        let mut log = match self.log.lock() {
            Ok(log) => log,
            Err(poisoned) => {
                tracing::warn!("audit log lock poisoned; recovering");
                poisoned.into_inner()
            }
        };
        if let Err(e) = log.append(&mut event) {
            tracing::warn!(
                event_type = %event_type,
                path = %log.path().display(),
                "failed to append audit event: {}",
                e
            );
        }
    }
}

/// Keeps events in memory. Useful for tests and for embedding the engine in
/// a host that ships events elsewhere in batches.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events with the given type, oldest first.
    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl AuditSink for RecordingSink {
    fn emit(&self, event_type: &str, payload: serde_json::Value, level: AuditLevel) {
        let event = AuditEvent::new(event_type, level).with_payload(payload);
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, _event_type: &str, _payload: serde_json::Value, _level: AuditLevel) {}
}
