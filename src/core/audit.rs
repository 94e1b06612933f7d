//! Audit trail of allocation events.
//!
//! The manager records every composite allocate, release, rollback, fallback
//! and expiry into an [`AuditSink`]. The bundled sink keeps a bounded ring in
//! memory.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::model::Metadata;
use crate::util::serde::{new_id, AllocationId, Priority};

/// What happened to an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Composite allocation granted.
    Allocate,
    /// Composite allocation released by its holder.
    Release,
    /// Partial allocation undone after a later phase failed.
    Rollback,
    /// Profile request failed and the reduced fallback was granted.
    Fallback,
    /// Every real attempt failed and a dummy allocation was synthesized.
    Dummy,
    /// Allocation reclaimed after its deadline.
    Expire,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Allocate => "allocate",
            Self::Release => "release",
            Self::Rollback => "rollback",
            Self::Fallback => "fallback",
            Self::Dummy => "dummy",
            Self::Expire => "expire",
        };
        f.write_str(name)
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Allocation concerned.
    pub allocation_id: AllocationId,
    /// Action taken.
    pub action: AuditAction,
    /// Priority of the allocation.
    pub priority: Priority,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context (sub-allocation ids, task type, failure reason).
    pub detail: Metadata,
}

/// Destination for audit events.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);

    /// Retained events, oldest first. Sinks that do not retain return none.
    fn events(&self) -> Vec<AuditEvent> {
        Vec::new()
    }
}

/// Bounded in-memory sink.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a sink keeping at most `max_events`.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events: max_events.max(1),
        }
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

/// Build an audit event stamped at `now_ms`.
pub fn build_audit_event(
    allocation_id: impl Into<AllocationId>,
    action: AuditAction,
    priority: Priority,
    now_ms: u128,
    detail: Metadata,
) -> AuditEvent {
    AuditEvent {
        event_id: new_id(),
        allocation_id: allocation_id.into(),
        action,
        priority,
        created_at_ms: now_ms,
        detail,
    }
}
