//! Audit trail of allocation actions.

use std::collections::VecDeque;

use crate::util::clock::now_ms;

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related allocation identifier.
    pub allocid: String,
    /// Identity that triggered the action; `None` for sweeper actions.
    pub calling_user: Option<String>,
    /// Action taken (create, queue, activate, release, expire, preempt,
    /// guest-add, guest-remove, reject).
    pub action: String,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink emitting every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            allocid = %event.allocid,
            user = event.calling_user.as_deref().unwrap_or("-"),
            action = %event.action,
            payload = event.payload.as_deref().unwrap_or(""),
            "allocation audit"
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    allocid: impl Into<String>,
    calling_user: Option<&str>,
    action: impl Into<String>,
    payload: Option<String>,
) -> AuditEvent {
    let allocid = allocid.into();
    let action = action.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{allocid}-{action}-{created_at_ms}"),
        allocid,
        calling_user: calling_user.map(str::to_string),
        action,
        created_at_ms,
        payload,
    }
}
