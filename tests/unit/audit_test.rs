//! Tests for the audit sink

use prometheus_resource_core::core::{
    build_audit_event, AuditAction, AuditSink, InMemoryAuditSink, Metadata,
};
use prometheus_resource_core::util::serde::Priority;

#[test]
fn test_in_memory_sink_retains_in_order() {
    let mut sink = InMemoryAuditSink::new(8);
    assert!(sink.is_empty());
    sink.record(build_audit_event("a1", AuditAction::Allocate, Priority::High, 10, Metadata::new()));
    sink.record(build_audit_event("a1", AuditAction::Release, Priority::High, 20, Metadata::new()));

    let events = sink.events();
    assert_eq!(sink.len(), 2);
    assert_eq!(events[0].action, AuditAction::Allocate);
    assert_eq!(events[1].created_at_ms, 20);
    assert_ne!(events[0].event_id, events[1].event_id);
}

#[test]
fn test_zero_capacity_keeps_latest() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event("a1", AuditAction::Dummy, Priority::Low, 1, Metadata::new()));
    sink.record(build_audit_event("a2", AuditAction::Expire, Priority::Low, 2, Metadata::new()));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].allocation_id, "a2");
}

#[test]
fn test_event_serializes_action_snake_case() {
    let mut detail = Metadata::new();
    detail.insert("error".into(), "capacity exceeded".into());
    let event = build_audit_event("a1", AuditAction::Fallback, Priority::Medium, 5, detail);
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["action"], "fallback");
    assert_eq!(json["priority"], "MEDIUM");
    assert_eq!(json["detail"]["error"], "capacity exceeded");
    assert_eq!(AuditAction::Rollback.to_string(), "rollback");
}

#[test]
fn test_custom_sink_default_events_empty() {
    struct CountingSink(usize);
    impl AuditSink for CountingSink {
        fn record(&mut self, _event: prometheus_resource_core::core::AuditEvent) {
            self.0 += 1;
        }
    }
    let mut sink = CountingSink(0);
    sink.record(build_audit_event("a", AuditAction::Allocate, Priority::Low, 0, Metadata::new()));
    assert_eq!(sink.0, 1);
    assert!(sink.events().is_empty());
}
