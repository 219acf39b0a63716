//! Tests for audit sink

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus_target_broker::core::{
    build_audit_event, AllocationEngine, AllocationPolicy, AuditEvent, AuditSink, CreateRequest,
    GroupSpec, InMemoryAuditSink, InMemoryTargetRegistry, StaticRoles,
};
use prometheus_target_broker::infra::{InMemoryStore, WaitQueue};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("abcd1234", Some("alice"), "release", Some("manual".to_string()));

    sink.record(event);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].allocid, "abcd1234");
    assert_eq!(events[0].calling_user.as_deref(), Some("alice"));
    assert_eq!(events[0].action, "release");
    assert!(events[0].event_id.starts_with("abcd1234-release-"));
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    for action in ["create", "guest-add", "release"] {
        sink.record(build_audit_event("abcd1234", None, action, None));
    }

    let actions: Vec<String> = sink.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, ["guest-add", "release"]);
}

/// Sink that shares its buffer with the test.
struct SharedSink(Arc<Mutex<Vec<AuditEvent>>>);

impl AuditSink for SharedSink {
    fn record(&mut self, event: AuditEvent) {
        self.0.lock().push(event);
    }
}

#[test]
fn test_engine_audits_lifecycle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = AllocationEngine::new(
        AllocationPolicy::default(),
        InMemoryStore::new(),
        WaitQueue::new(8),
        Arc::new(InMemoryTargetRegistry::from_ids(["T1"])),
        Arc::new(StaticRoles::default()),
    )
    .unwrap()
    .with_audit(Box::new(SharedSink(Arc::clone(&log))));

    let grant = engine
        .create("alice", CreateRequest::new(GroupSpec::new().with_group("g", ["T1"])), 0)
        .unwrap();
    engine.add_guest(&grant.allocid, "alice", "bob").unwrap();
    engine.release(&grant.allocid, "alice", 1).unwrap();

    let actions: Vec<(String, Option<String>)> = log
        .lock()
        .iter()
        .map(|e| (e.action.clone(), e.calling_user.clone()))
        .collect();
    assert_eq!(
        actions,
        [
            ("create".to_string(), Some("alice".to_string())),
            ("activate".to_string(), None),
            ("guest-add".to_string(), Some("alice".to_string())),
            ("release".to_string(), Some("alice".to_string())),
        ]
    );
}
