//! Tests for error types

use prometheus_target_broker::core::BrokerError;
use prometheus_target_broker::runtime::api::{status_for, ApiError};
use prometheus_target_broker::util::AllocId;

#[test]
fn test_queue_full_error() {
    let err = BrokerError::QueueFull("1024 allocations waiting".to_string());
    assert_eq!(format!("{err}"), "queue full: 1024 allocations waiting");
    assert_eq!(err.code(), "queue-full");
    assert_eq!(status_for(&err), 429);
}

#[test]
fn test_duplicate_target_error() {
    let err = BrokerError::DuplicateTarget {
        group: "dd1".into(),
        targets: vec!["T2".into()],
    };
    assert_eq!(format!("{err}"), r#"targets ["T2"] in group 'dd1' are duplicated"#);
    assert!(err.is_validation());
    assert_eq!(status_for(&err), 400);
}

#[test]
fn test_forbidden_is_not_not_found() {
    let forbidden = BrokerError::Forbidden("bob may not release abcd1234".into());
    let missing = BrokerError::NoSuchAllocation("abcd1234".into());
    assert_ne!(forbidden.code(), missing.code());
    assert_eq!(status_for(&forbidden), 403);
    assert_eq!(status_for(&missing), 404);
    assert!(!forbidden.is_validation());
}

#[test]
fn test_busy_maps_to_conflict_with_holders() {
    let holder = AllocId::parse("abcd1234").unwrap();
    let api = ApiError::from(BrokerError::Busy {
        conflicts: vec![holder.clone()],
    });
    assert_eq!(api.code, "busy");
    assert_eq!(api.status, 409);
    assert_eq!(api.conflicts, vec![holder]);
}

#[test]
fn test_internal_errors_are_500() {
    assert_eq!(status_for(&BrokerError::Backend("disk full".into())), 500);
    assert_eq!(status_for(&BrokerError::Invariant("T1 owned twice".into())), 500);
    assert_eq!(
        format!("{}", BrokerError::Backend("disk full".into())),
        "backend error: disk full"
    );
}

#[test]
fn test_unavailable_targets_are_not_busy() {
    let err = BrokerError::TargetUnavailable {
        targets: vec!["T2".into()],
    };
    assert_eq!(err.code(), "target-unavailable");
    assert_eq!(status_for(&err), 409);
    assert!(ApiError::from(err).conflicts.is_empty());
}
