//! Tests for utility functions

use prometheus_target_broker::util::{is_valid_alloc_id, now_ms, secs_to_ms, AllocId, ALLOC_ID_LEN};

#[test]
fn test_generated_ids_are_unique_and_well_formed() {
    let a = AllocId::generate();
    let b = AllocId::generate();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), ALLOC_ID_LEN);
    assert!(is_valid_alloc_id(a.as_str()));
}

#[test]
fn test_malformed_ids_are_rejected() {
    assert!(AllocId::parse("").is_none());
    assert!(AllocId::parse("../etc").is_none());
    assert!(AllocId::parse("abc def").is_none());
    assert_eq!(AllocId::parse("ab_CD09").map(|id| id.to_string()), Some("ab_CD09".into()));
}

#[test]
fn test_clock_helpers() {
    assert_eq!(secs_to_ms(30), 30_000);
    let before = now_ms();
    let after = now_ms();
    assert!(after >= before);
    assert!(before > secs_to_ms(1_600_000_000));
}
