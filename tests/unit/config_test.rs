//! Tests for configuration validation

use std::time::Duration;

use prometheus_target_broker::config::{
    BrokerConfig, PreemptionPolicy, PriorityOrder, StoreBackendConfig, ENV_CONFIG_PATH,
    ENV_PREEMPT_GRACE,
};

#[test]
fn test_default_config_matches_policy_defaults() {
    let config = BrokerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.priority_order, PriorityOrder::LowerIsUrgent);
    assert_eq!(config.preemption, PreemptionPolicy::AdminOnly);
    assert_eq!(config.store, StoreBackendConfig::InMemory);

    let policy = config.to_policy();
    assert_eq!(policy.priority_max, 9999);
    assert_eq!(policy.preempt_grace, Duration::from_secs(30));
    assert_eq!(policy.idle_timeout, Duration::from_secs(30));
    assert_eq!(policy.endtime_min_lead, Duration::from_secs(60));
    assert_eq!(policy.max_queue_depth, 1024);
    assert_eq!(config.sweep_interval(), Duration::from_secs(5));
}

#[test]
fn test_invalid_priority_range() {
    let config = BrokerConfig {
        priority_min: 10,
        priority_max: 5,
        ..BrokerConfig::default()
    };
    assert!(config.validate().is_err());

    let config = BrokerConfig {
        default_priority: 10_000,
        ..BrokerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_queue_depth() {
    let config = BrokerConfig {
        max_queue_depth: 0,
        ..BrokerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_invalid_sweep_interval() {
    let config = BrokerConfig {
        sweep_interval_secs: 0,
        ..BrokerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_broker_config_from_json() {
    let json = r#"{
        "priority_order": "higher_is_urgent",
        "preemption": "any",
        "preempt_grace_secs": 5,
        "admins": ["root"],
        "targets": {
            "board1": {"interfaces": ["power", "console"]},
            "vm1": {"disabled": true}
        }
    }"#;

    let config = BrokerConfig::from_json_str(json).unwrap();
    assert_eq!(config.priority_order, PriorityOrder::HigherIsUrgent);
    assert_eq!(config.preemption, PreemptionPolicy::Any);
    assert_eq!(config.preempt_grace_secs, 5);
    assert_eq!(config.admins, ["root"]);
    assert!(config.targets["board1"].interfaces.contains("power"));
    assert!(config.targets["vm1"].disabled);
    assert_eq!(config.idle_timeout_secs, 30);
}

#[test]
fn test_broker_config_rejects_garbage() {
    assert!(BrokerConfig::from_json_str("{not json").is_err());
    assert!(BrokerConfig::from_json_str(r#"{"preemption": "sometimes"}"#).is_err());
    assert!(BrokerConfig::from_json_str(r#"{"targets": {" ": {}}}"#).is_err());
}

#[test]
fn test_broker_config_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.json");
    std::fs::write(&path, r#"{"admins": ["ops"], "preempt_grace_secs": 60}"#).unwrap();

    std::env::set_var(ENV_CONFIG_PATH, &path);
    std::env::set_var(ENV_PREEMPT_GRACE, "7");
    let config = BrokerConfig::from_env();
    std::env::remove_var(ENV_CONFIG_PATH);
    std::env::remove_var(ENV_PREEMPT_GRACE);

    let config = config.unwrap();
    assert_eq!(config.admins, ["ops"]);
    assert_eq!(config.preempt_grace_secs, 7);
}
