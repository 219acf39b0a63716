//! Tests for builder modules

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus_target_broker::builders::{build_broker, BrokerBuilder};
use prometheus_target_broker::config::{BrokerConfig, StoreBackendConfig, TargetConfig};
use prometheus_target_broker::core::{
    AllocState, AuthProvider, CreateRequest, DriverHook, DriverRegistry, GroupSpec,
    PreemptionPolicy, TargetRegistry,
};

fn config_with_targets(ids: &[&str]) -> BrokerConfig {
    BrokerConfig {
        admins: vec!["root".into()],
        targets: ids
            .iter()
            .map(|id| (id.to_string(), TargetConfig::default()))
            .collect(),
        ..BrokerConfig::default()
    }
}

#[test]
fn test_builder_fills_registry_from_config() {
    let builder = BrokerBuilder::new(config_with_targets(&["T1", "T2"]));
    let registry = builder.registry();
    assert!(registry.exists("T1"));
    assert!(!registry.exists("T3"));
    assert_eq!(builder.config().admins, ["root"]);

    let broker = builder.build().unwrap();
    assert!(broker.auth().is_admin("root"));
    assert!(!broker.auth().is_admin("alice"));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let config = BrokerConfig {
        max_queue_depth: 0,
        ..BrokerConfig::default()
    };
    let err = build_broker(config).err().unwrap();
    assert!(err.to_string().contains("max_queue_depth"));
}

#[test]
fn test_registry_handle_sees_runtime_changes() {
    let builder = BrokerBuilder::new(config_with_targets(&["T1"]));
    let registry = builder.registry();
    let broker = builder.build().unwrap();

    let spec = GroupSpec::new().with_group("g", ["T9"]);
    let err = broker.create("alice", CreateRequest::new(spec.clone()), 0).unwrap_err();
    assert_eq!(err.code(), "target-unknown");

    registry.insert("T9", TargetConfig::default());
    let grant = broker.create("alice", CreateRequest::new(spec), 0).unwrap();
    assert_eq!(grant.state, AllocState::Active);
}

#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl DriverHook for Recorder {
    fn notify_preempt(&self, target: &str) {
        self.0.lock().push(target.to_string());
    }
}

#[test]
fn test_builder_wires_driver_hooks() {
    let mut config = config_with_targets(&["board1"]);
    config.preemption = PreemptionPolicy::Any;
    config.targets.insert(
        "board1".into(),
        TargetConfig {
            interfaces: ["power".to_string()].into(),
            disabled: false,
        },
    );
    let power = Arc::new(Recorder::default());
    let broker = BrokerBuilder::new(config)
        .with_drivers(DriverRegistry::new().with_hook("power", power.clone()))
        .build()
        .unwrap();

    let spec = GroupSpec::new().with_group("g", ["board1"]);
    broker.create("alice", CreateRequest::new(spec.clone()), 0).unwrap();
    broker
        .create(
            "bob",
            CreateRequest::new(spec).queued().preempting().with_priority(0),
            0,
        )
        .unwrap();

    assert_eq!(*power.0.lock(), ["board1".to_string()]);
}

#[test]
fn test_builder_opens_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with_targets(&["T1"]);
    config.store = StoreBackendConfig::File {
        path: PathBuf::from(dir.path()),
    };
    let spec = GroupSpec::new().with_group("g", ["T1"]);

    let allocid = {
        let broker = build_broker(config.clone()).unwrap();
        broker
            .create("alice", CreateRequest::new(spec).with_endtime("static"), 0)
            .unwrap()
            .allocid
    };

    let broker = build_broker(config).unwrap();
    assert_eq!(broker.owner_of("T1"), Some(allocid.clone()));
    assert_eq!(broker.query(&allocid, "alice").unwrap().state, AllocState::Active);
}
