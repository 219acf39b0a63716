//! Configuration models for the broker, its store and its targets.

pub mod broker;

pub use broker::{
    BrokerConfig, StoreBackendConfig, TargetConfig, ENV_CONFIG_PATH, ENV_PREEMPT_GRACE,
    ENV_SWEEP_INTERVAL,
};
pub use crate::core::{PreemptionPolicy, PriorityOrder};
