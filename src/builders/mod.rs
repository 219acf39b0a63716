//! Builders to construct a broker from configuration.

pub mod broker_builder;

pub use broker_builder::{build_broker, Broker, BrokerBuilder};
