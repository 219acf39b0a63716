//! # Prometheus Target Broker
//!
//! A multi-resource allocation broker for shared test targets (boards, VMs,
//! network segments, peripherals).
//!
//! Callers ask for one of several alternative *groups* of targets. The broker
//! grants a group only when every target in it is free at once, queues the
//! request otherwise, preempts less urgent holders for privileged requests and
//! lets owners hand operational access to guests.
//!
//! ## Core Problem Solved
//!
//! - **Atomic multi-target grants**: a group is granted whole or not at all,
//!   even while many callers compete for overlapping targets
//! - **Fair waiting**: queued requests are served by priority, then arrival,
//!   without a blocked request stalling those behind it
//! - **Cooperative preemption**: holders get a grace window to quiesce their
//!   targets before losing them
//! - **Delegation**: guests share access without ownership rights
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_target_broker::builders::BrokerBuilder;
//! use prometheus_target_broker::config::BrokerConfig;
//! use prometheus_target_broker::core::{CreateRequest, GroupSpec};
//! use prometheus_target_broker::util::now_ms;
//!
//! let broker = BrokerBuilder::new(BrokerConfig::from_env()?).build()?;
//! let spec = GroupSpec::new()
//!     .with_group("pair-a", ["board1", "switch1"])
//!     .with_group("pair-b", ["board2", "switch2"]);
//! let grant = broker.create("alice", CreateRequest::new(spec).queued(), now_ms())?;
//! ```
//!
//! See `tests/` for full scenarios.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core allocation abstractions and the engine.
pub mod core;
/// Configuration models for the broker, its store and targets.
pub mod config;
/// Builders to construct a broker from configuration.
pub mod builders;
/// Infrastructure adapters for the wait queue and allocation stores.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
