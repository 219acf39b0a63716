//! Broker configuration structures.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AllocationPolicy, AppResult, PreemptionPolicy, PriorityOrder, TargetInfo};

/// Environment variable naming the JSON configuration file.
pub const ENV_CONFIG_PATH: &str = "BROKER_CONFIG";
/// Environment override for [`BrokerConfig::sweep_interval_secs`].
pub const ENV_SWEEP_INTERVAL: &str = "BROKER_SWEEP_INTERVAL_SECS";
/// Environment override for [`BrokerConfig::preempt_grace_secs`].
pub const ENV_PREEMPT_GRACE: &str = "BROKER_PREEMPT_GRACE_SECS";

/// Per-target configuration; same shape as the registry entry.
pub type TargetConfig = TargetInfo;

/// Store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// Volatile store for development and tests.
    #[default]
    InMemory,
    /// JSON-lines journal under a directory.
    File {
        /// Directory holding the journal.
        path: PathBuf,
    },
}

/// Root broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Which end of the priority scale is most urgent.
    pub priority_order: PriorityOrder,
    /// Lowest accepted priority.
    pub priority_min: u32,
    /// Highest accepted priority.
    pub priority_max: u32,
    /// Priority used when a request gives none.
    pub default_priority: u32,
    /// Who may request preemption.
    pub preemption: PreemptionPolicy,
    /// Grace window a preempted holder gets, in seconds.
    pub preempt_grace_secs: u64,
    /// Idle timeout for allocations without endtime, in seconds.
    pub idle_timeout_secs: u64,
    /// Minimum lead of an explicit endtime, in seconds.
    pub endtime_min_lead_secs: u64,
    /// Retention of finished records, in seconds.
    pub done_retention_secs: u64,
    /// Maximum queued allocations.
    pub max_queue_depth: usize,
    /// Maximum reason length in characters.
    pub reason_len_max: usize,
    /// Interval between periodic sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Window in which an extra-data UUID may not be reused, in seconds.
    pub uuid_max_age_secs: u64,
    /// Maximum remembered UUIDs.
    pub uuid_max_entries: usize,
    /// Identities holding the admin role.
    pub admins: Vec<String>,
    /// Store backend.
    pub store: StoreBackendConfig,
    /// Targets known to the broker.
    pub targets: BTreeMap<String, TargetConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let policy = AllocationPolicy::default();
        Self {
            priority_order: policy.priority_order,
            priority_min: policy.priority_min,
            priority_max: policy.priority_max,
            default_priority: policy.default_priority,
            preemption: policy.preemption,
            preempt_grace_secs: policy.preempt_grace.as_secs(),
            idle_timeout_secs: policy.idle_timeout.as_secs(),
            endtime_min_lead_secs: policy.endtime_min_lead.as_secs(),
            done_retention_secs: policy.done_retention.as_secs(),
            max_queue_depth: policy.max_queue_depth,
            reason_len_max: policy.reason_len_max,
            sweep_interval_secs: 5,
            uuid_max_age_secs: policy.uuid_max_age.as_secs(),
            uuid_max_entries: policy.uuid_max_entries,
            admins: Vec::new(),
            store: StoreBackendConfig::InMemory,
            targets: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.priority_min > self.priority_max {
            return Err(format!(
                "priority_min {} is above priority_max {}",
                self.priority_min, self.priority_max
            ));
        }
        if !(self.priority_min..=self.priority_max).contains(&self.default_priority) {
            return Err(format!(
                "default_priority {} outside {}-{}",
                self.default_priority, self.priority_min, self.priority_max
            ));
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".into());
        }
        if self.idle_timeout_secs == 0 {
            return Err("idle_timeout_secs must be greater than 0".into());
        }
        if self.uuid_max_entries == 0 {
            return Err("uuid_max_entries must be greater than 0".into());
        }
        if let Some(empty) = self.targets.keys().find(|id| id.trim().is_empty()) {
            return Err(format!("target id `{empty}` is blank"));
        }
        if let StoreBackendConfig::File { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err("file store needs a path".into());
            }
        }
        Ok(())
    }

    /// Parse broker configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, then the JSON file named by
    /// `BROKER_CONFIG` (defaults when unset), then applies the numeric
    /// overrides.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading broker config {path}"))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing broker config {path}"))?
            }
            Err(_) => Self::default(),
        };
        if let Some(secs) = env_secs(ENV_SWEEP_INTERVAL)? {
            cfg.sweep_interval_secs = secs;
        }
        if let Some(secs) = env_secs(ENV_PREEMPT_GRACE)? {
            cfg.preempt_grace_secs = secs;
        }
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Engine policy derived from this configuration.
    #[must_use]
    pub fn to_policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            priority_order: self.priority_order,
            priority_min: self.priority_min,
            priority_max: self.priority_max,
            default_priority: self.default_priority,
            preemption: self.preemption,
            preempt_grace: Duration::from_secs(self.preempt_grace_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            endtime_min_lead: Duration::from_secs(self.endtime_min_lead_secs),
            done_retention: Duration::from_secs(self.done_retention_secs),
            max_queue_depth: self.max_queue_depth,
            reason_len_max: self.reason_len_max,
            uuid_max_age: Duration::from_secs(self.uuid_max_age_secs),
            uuid_max_entries: self.uuid_max_entries,
        }
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn env_secs(name: &str) -> AppResult<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name}={raw} is not a number of seconds")),
        Err(_) => Ok(None),
    }
}
