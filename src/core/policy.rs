//! Allocation policy: priority convention, preemption rights and limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which end of the priority scale is the most important.
///
/// Both conventions are in use by different labs; the engine only ever
/// compares priorities through [`PriorityOrder::rank`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// 0 is the most urgent priority.
    #[default]
    LowerIsUrgent,
    /// The largest value is the most urgent priority.
    HigherIsUrgent,
}

impl PriorityOrder {
    /// Normalized rank; lower ranks are served first.
    #[must_use]
    pub fn rank(self, priority: u32) -> i64 {
        match self {
            Self::LowerIsUrgent => i64::from(priority),
            Self::HigherIsUrgent => -i64::from(priority),
        }
    }

    /// True if `a` is strictly more urgent than `b`.
    #[must_use]
    pub fn more_urgent(self, a: u32, b: u32) -> bool {
        self.rank(a) < self.rank(b)
    }
}

/// Who may ask for preemption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// Preemption requests are refused.
    Disabled,
    /// Only administrators may preempt.
    #[default]
    AdminOnly,
    /// Any caller may preempt less urgent holders.
    Any,
}

/// Limits and policy knobs enforced by the engine.
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    /// Priority convention.
    pub priority_order: PriorityOrder,
    /// Lowest accepted priority value.
    pub priority_min: u32,
    /// Highest accepted priority value.
    pub priority_max: u32,
    /// Priority used when the request gives none.
    pub default_priority: u32,
    /// Who may preempt.
    pub preemption: PreemptionPolicy,
    /// Time a preempted holder gets to quiesce its targets.
    pub preempt_grace: Duration,
    /// Allocations without endtime expire after this long without keepalive.
    pub idle_timeout: Duration,
    /// Minimum distance between now and an explicit endtime.
    pub endtime_min_lead: Duration,
    /// How long finished allocations remain queryable.
    pub done_retention: Duration,
    /// Maximum number of queued allocations.
    pub max_queue_depth: usize,
    /// Longer reasons are truncated to this many characters.
    pub reason_len_max: usize,
    /// Window during which an extra-data UUID may not be reused.
    pub uuid_max_age: Duration,
    /// Maximum remembered UUIDs.
    pub uuid_max_entries: usize,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            priority_order: PriorityOrder::LowerIsUrgent,
            priority_min: 0,
            priority_max: 9999,
            default_priority: 50,
            preemption: PreemptionPolicy::AdminOnly,
            preempt_grace: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            endtime_min_lead: Duration::from_secs(60),
            done_retention: Duration::from_secs(300),
            max_queue_depth: 1024,
            reason_len_max: 128,
            uuid_max_age: Duration::from_secs(2 * 24 * 60 * 60),
            uuid_max_entries: 30 * 2 * 24 * 60,
        }
    }
}
