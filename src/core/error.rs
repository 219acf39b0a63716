//! Error types for allocation broker operations.

use thiserror::Error;

use crate::util::AllocId;

/// Errors produced by the allocation engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// A referenced target is not in the registry.
    #[error("target {target} in group '{group}' does not exist")]
    TargetUnknown {
        /// Group that named the target.
        group: String,
        /// Missing target identifier.
        target: String,
    },
    /// A target repeats inside a single group.
    #[error("targets {targets:?} in group '{group}' are duplicated")]
    DuplicateTarget {
        /// Offending group.
        group: String,
        /// Repeated target identifiers.
        targets: Vec<String>,
    },
    /// The group map is empty or a group names no targets.
    #[error("invalid group spec: {0}")]
    InvalidGroupSpec(String),
    /// No alternative is free right now and queuing was not requested.
    #[error("targets cannot be allocated right now (held by {conflicts:?})")]
    Busy {
        /// Allocations currently holding the contended targets.
        conflicts: Vec<AllocId>,
    },
    /// Every alternative needs a target that is disabled or has left the
    /// registry; no holder stands in the way.
    #[error("targets {targets:?} are disabled or no longer registered")]
    TargetUnavailable {
        /// Targets that cannot be handed out.
        targets: Vec<String>,
    },
    /// Caller lacks the rights for this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Allocation id is unknown, malformed or already finished.
    #[error("no such allocation: {0}")]
    NoSuchAllocation(String),
    /// Priority outside the configured range.
    #[error("invalid priority {value} (expected {min}-{max})")]
    InvalidPriority {
        /// Requested priority.
        value: i64,
        /// Lowest accepted value.
        min: u32,
        /// Highest accepted value.
        max: u32,
    },
    /// Endtime is malformed or too close to now.
    #[error("invalid endtime: {0}")]
    InvalidEndtime(String),
    /// Extra data failed validation.
    #[error("invalid extra data: {0}")]
    InvalidExtraData(String),
    /// Preemption was requested by someone the policy does not allow.
    #[error("preemption not allowed: {0}")]
    PreemptionNotAllowed(String),
    /// Wait queue is at its configured depth.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Ownership bookkeeping is inconsistent; unreachable under correct locking.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl BrokerError {
    /// Stable machine-readable code reported to API clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TargetUnknown { .. } => "target-unknown",
            Self::DuplicateTarget { .. } => "duplicate-target",
            Self::InvalidGroupSpec(_) => "invalid-group-spec",
            Self::Busy { .. } => "busy",
            Self::TargetUnavailable { .. } => "target-unavailable",
            Self::Forbidden(_) => "forbidden",
            Self::NoSuchAllocation(_) => "no-such-allocation",
            Self::InvalidPriority { .. } => "invalid-priority",
            Self::InvalidEndtime(_) => "invalid-endtime",
            Self::InvalidExtraData(_) => "invalid-extra-data",
            Self::PreemptionNotAllowed(_) => "preemption-not-allowed",
            Self::QueueFull(_) => "queue-full",
            Self::Backend(_) => "backend",
            Self::Invariant(_) => "invariant",
        }
    }

    /// True for request validation failures, which never reach the queue.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TargetUnknown { .. }
                | Self::DuplicateTarget { .. }
                | Self::InvalidGroupSpec(_)
                | Self::InvalidPriority { .. }
                | Self::InvalidEndtime(_)
                | Self::InvalidExtraData(_)
        )
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
