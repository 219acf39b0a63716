//! Allocation records, group specifications and lifecycle states.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::{BrokerError, TargetRegistry};
use crate::util::{AllocId, TargetId, UserId};

/// Lifecycle state of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocState {
    /// Waiting in the queue for one of its groups to become free.
    Queued,
    /// Holding every target of its granted group.
    Active,
    /// Still holding its targets, but asked to hand them to a more urgent
    /// request once the grace window ends.
    Restarting,
    /// Finished; kept only for the retention window.
    Done,
    /// Dropped before ever becoming active.
    Rejected,
}

impl AllocState {
    /// True while the allocation is tracked by the store.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Queued | Self::Active | Self::Restarting)
    }

    /// True while the allocation owns targets.
    #[must_use]
    pub const fn holds_targets(self) -> bool {
        matches!(self, Self::Active | Self::Restarting)
    }
}

impl fmt::Display for AllocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Restarting => "restarting",
            Self::Done => "done",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Why an allocation left the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Released by owner, creator or admin.
    Removed,
    /// Explicit endtime reached.
    Expired,
    /// No keepalive within the idle timeout.
    TimedOut,
    /// Targets handed over to a more urgent allocation.
    Preempted,
    /// A requested target left the registry while queued.
    TargetRemoved,
}

/// When an allocation stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    /// Expires when not kept alive for the configured idle timeout.
    Idle,
    /// Never expires; only an explicit release ends it.
    Static,
    /// Expires at the given instant (ms since epoch).
    At(u128),
}

/// One named alternative: an ordered list of targets that must all be held
/// together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroup {
    /// Group name as given by the caller.
    pub name: String,
    /// Targets in caller order.
    pub targets: Vec<TargetId>,
}

/// Ordered set of alternative target groups offered in one request.
///
/// Serialized as a JSON object; insertion order is preserved because the
/// first satisfiable alternative wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSpec {
    groups: Vec<TargetGroup>,
}

impl GroupSpec {
    /// Create an empty spec.
    #[must_use]
    pub const fn new() -> Self {
        Self { groups: Vec::new() }
    }

    /// Append an alternative.
    #[must_use]
    pub fn with_group<I, T>(mut self, name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TargetId>,
    {
        self.groups.push(TargetGroup {
            name: name.into(),
            targets: targets.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Alternatives in caller order.
    pub fn iter(&self) -> impl Iterator<Item = &TargetGroup> {
        self.groups.iter()
    }

    /// Look up an alternative by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TargetGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Number of alternatives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True when no alternative was given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every target named by any alternative.
    #[must_use]
    pub fn all_targets(&self) -> BTreeSet<TargetId> {
        self.groups
            .iter()
            .flat_map(|g| g.targets.iter().cloned())
            .collect()
    }

    /// Check every group against the registry.
    ///
    /// The same target may appear in several alternatives; it may not repeat
    /// inside one.
    pub fn validate(&self, registry: &dyn TargetRegistry) -> Result<(), BrokerError> {
        if self.groups.is_empty() {
            return Err(BrokerError::InvalidGroupSpec("no groups given".into()));
        }
        let mut names = HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(BrokerError::InvalidGroupSpec(format!(
                    "group '{}' given more than once",
                    group.name
                )));
            }
            if group.targets.is_empty() {
                return Err(BrokerError::InvalidGroupSpec(format!(
                    "group '{}' names no targets",
                    group.name
                )));
            }
            for target in &group.targets {
                if !registry.exists(target) {
                    return Err(BrokerError::TargetUnknown {
                        group: group.name.clone(),
                        target: target.clone(),
                    });
                }
            }
            let mut seen = HashSet::new();
            let duplicates: BTreeSet<&TargetId> = group
                .targets
                .iter()
                .filter(|t| !seen.insert(t.as_str()))
                .collect();
            if !duplicates.is_empty() {
                return Err(BrokerError::DuplicateTarget {
                    group: group.name.clone(),
                    targets: duplicates.into_iter().cloned().collect(),
                });
            }
        }
        Ok(())
    }
}

impl<N, T> FromIterator<(N, Vec<T>)> for GroupSpec
where
    N: Into<String>,
    T: Into<TargetId>,
{
    fn from_iter<I: IntoIterator<Item = (N, Vec<T>)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |spec, (name, targets)| spec.with_group(name, targets))
    }
}

impl Serialize for GroupSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for group in &self.groups {
            map.serialize_entry(&group.name, &group.targets)?;
        }
        map.end()
    }
}

struct GroupSpecVisitor;

impl<'de> Visitor<'de> for GroupSpecVisitor {
    type Value = GroupSpec;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of group name to list of target ids")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut groups = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, targets)) = access.next_entry::<String, Vec<TargetId>>()? {
            groups.push(TargetGroup { name, targets });
        }
        Ok(GroupSpec { groups })
    }
}

impl<'de> Deserialize<'de> for GroupSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(GroupSpecVisitor)
    }
}

/// Scalar value attached to an allocation for driver use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free text.
    Str(String),
}

/// Pending handover of an allocation's targets to a more urgent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartInfo {
    /// Queued allocation waiting for the targets.
    pub preempted_by: AllocId,
    /// Instant after which the targets are taken away.
    pub grace_deadline_ms: u128,
}

/// Full allocation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation identifier.
    pub id: AllocId,
    /// Identity that placed the request.
    pub creator: UserId,
    /// Identity the allocation is attributed to; defaults to the creator.
    pub owner: UserId,
    /// Identities with operational access but no ownership rights.
    pub guests: BTreeSet<UserId>,
    /// Alternatives requested.
    pub groups: GroupSpec,
    /// Priority as given by the caller; meaning set by the priority order.
    pub priority: u32,
    /// Whether this request may preempt less urgent holders.
    pub preempt: bool,
    /// Current lifecycle state.
    pub state: AllocState,
    /// Arrival sequence number, breaks priority ties in the wait queue.
    pub queue_seq: u64,
    /// Creation time, ms since epoch.
    pub created_at_ms: u128,
    /// Last keepalive (or creation) time, ms since epoch.
    pub last_keepalive_ms: u128,
    /// Expiry policy.
    pub expiry: Expiry,
    /// Group granted, once active.
    pub group_allocated: Option<String>,
    /// Targets owned, once active.
    pub targets_granted: Vec<TargetId>,
    /// Activation time, ms since epoch.
    pub activated_at_ms: Option<u128>,
    /// Free-text reason supplied by the caller.
    pub reason: Option<String>,
    /// Client-specific scalars recorded for drivers.
    pub extra_data: BTreeMap<String, ExtraValue>,
    /// Present while in [`AllocState::Restarting`].
    pub restart: Option<RestartInfo>,
    /// Alternative a queued allocation is preempting holders for; its free
    /// targets are held back from less urgent requests meanwhile.
    #[serde(default)]
    pub preempting_group: Option<String>,
    /// Why the allocation ended.
    pub end_reason: Option<EndReason>,
    /// When the allocation ended, ms since epoch.
    pub ended_at_ms: Option<u128>,
}

impl Allocation {
    /// True if `user` created or owns the allocation.
    #[must_use]
    pub fn is_creator_or_owner(&self, user: &str) -> bool {
        self.owner == user || self.creator == user
    }

    /// True if `user` is a guest.
    #[must_use]
    pub fn is_guest(&self, user: &str) -> bool {
        self.guests.contains(user)
    }

    /// Instant at which the allocation expires, `None` when static.
    #[must_use]
    pub fn expires_at_ms(&self, idle_timeout_ms: u128) -> Option<u128> {
        match self.expiry {
            Expiry::Static => None,
            Expiry::At(at) => Some(at),
            Expiry::Idle => Some(self.last_keepalive_ms.saturating_add(idle_timeout_ms)),
        }
    }

    /// Reason the allocation would end if it expired now.
    #[must_use]
    pub const fn expiry_reason(&self) -> EndReason {
        match self.expiry {
            Expiry::Idle => EndReason::TimedOut,
            Expiry::Static | Expiry::At(_) => EndReason::Expired,
        }
    }
}
