//! Allocation engine: admission, the wait queue, preemption and expiry.
//!
//! All ownership mutation happens under one serializing lock over the store
//! and the wait queue, so two requests can never both observe a target as
//! free. Read-only queries go through a published view map that is updated
//! while the lock is still held, so they never wait behind a sweep.
//!
//! Events and audit records are delivered before the lock is released, so
//! they arrive in commit order. Driver notifications and the sweeper wake
//! are sent after it is released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::acl;
use crate::core::{
    build_audit_event, AllocState, Allocation, AllocationEvent, AllocationPolicy, AllocationQueue,
    AllocationStore, AuditEvent, AuditSink, AuthProvider, BrokerError, DriverRegistry, EndReason,
    EventBus, Expiry, ExtraValue, GroupSpec, OwnerChange, PreemptionPolicy, PriorityOrder,
    QueueEntry, RecordOp, RestartInfo, SweepSignal, TargetRegistry,
};
use crate::util::{AllocId, TargetId, UserId};

/// Format of explicit endtimes (UTC).
pub const ENDTIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Endtime value meaning "never expires".
pub const ENDTIME_STATIC: &str = "static";

/// Extra-data key holding a single-use request UUID.
pub const EXTRA_UUID_KEY: &str = "uuid";

// Upper bound on release/grant rounds within one sweep. A round only
// repeats when a preemption with a zero grace window finalized.
const MAX_SWEEP_ROUNDS: usize = 16;

/// A reservation request.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Alternatives, tried in order.
    pub groups: GroupSpec,
    /// Requested priority; the policy default when absent.
    pub priority: Option<i64>,
    /// Wait when busy instead of failing.
    pub queue: bool,
    /// Ask for less urgent holders to be preempted.
    pub preempt: bool,
    /// Identity the allocation is attributed to instead of the caller.
    pub obo_user: Option<UserId>,
    /// Initial guests.
    pub guests: Vec<UserId>,
    /// `static` or `YYYYmmddHHMMSS`; idle expiry when absent.
    pub endtime: Option<String>,
    /// Free-text reason, truncated to the configured length.
    pub reason: Option<String>,
    /// Scalars recorded for drivers.
    pub extra_data: BTreeMap<String, ExtraValue>,
}

impl CreateRequest {
    /// Request for `groups` with every option at its default.
    #[must_use]
    pub fn new(groups: GroupSpec) -> Self {
        Self {
            groups,
            ..Self::default()
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Queue instead of failing when busy.
    #[must_use]
    pub const fn queued(mut self) -> Self {
        self.queue = true;
        self
    }

    /// Request preemption of less urgent holders.
    #[must_use]
    pub const fn preempting(mut self) -> Self {
        self.preempt = true;
        self
    }

    /// Attribute the allocation to `user`.
    #[must_use]
    pub fn on_behalf_of(mut self, user: impl Into<UserId>) -> Self {
        self.obo_user = Some(user.into());
        self
    }

    /// Add an initial guest.
    #[must_use]
    pub fn with_guest(mut self, guest: impl Into<UserId>) -> Self {
        self.guests.push(guest.into());
        self
    }

    /// Set the endtime (`static` or `YYYYmmddHHMMSS`).
    #[must_use]
    pub fn with_endtime(mut self, endtime: impl Into<String>) -> Self {
        self.endtime = Some(endtime.into());
        self
    }

    /// Set the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach one extra-data scalar.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: ExtraValue) -> Self {
        self.extra_data.insert(key.into(), value);
        self
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// New allocation id.
    pub allocid: AllocId,
    /// `Active` when granted immediately, otherwise `Queued`.
    pub state: AllocState,
    /// Alternative granted, when active.
    pub group_allocated: Option<String>,
    /// Targets granted, when active.
    pub targets: Vec<TargetId>,
}

/// Reply to a keepalive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveReply {
    /// Current state.
    pub state: AllocState,
    /// Granted group, when active.
    pub group_allocated: Option<String>,
}

/// Counters from one sweep or maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Allocations past their explicit endtime.
    pub expired: usize,
    /// Allocations that missed their keepalive.
    pub timed_out: usize,
    /// Holders whose grace window ended and lost their targets.
    pub preempted: usize,
    /// Holders returned to active because the preemptor went away.
    pub reverted: usize,
    /// Queued allocations dropped because a target disappeared.
    pub rejected: usize,
    /// Queued allocations granted.
    pub activated: usize,
    /// Finished records dropped after the retention window.
    pub purged: usize,
}

enum Admission {
    Grant {
        group: String,
        targets: Vec<TargetId>,
    },
    Preempt {
        group: String,
        victims: BTreeSet<AllocId>,
    },
    Blocked {
        conflicts: BTreeSet<AllocId>,
        unavailable: BTreeSet<TargetId>,
    },
}

#[derive(Default)]
struct Effects {
    events: Vec<AllocationEvent>,
    audits: Vec<AuditEvent>,
    preempt_notices: Vec<TargetId>,
    wake_sweeper: bool,
    report: MaintenanceReport,
}

impl Effects {
    fn state_changed(&mut self, alloc: &Allocation) {
        self.events.push(AllocationEvent {
            allocid: alloc.id.clone(),
            state: alloc.state,
            group_allocated: alloc.group_allocated.clone(),
            end_reason: alloc.end_reason,
        });
    }

    fn audit(&mut self, id: &AllocId, user: Option<&str>, action: &str, payload: Option<String>) {
        self.audits
            .push(build_audit_event(id.as_str(), user, action, payload));
    }
}

struct EngineState<St, Q> {
    store: St,
    queue: Q,
    retired: HashMap<AllocId, Allocation>,
    uuids: HashMap<String, u128>,
    next_seq: u64,
}

/// Multi-target allocation engine.
///
/// Generic over the store and the wait queue so the same admission logic
/// runs against the in-memory and the file-backed store.
pub struct AllocationEngine<St, Q> {
    policy: AllocationPolicy,
    state: Mutex<EngineState<St, Q>>,
    views: RwLock<HashMap<AllocId, Allocation>>,
    registry: Arc<dyn TargetRegistry>,
    auth: Arc<dyn AuthProvider>,
    drivers: DriverRegistry,
    audit: Option<Mutex<Box<dyn AuditSink>>>,
    events: EventBus,
    signal: Arc<SweepSignal>,
}

impl<St, Q> AllocationEngine<St, Q>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    /// Build an engine over `store`, rebuilding the wait queue from any
    /// queued records it already holds.
    ///
    /// # Errors
    /// Fails with [`BrokerError::Invariant`] when the recovered state is
    /// inconsistent, or [`BrokerError::QueueFull`] when more allocations were
    /// queued than `queue` accepts.
    pub fn new(
        policy: AllocationPolicy,
        store: St,
        queue: Q,
        registry: Arc<dyn TargetRegistry>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, BrokerError> {
        let mut state = EngineState {
            store,
            queue,
            retired: HashMap::new(),
            uuids: HashMap::new(),
            next_seq: 1,
        };

        let recovered: Vec<Allocation> = state.store.allocations().into_iter().cloned().collect();
        for alloc in &recovered {
            state.next_seq = state.next_seq.max(alloc.queue_seq + 1);
            if let Some(ExtraValue::Str(uuid)) = alloc.extra_data.get(EXTRA_UUID_KEY) {
                state.uuids.insert(uuid.clone(), alloc.created_at_ms);
            }
            if alloc.state == AllocState::Queued {
                state.queue.push(QueueEntry {
                    alloc: alloc.id.clone(),
                    rank: policy.priority_order.rank(alloc.priority),
                    seq: alloc.queue_seq,
                    enqueued_at_ms: alloc.created_at_ms,
                })?;
            }
        }
        verify_invariants(&state)?;
        if !recovered.is_empty() {
            info!(
                allocations = recovered.len(),
                queued = state.queue.len(),
                "recovered allocation state"
            );
        }

        let views = recovered.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(Self {
            policy,
            state: Mutex::new(state),
            views: RwLock::new(views),
            registry,
            auth,
            drivers: DriverRegistry::new(),
            audit: None,
            events: EventBus::new(),
            signal: Arc::new(SweepSignal::new()),
        })
    }

    /// Record every action into `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Mutex::new(sink));
        self
    }

    /// Use `drivers` for preemption notices.
    #[must_use]
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// Active policy.
    pub const fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Target registry consulted for existence and capabilities.
    pub fn registry(&self) -> &Arc<dyn TargetRegistry> {
        &self.registry
    }

    /// Identity provider used for admin checks.
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Signal the engine raises when a sweep should run early.
    pub fn signal(&self) -> Arc<SweepSignal> {
        Arc::clone(&self.signal)
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<AllocationEvent> {
        self.events.subscribe()
    }

    /// Create an allocation: grant it now, queue it, or fail.
    ///
    /// Validation runs before the engine lock is taken; a rejected request
    /// leaves no trace.
    ///
    /// # Errors
    /// Validation errors, [`BrokerError::Busy`] when not queuing and no
    /// alternative is free, [`BrokerError::QueueFull`], or a store failure.
    pub fn create(
        &self,
        caller: &str,
        request: CreateRequest,
        now_ms: u128,
    ) -> Result<Grant, BrokerError> {
        let queue = request.queue;
        let draft = self.prepare(caller, request, now_ms)?;
        self.locked(|st, fx| {
            let id = self.create_locked(st, draft, queue, now_ms, fx)?;
            let current = st
                .store
                .get(&id)
                .or_else(|| st.retired.get(&id))
                .ok_or_else(|| BrokerError::Invariant(format!("{id} vanished during create")))?;
            Ok(Grant {
                allocid: id.clone(),
                state: current.state,
                group_allocated: current.group_allocated.clone(),
                targets: current.targets_granted.clone(),
            })
        })
    }

    /// Release an allocation, queued or holding targets.
    ///
    /// # Errors
    /// [`BrokerError::NoSuchAllocation`] when the id is not live,
    /// [`BrokerError::Forbidden`] when `caller` is not creator, owner or
    /// admin.
    pub fn release(&self, id: &AllocId, caller: &str, now_ms: u128) -> Result<(), BrokerError> {
        self.locked(|st, fx| {
            let alloc = st
                .store
                .get(id)
                .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
            if !acl::may_release(alloc, caller, self.auth.as_ref()) {
                return Err(BrokerError::Forbidden(format!(
                    "{caller} may not release {id}"
                )));
            }
            self.retire(st, id, AllocState::Done, EndReason::Removed, Some(caller), now_ms, fx)?;
            self.sweep_locked(st, now_ms, fx)
        })
    }

    /// Add a guest; adding one already present is a no-op.
    ///
    /// # Errors
    /// [`BrokerError::NoSuchAllocation`] or [`BrokerError::Forbidden`].
    pub fn add_guest(&self, id: &AllocId, caller: &str, guest: &str) -> Result<(), BrokerError> {
        self.locked(|st, fx| {
            let alloc = st
                .store
                .get(id)
                .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
            if !acl::may_manage_guests(alloc, caller, self.auth.as_ref()) {
                return Err(BrokerError::Forbidden(format!(
                    "{caller} may not add guests to {id}"
                )));
            }
            if alloc.is_guest(guest) {
                return Ok(());
            }
            let mut alloc = alloc.clone();
            alloc.guests.insert(guest.to_string());
            st.store.put(alloc.clone())?;
            self.publish(&alloc);
            fx.audit(id, Some(caller), "guest-add", Some(guest.to_string()));
            Ok(())
        })
    }

    /// Remove a guest; removing one that is absent is a no-op.
    ///
    /// # Errors
    /// [`BrokerError::NoSuchAllocation`] or [`BrokerError::Forbidden`] when a
    /// guest tries to remove someone other than itself.
    pub fn remove_guest(
        &self,
        id: &AllocId,
        caller: &str,
        guest: &str,
    ) -> Result<(), BrokerError> {
        self.locked(|st, fx| {
            let alloc = st
                .store
                .get(id)
                .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
            if !acl::may_remove_guest(alloc, caller, guest, self.auth.as_ref()) {
                return Err(BrokerError::Forbidden(format!(
                    "{caller} may not remove guest {guest} from {id}"
                )));
            }
            if !alloc.is_guest(guest) {
                return Ok(());
            }
            let mut alloc = alloc.clone();
            alloc.guests.remove(guest);
            st.store.put(alloc.clone())?;
            self.publish(&alloc);
            fx.audit(id, Some(caller), "guest-remove", Some(guest.to_string()));
            Ok(())
        })
    }

    /// Push back idle expiry and report the current state.
    ///
    /// Finished allocations still within the retention window answer with
    /// their final state so a client learns why its allocation went away.
    ///
    /// # Errors
    /// [`BrokerError::NoSuchAllocation`] or [`BrokerError::Forbidden`].
    pub fn keepalive(
        &self,
        id: &AllocId,
        caller: &str,
        now_ms: u128,
    ) -> Result<KeepaliveReply, BrokerError> {
        self.locked(|st, _fx| {
            let alloc = st
                .store
                .get(id)
                .or_else(|| st.retired.get(id))
                .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
            if !acl::may_keepalive(alloc, caller, self.auth.as_ref()) {
                return Err(BrokerError::Forbidden(format!(
                    "{caller} may not keep {id} alive"
                )));
            }
            let reply = KeepaliveReply {
                state: alloc.state,
                group_allocated: alloc.group_allocated.clone(),
            };
            if alloc.state.is_live() {
                let mut alloc = alloc.clone();
                alloc.last_keepalive_ms = alloc.last_keepalive_ms.max(now_ms);
                st.store.put(alloc.clone())?;
                self.publish(&alloc);
            }
            Ok(reply)
        })
    }

    /// Full record of one allocation, including finished ones still retained.
    ///
    /// # Errors
    /// [`BrokerError::NoSuchAllocation`] or [`BrokerError::Forbidden`] when
    /// `caller` has no stake in it.
    pub fn query(&self, id: &AllocId, caller: &str) -> Result<Allocation, BrokerError> {
        let views = self.views.read();
        let alloc = views
            .get(id)
            .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
        if !acl::may_query(alloc, caller, self.auth.as_ref()) {
            return Err(BrokerError::Forbidden(format!("{caller} may not read {id}")));
        }
        Ok(alloc.clone())
    }

    /// Allocations visible to `caller`, oldest first. Admins see all.
    pub fn list(&self, caller: &str) -> Vec<Allocation> {
        let mut visible: Vec<Allocation> = self
            .views
            .read()
            .values()
            .filter(|a| acl::may_query(a, caller, self.auth.as_ref()))
            .cloned()
            .collect();
        visible.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        visible
    }

    /// Allocation currently holding `target`.
    pub fn owner_of(&self, target: &str) -> Option<AllocId> {
        self.state.lock().store.owner_of(target).cloned()
    }

    /// Number of queued allocations.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Walk the wait queue and grant whatever is now satisfiable.
    ///
    /// # Errors
    /// Store failures or an ownership inconsistency.
    pub fn sweep(&self, now_ms: u128) -> Result<MaintenanceReport, BrokerError> {
        self.locked(|st, fx| {
            self.sweep_locked(st, now_ms, fx)?;
            Ok(fx.report.clone())
        })
    }

    /// Periodic housekeeping: expire allocations, finish preemptions whose
    /// grace window ended, sweep the queue, purge old finished records and
    /// forget stale request UUIDs.
    ///
    /// # Errors
    /// Store failures or an ownership inconsistency.
    pub fn maintenance(&self, now_ms: u128) -> Result<MaintenanceReport, BrokerError> {
        self.locked(|st, fx| {
            let idle_ms = self.policy.idle_timeout.as_millis();
            let due: Vec<(AllocId, EndReason)> = st
                .store
                .allocations()
                .into_iter()
                .filter(|a| a.expires_at_ms(idle_ms).is_some_and(|at| at <= now_ms))
                .map(|a| (a.id.clone(), a.expiry_reason()))
                .collect();
            for (id, reason) in due {
                if !st.store.contains(&id) {
                    continue;
                }
                self.retire(st, &id, AllocState::Done, reason, None, now_ms, fx)?;
                if reason == EndReason::TimedOut {
                    fx.report.timed_out += 1;
                } else {
                    fx.report.expired += 1;
                }
            }

            self.sweep_locked(st, now_ms, fx)?;

            let retention_ms = self.policy.done_retention.as_millis();
            let purged: Vec<AllocId> = st
                .retired
                .values()
                .filter(|a| {
                    a.ended_at_ms
                        .is_none_or(|ended| ended.saturating_add(retention_ms) <= now_ms)
                })
                .map(|a| a.id.clone())
                .collect();
            if !purged.is_empty() {
                let mut views = self.views.write();
                for id in &purged {
                    st.retired.remove(id);
                    views.remove(id);
                }
                fx.report.purged = purged.len();
                debug!(purged = purged.len(), "purged finished allocations");
            }

            let max_age_ms = self.policy.uuid_max_age.as_millis();
            st.uuids
                .retain(|_, seen| seen.saturating_add(max_age_ms) > now_ms);

            Ok(fx.report.clone())
        })
    }

    /// Earliest instant at which [`AllocationEngine::maintenance`] has work:
    /// an expiry, a grace deadline or a retention deadline.
    pub fn next_deadline_ms(&self) -> Option<u128> {
        let st = self.state.lock();
        let idle_ms = self.policy.idle_timeout.as_millis();
        let retention_ms = self.policy.done_retention.as_millis();
        let live = st.store.allocations().into_iter().flat_map(|a| {
            let grace = a.restart.as_ref().map(|r| r.grace_deadline_ms);
            a.expires_at_ms(idle_ms).into_iter().chain(grace)
        });
        let retired = st
            .retired
            .values()
            .filter_map(|a| a.ended_at_ms.map(|t| t.saturating_add(retention_ms)));
        live.chain(retired).min()
    }

    /// Cross-check ownership pointers, records and the wait queue.
    ///
    /// # Errors
    /// [`BrokerError::Invariant`] naming the first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), BrokerError> {
        let st = self.state.lock();
        verify_invariants(&st)
    }

    fn locked<T>(
        &self,
        f: impl FnOnce(&mut EngineState<St, Q>, &mut Effects) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut fx = Effects::default();
        let result = {
            let mut st = self.state.lock();
            let result = f(&mut *st, &mut fx);
            // Still under the state lock so every subscriber and sink sees
            // transitions in commit order. Unbounded sends never block.
            self.record(&mut fx);
            result
        };
        self.notify(&fx);
        result
    }

    fn record(&self, fx: &mut Effects) {
        self.events.publish(&fx.events);
        if let Some(sink) = &self.audit {
            let mut sink = sink.lock();
            for event in fx.audits.drain(..) {
                sink.record(event);
            }
        }
    }

    fn notify(&self, fx: &Effects) {
        for target in &fx.preempt_notices {
            self.drivers.notify_preempt(self.registry.as_ref(), target);
        }
        if fx.wake_sweeper {
            self.signal.notify();
        }
    }

    fn publish(&self, alloc: &Allocation) {
        self.views.write().insert(alloc.id.clone(), alloc.clone());
    }

    fn prepare(
        &self,
        caller: &str,
        request: CreateRequest,
        now_ms: u128,
    ) -> Result<Allocation, BrokerError> {
        request.groups.validate(self.registry.as_ref())?;
        let priority = self.check_priority(request.priority)?;
        if request.preempt {
            self.check_preempt_right(caller)?;
        }
        let expiry = self.parse_endtime(request.endtime.as_deref(), now_ms)?;
        let extra_data = normalize_extra_data(request.extra_data)?;
        let reason = request
            .reason
            .map(|r| r.chars().take(self.policy.reason_len_max).collect::<String>());
        let owner = request
            .obo_user
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| caller.to_string());
        let guests = request
            .guests
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect();

        Ok(Allocation {
            id: AllocId::generate(),
            creator: caller.to_string(),
            owner,
            guests,
            groups: request.groups,
            priority,
            preempt: request.preempt,
            state: AllocState::Queued,
            queue_seq: 0,
            created_at_ms: now_ms,
            last_keepalive_ms: now_ms,
            expiry,
            group_allocated: None,
            targets_granted: Vec::new(),
            activated_at_ms: None,
            reason,
            extra_data,
            restart: None,
            preempting_group: None,
            end_reason: None,
            ended_at_ms: None,
        })
    }

    fn check_priority(&self, requested: Option<i64>) -> Result<u32, BrokerError> {
        let (min, max) = (self.policy.priority_min, self.policy.priority_max);
        let Some(value) = requested else {
            return Ok(self.policy.default_priority);
        };
        let invalid = || BrokerError::InvalidPriority { value, min, max };
        if value < i64::from(min) || value > i64::from(max) {
            return Err(invalid());
        }
        u32::try_from(value).map_err(|_| invalid())
    }

    fn check_preempt_right(&self, caller: &str) -> Result<(), BrokerError> {
        match self.policy.preemption {
            PreemptionPolicy::Any => Ok(()),
            PreemptionPolicy::Disabled => Err(BrokerError::PreemptionNotAllowed(
                "preemption is disabled".into(),
            )),
            PreemptionPolicy::AdminOnly if self.auth.is_admin(caller) => Ok(()),
            PreemptionPolicy::AdminOnly => Err(BrokerError::PreemptionNotAllowed(format!(
                "{caller} needs the admin role to preempt"
            ))),
        }
    }

    fn parse_endtime(&self, raw: Option<&str>, now_ms: u128) -> Result<Expiry, BrokerError> {
        let raw = match raw {
            None => return Ok(Expiry::Idle),
            Some(ENDTIME_STATIC) => return Ok(Expiry::Static),
            Some(raw) => raw,
        };
        let at = NaiveDateTime::parse_from_str(raw, ENDTIME_FORMAT)
            .map_err(|e| BrokerError::InvalidEndtime(format!("{raw}: {e}")))?;
        let at_ms = u128::try_from(at.and_utc().timestamp_millis())
            .map_err(|_| BrokerError::InvalidEndtime(format!("{raw}: before the epoch")))?;
        let lead = self.policy.endtime_min_lead;
        if at_ms < now_ms.saturating_add(lead.as_millis()) {
            return Err(BrokerError::InvalidEndtime(format!(
                "{raw}: must be at least {}s ahead of now",
                lead.as_secs()
            )));
        }
        Ok(Expiry::At(at_ms))
    }

    fn create_locked(
        &self,
        st: &mut EngineState<St, Q>,
        mut alloc: Allocation,
        queue: bool,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<AllocId, BrokerError> {
        while st.store.contains(&alloc.id) || st.retired.contains_key(&alloc.id) {
            alloc.id = AllocId::generate();
        }
        let uuid = match alloc.extra_data.get(EXTRA_UUID_KEY) {
            Some(ExtraValue::Str(uuid)) => Some(uuid.clone()),
            _ => None,
        };
        if let Some(uuid) = &uuid {
            self.check_uuid_unused(st, uuid, now_ms)?;
        }
        alloc.queue_seq = st.next_seq;
        let id = alloc.id.clone();

        let reserved = reservations(st, self.policy.priority_order, alloc.priority);
        let (conflicts, unavailable) = match self.admit(st, &alloc, &reserved, false) {
            Admission::Grant { group, targets } => {
                st.next_seq += 1;
                self.remember_uuid(st, uuid, now_ms);
                fx.audit(&id, Some(alloc.creator.as_str()), "create", None);
                self.activate(st, alloc, group, targets, now_ms, fx)?;
                return Ok(id);
            }
            Admission::Preempt { victims, .. } => (victims, BTreeSet::new()),
            Admission::Blocked {
                conflicts,
                unavailable,
            } => (conflicts, unavailable),
        };

        if !queue {
            debug!(owner = %alloc.owner, ?conflicts, ?unavailable, "allocation busy");
            if conflicts.is_empty() && !unavailable.is_empty() {
                return Err(BrokerError::TargetUnavailable {
                    targets: unavailable.into_iter().collect(),
                });
            }
            return Err(BrokerError::Busy {
                conflicts: conflicts.into_iter().collect(),
            });
        }

        st.queue.push(QueueEntry {
            alloc: id.clone(),
            rank: self.policy.priority_order.rank(alloc.priority),
            seq: alloc.queue_seq,
            enqueued_at_ms: now_ms,
        })?;
        if let Err(e) = st.store.put(alloc.clone()) {
            st.queue.remove(&id);
            return Err(e);
        }
        st.next_seq += 1;
        self.remember_uuid(st, uuid, now_ms);
        info!(allocid = %id, owner = %alloc.owner, priority = alloc.priority, "allocation queued");
        self.publish(&alloc);
        fx.state_changed(&alloc);
        fx.audit(&id, Some(alloc.creator.as_str()), "queue", None);
        self.sweep_locked(st, now_ms, fx)?;
        Ok(id)
    }

    fn check_uuid_unused(
        &self,
        st: &EngineState<St, Q>,
        uuid: &str,
        now_ms: u128,
    ) -> Result<(), BrokerError> {
        let max_age_ms = self.policy.uuid_max_age.as_millis();
        match st.uuids.get(uuid) {
            Some(seen) if seen.saturating_add(max_age_ms) > now_ms => Err(
                BrokerError::InvalidExtraData(format!("{uuid}: UUID has been used already")),
            ),
            _ => Ok(()),
        }
    }

    fn remember_uuid(&self, st: &mut EngineState<St, Q>, uuid: Option<String>, now_ms: u128) {
        let Some(uuid) = uuid else { return };
        st.uuids.insert(uuid, now_ms);
        while st.uuids.len() > self.policy.uuid_max_entries {
            let oldest = st
                .uuids
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(uuid, _)| uuid.clone());
            match oldest {
                Some(oldest) => st.uuids.remove(&oldest),
                None => break,
            };
        }
    }

    /// Decide what `alloc` can have right now.
    ///
    /// Alternatives are tried in caller order; the first fully free one wins.
    /// With `allow_preempt`, the first alternative whose every holder is less
    /// urgent (and none disabled or reserved) is chosen for preemption.
    fn admit(
        &self,
        st: &EngineState<St, Q>,
        alloc: &Allocation,
        reserved: &HashMap<TargetId, AllocId>,
        allow_preempt: bool,
    ) -> Admission {
        let order = self.policy.priority_order;
        let mut conflicts = BTreeSet::new();
        let mut unavailable = BTreeSet::new();
        let mut preemptable: Option<(String, BTreeSet<AllocId>)> = None;

        for group in alloc.groups.iter() {
            let mut free = true;
            let mut victims = BTreeSet::new();
            let mut can_preempt = allow_preempt;
            for target in &group.targets {
                if self.registry.is_disabled(target) || !self.registry.exists(target) {
                    free = false;
                    can_preempt = false;
                    unavailable.insert(target.clone());
                    continue;
                }
                if let Some(holder) = reserved.get(target).filter(|h| **h != alloc.id) {
                    free = false;
                    can_preempt = false;
                    conflicts.insert(holder.clone());
                }
                if let Some(owner) = st.store.owner_of(target) {
                    free = false;
                    conflicts.insert(owner.clone());
                    let less_urgent = st
                        .store
                        .get(owner)
                        .is_some_and(|h| order.more_urgent(alloc.priority, h.priority));
                    if less_urgent {
                        victims.insert(owner.clone());
                    } else {
                        can_preempt = false;
                    }
                }
            }
            if free {
                return Admission::Grant {
                    group: group.name.clone(),
                    targets: group.targets.clone(),
                };
            }
            if can_preempt && preemptable.is_none() && !victims.is_empty() {
                preemptable = Some((group.name.clone(), victims));
            }
        }

        match preemptable {
            Some((group, victims)) => Admission::Preempt { group, victims },
            None => Admission::Blocked {
                conflicts,
                unavailable,
            },
        }
    }

    fn activate(
        &self,
        st: &mut EngineState<St, Q>,
        mut alloc: Allocation,
        group: String,
        targets: Vec<TargetId>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        let claims: Vec<OwnerChange> = targets
            .iter()
            .map(|t| OwnerChange::claim(t.clone(), &alloc.id))
            .collect();
        alloc.state = AllocState::Active;
        alloc.group_allocated = Some(group.clone());
        alloc.targets_granted = targets;
        alloc.activated_at_ms = Some(now_ms);
        alloc.last_keepalive_ms = alloc.last_keepalive_ms.max(now_ms);
        alloc.preempting_group = None;
        if !st.store.apply(&claims, vec![RecordOp::Put(alloc.clone())])? {
            return Err(BrokerError::Invariant(format!(
                "{}: targets of group '{group}' changed owner during admission",
                alloc.id
            )));
        }
        st.queue.remove(&alloc.id);
        info!(
            allocid = %alloc.id,
            owner = %alloc.owner,
            group = %group,
            targets = ?alloc.targets_granted,
            "allocation active"
        );
        self.publish(&alloc);
        fx.state_changed(&alloc);
        fx.audit(&alloc.id, None, "activate", Some(group));
        fx.report.activated += 1;
        Ok(())
    }

    fn sweep_locked(
        &self,
        st: &mut EngineState<St, Q>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        self.finalize_preemptions(st, now_ms, fx)?;
        for _ in 0..MAX_SWEEP_ROUNDS {
            self.sweep_pass(st, now_ms, fx)?;
            if self.finalize_preemptions(st, now_ms, fx)? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// One greedy pass over the wait queue in service order. A blocked entry
    /// does not stop less urgent entries behind it from being granted, but a
    /// preempting entry holds back the free targets of its chosen group.
    fn sweep_pass(
        &self,
        st: &mut EngineState<St, Q>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        let mut reserved: HashMap<TargetId, AllocId> = HashMap::new();
        for id in st.queue.ordered() {
            let Some(alloc) = st.store.get(&id).cloned() else {
                warn!(allocid = %id, "queued allocation has no record; dropping");
                st.queue.remove(&id);
                continue;
            };

            if let Some(missing) = alloc
                .groups
                .all_targets()
                .into_iter()
                .find(|t| !self.registry.exists(t))
            {
                warn!(allocid = %id, target = %missing, "requested target left the registry");
                self.retire(
                    st,
                    &id,
                    AllocState::Rejected,
                    EndReason::TargetRemoved,
                    None,
                    now_ms,
                    fx,
                )?;
                fx.report.rejected += 1;
                continue;
            }

            match self.admit(st, &alloc, &reserved, alloc.preempt) {
                Admission::Grant { group, targets } => {
                    self.activate(st, alloc, group, targets, now_ms, fx)?;
                }
                Admission::Preempt { group, victims } => {
                    if let Some(wanted) = alloc.groups.get(&group) {
                        for target in &wanted.targets {
                            reserved
                                .entry(target.clone())
                                .or_insert_with(|| id.clone());
                        }
                    }
                    self.begin_preemption(st, alloc, group, victims, now_ms, fx)?;
                }
                Admission::Blocked { .. } => {
                    if alloc.preempting_group.is_some() {
                        let mut alloc = alloc;
                        alloc.preempting_group = None;
                        st.store.put(alloc.clone())?;
                        self.publish(&alloc);
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_preemption(
        &self,
        st: &mut EngineState<St, Q>,
        mut preemptor: Allocation,
        group: String,
        victims: BTreeSet<AllocId>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        if preemptor.preempting_group.as_deref() != Some(group.as_str()) {
            preemptor.preempting_group = Some(group.clone());
            st.store.put(preemptor.clone())?;
            self.publish(&preemptor);
        }
        let deadline = now_ms.saturating_add(self.policy.preempt_grace.as_millis());
        for victim_id in victims {
            let Some(victim) = st.store.get(&victim_id) else {
                continue;
            };
            if victim.restart.is_some() {
                continue;
            }
            let mut victim = victim.clone();
            victim.state = AllocState::Restarting;
            victim.restart = Some(RestartInfo {
                preempted_by: preemptor.id.clone(),
                grace_deadline_ms: deadline,
            });
            st.store.put(victim.clone())?;
            info!(
                allocid = %victim.id,
                preempted_by = %preemptor.id,
                group = %group,
                grace_deadline_ms = %deadline,
                "allocation preempted; grace window started"
            );
            fx.preempt_notices
                .extend(victim.targets_granted.iter().cloned());
            fx.wake_sweeper = true;
            self.publish(&victim);
            fx.state_changed(&victim);
            fx.audit(
                &victim.id,
                None,
                "preempt",
                Some(format!("by {}", preemptor.id)),
            );
        }
        Ok(())
    }

    /// Retire holders whose grace window ended while their preemptor still
    /// waits for their targets; return the others to active. Returns how many
    /// holders lost their targets.
    fn finalize_preemptions(
        &self,
        st: &mut EngineState<St, Q>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<usize, BrokerError> {
        let due: Vec<Allocation> = st
            .store
            .allocations()
            .into_iter()
            .filter(|a| {
                a.state == AllocState::Restarting
                    && a.restart
                        .as_ref()
                        .is_some_and(|r| r.grace_deadline_ms <= now_ms)
            })
            .cloned()
            .collect();

        let mut freed = 0;
        for victim in due {
            if preemptor_still_waiting(st, &victim) {
                self.retire(
                    st,
                    &victim.id,
                    AllocState::Done,
                    EndReason::Preempted,
                    None,
                    now_ms,
                    fx,
                )?;
                fx.report.preempted += 1;
                freed += 1;
            } else {
                self.revert_restart(st, victim, fx)?;
            }
        }
        Ok(freed)
    }

    fn revert_restart(
        &self,
        st: &mut EngineState<St, Q>,
        mut victim: Allocation,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        victim.state = AllocState::Active;
        victim.restart = None;
        st.store.put(victim.clone())?;
        info!(allocid = %victim.id, "preemption withdrawn; allocation active again");
        self.publish(&victim);
        fx.state_changed(&victim);
        fx.report.reverted += 1;
        Ok(())
    }

    /// Drop a live allocation, clearing every ownership pointer it holds in
    /// the same store write.
    #[allow(clippy::too_many_arguments)]
    fn retire(
        &self,
        st: &mut EngineState<St, Q>,
        id: &AllocId,
        final_state: AllocState,
        reason: EndReason,
        caller: Option<&str>,
        now_ms: u128,
        fx: &mut Effects,
    ) -> Result<(), BrokerError> {
        let mut alloc = st
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NoSuchAllocation(id.to_string()))?;
        let releases: Vec<OwnerChange> = if alloc.state.holds_targets() {
            alloc
                .targets_granted
                .iter()
                .map(|t| OwnerChange::release(t.clone(), id))
                .collect()
        } else {
            Vec::new()
        };
        if !st.store.apply(&releases, vec![RecordOp::Delete(id.clone())])? {
            return Err(BrokerError::Invariant(format!(
                "{id} does not own the targets it was granted"
            )));
        }
        st.queue.remove(id);

        let waiting_on_it: Vec<Allocation> = st
            .store
            .allocations()
            .into_iter()
            .filter(|a| a.restart.as_ref().is_some_and(|r| &r.preempted_by == id))
            .cloned()
            .collect();
        for victim in waiting_on_it {
            self.revert_restart(st, victim, fx)?;
        }

        alloc.state = final_state;
        alloc.end_reason = Some(reason);
        alloc.ended_at_ms = Some(now_ms);
        alloc.restart = None;
        alloc.preempting_group = None;
        info!(
            allocid = %id,
            state = %final_state,
            reason = ?reason,
            "allocation finished"
        );
        self.publish(&alloc);
        fx.state_changed(&alloc);
        fx.audit(id, caller, end_action(reason), None);
        st.retired.insert(id.clone(), alloc);
        Ok(())
    }
}

impl<St, Q> std::fmt::Debug for AllocationEngine<St, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("policy", &self.policy)
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

const fn end_action(reason: EndReason) -> &'static str {
    match reason {
        EndReason::Removed => "release",
        EndReason::Expired | EndReason::TimedOut => "expire",
        EndReason::Preempted => "preempted",
        EndReason::TargetRemoved => "reject",
    }
}

/// Targets held back from a request of `priority` for queued preemptors
/// that are at least as urgent, most urgent first.
fn reservations<St: AllocationStore, Q: AllocationQueue>(
    st: &EngineState<St, Q>,
    order: PriorityOrder,
    priority: u32,
) -> HashMap<TargetId, AllocId> {
    let mut reserved = HashMap::new();
    for id in st.queue.ordered() {
        let Some(alloc) = st.store.get(&id) else {
            continue;
        };
        if order.more_urgent(priority, alloc.priority) {
            continue;
        }
        let Some(group) = alloc
            .preempting_group
            .as_deref()
            .and_then(|g| alloc.groups.get(g))
        else {
            continue;
        };
        for target in &group.targets {
            reserved.entry(target.clone()).or_insert_with(|| id.clone());
        }
    }
    reserved
}

fn preemptor_still_waiting<St: AllocationStore, Q: AllocationQueue>(
    st: &EngineState<St, Q>,
    victim: &Allocation,
) -> bool {
    let Some(restart) = &victim.restart else {
        return false;
    };
    let Some(preemptor) = st.store.get(&restart.preempted_by) else {
        return false;
    };
    if preemptor.state != AllocState::Queued {
        return false;
    }
    preemptor
        .preempting_group
        .as_deref()
        .and_then(|g| preemptor.groups.get(g))
        .is_some_and(|g| g.targets.iter().any(|t| victim.targets_granted.contains(t)))
}

fn normalize_extra_data(
    mut extra: BTreeMap<String, ExtraValue>,
) -> Result<BTreeMap<String, ExtraValue>, BrokerError> {
    if extra.keys().any(String::is_empty) {
        return Err(BrokerError::InvalidExtraData("empty key".into()));
    }
    if let Some(value) = extra.get_mut(EXTRA_UUID_KEY) {
        let ExtraValue::Str(raw) = value else {
            return Err(BrokerError::InvalidExtraData(
                "uuid must be a string".into(),
            ));
        };
        let parsed = Uuid::parse_str(raw)
            .map_err(|e| BrokerError::InvalidExtraData(format!("{raw}: {e}")))?;
        if parsed.get_version_num() != 4 {
            return Err(BrokerError::InvalidExtraData(format!(
                "{raw}: not a version 4 UUID"
            )));
        }
        *value = ExtraValue::Str(parsed.hyphenated().to_string());
    }
    Ok(extra)
}

fn verify_invariants<St: AllocationStore, Q: AllocationQueue>(
    st: &EngineState<St, Q>,
) -> Result<(), BrokerError> {
    for (target, owner) in st.store.owners() {
        let alloc = st.store.get(&owner).ok_or_else(|| {
            BrokerError::Invariant(format!("{target} owned by missing allocation {owner}"))
        })?;
        if !alloc.state.holds_targets() || !alloc.targets_granted.contains(&target) {
            return Err(BrokerError::Invariant(format!(
                "{target} owned by {owner} which is {} and lists {:?}",
                alloc.state, alloc.targets_granted
            )));
        }
    }

    let mut queued = 0;
    for alloc in st.store.allocations() {
        let id = &alloc.id;
        match alloc.state {
            AllocState::Queued => {
                queued += 1;
                if !st.queue.contains(id) {
                    return Err(BrokerError::Invariant(format!(
                        "queued {id} is missing from the wait queue"
                    )));
                }
            }
            AllocState::Active | AllocState::Restarting => {
                let group = alloc
                    .group_allocated
                    .as_deref()
                    .and_then(|g| alloc.groups.get(g))
                    .ok_or_else(|| {
                        BrokerError::Invariant(format!("{id} is {} without a group", alloc.state))
                    })?;
                if group.targets != alloc.targets_granted {
                    return Err(BrokerError::Invariant(format!(
                        "{id} granted {:?} but group '{}' names {:?}",
                        alloc.targets_granted, group.name, group.targets
                    )));
                }
                if let Some(target) = alloc
                    .targets_granted
                    .iter()
                    .find(|t| st.store.owner_of(t) != Some(id))
                {
                    return Err(BrokerError::Invariant(format!(
                        "{id} lists {target} which it does not own"
                    )));
                }
                if (alloc.state == AllocState::Restarting) != alloc.restart.is_some() {
                    return Err(BrokerError::Invariant(format!(
                        "{id} restart marker does not match state {}",
                        alloc.state
                    )));
                }
                if st.queue.contains(id) {
                    return Err(BrokerError::Invariant(format!(
                        "{id} is {} but still queued",
                        alloc.state
                    )));
                }
            }
            AllocState::Done | AllocState::Rejected => {
                return Err(BrokerError::Invariant(format!(
                    "finished {id} is still stored"
                )));
            }
        }
    }
    if queued != st.queue.len() {
        return Err(BrokerError::Invariant(format!(
            "{queued} queued records but {} queue entries",
            st.queue.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{InMemoryTargetRegistry, StaticRoles};
    use crate::infra::{InMemoryStore, WaitQueue};

    type Engine = AllocationEngine<InMemoryStore, WaitQueue>;

    fn engine_with(policy: AllocationPolicy, targets: &[&str]) -> Engine {
        let registry = Arc::new(InMemoryTargetRegistry::from_ids(targets.iter().copied()));
        let depth = policy.max_queue_depth;
        AllocationEngine::new(
            policy,
            InMemoryStore::new(),
            WaitQueue::new(depth),
            registry,
            Arc::new(StaticRoles::new(["root"])),
        )
        .unwrap()
    }

    fn engine(targets: &[&str]) -> Engine {
        engine_with(AllocationPolicy::default(), targets)
    }

    fn group(targets: &[&str]) -> GroupSpec {
        GroupSpec::new().with_group("g", targets.iter().copied())
    }

    #[test]
    fn first_free_alternative_wins() {
        let e = engine(&["T1", "T2", "T3"]);
        e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let spec = GroupSpec::new()
            .with_group("busy", ["T1", "T2"])
            .with_group("free", ["T2", "T3"]);
        let grant = e.create("b", CreateRequest::new(spec), 0).unwrap();
        assert_eq!(grant.state, AllocState::Active);
        assert_eq!(grant.group_allocated.as_deref(), Some("free"));
        assert_eq!(grant.targets, ["T2", "T3"]);
        e.check_invariants().unwrap();
    }

    #[test]
    fn busy_without_queue_names_holder() {
        let e = engine(&["T1"]);
        let first = e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let err = e.create("b", CreateRequest::new(group(&["T1"])), 0).unwrap_err();
        assert_eq!(err, BrokerError::Busy { conflicts: vec![first.allocid] });
        assert_eq!(e.list("root").len(), 1);
    }

    #[test]
    fn blocked_head_does_not_stall_queue() {
        let e = engine(&["T1", "T2"]);
        e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let blocked = e
            .create("b", CreateRequest::new(group(&["T1", "T2"])).queued().with_priority(0), 1)
            .unwrap();
        let behind = e
            .create("c", CreateRequest::new(group(&["T2"])).queued().with_priority(90), 2)
            .unwrap();
        assert_eq!(blocked.state, AllocState::Queued);
        assert_eq!(behind.state, AllocState::Active);
        e.check_invariants().unwrap();
    }

    #[test]
    fn release_grants_next_in_priority_order() {
        let e = engine(&["T1"]);
        let holder = e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let low = e
            .create("b", CreateRequest::new(group(&["T1"])).queued().with_priority(80), 1)
            .unwrap();
        let high = e
            .create("c", CreateRequest::new(group(&["T1"])).queued().with_priority(10), 2)
            .unwrap();
        e.release(&holder.allocid, "a", 3).unwrap();
        assert_eq!(e.owner_of("T1"), Some(high.allocid.clone()));
        assert_eq!(e.query(&low.allocid, "b").unwrap().state, AllocState::Queued);
        assert_eq!(
            e.release(&holder.allocid, "a", 4).unwrap_err().code(),
            "no-such-allocation"
        );
    }

    #[test]
    fn preemption_waits_for_grace_then_hands_over() {
        let policy = AllocationPolicy {
            preempt_grace: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(3600),
            ..AllocationPolicy::default()
        };
        let e = engine_with(policy, &["T1"]);
        let victim = e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let urgent = e
            .create(
                "root",
                CreateRequest::new(group(&["T1"])).queued().preempting().with_priority(0),
                10,
            )
            .unwrap();
        let held = e.query(&victim.allocid, "a").unwrap();
        assert_eq!(held.state, AllocState::Restarting);
        assert_eq!(e.owner_of("T1"), Some(victim.allocid.clone()));

        let report = e.maintenance(110).unwrap();
        assert_eq!(report.preempted, 1);
        assert_eq!(report.activated, 1);
        assert_eq!(e.owner_of("T1"), Some(urgent.allocid));
        let done = e.query(&victim.allocid, "a").unwrap();
        assert_eq!(done.end_reason, Some(EndReason::Preempted));
        e.check_invariants().unwrap();
    }

    #[test]
    fn withdrawn_preemptor_restores_holder() {
        let policy = AllocationPolicy {
            idle_timeout: Duration::from_secs(3600),
            ..AllocationPolicy::default()
        };
        let e = engine_with(policy, &["T1"]);
        let victim = e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        let urgent = e
            .create(
                "root",
                CreateRequest::new(group(&["T1"])).queued().preempting().with_priority(0),
                0,
            )
            .unwrap();
        e.release(&urgent.allocid, "root", 1).unwrap();
        assert_eq!(e.query(&victim.allocid, "a").unwrap().state, AllocState::Active);
        e.check_invariants().unwrap();
    }

    #[test]
    fn higher_is_urgent_flips_preemption() {
        let policy = AllocationPolicy {
            priority_order: PriorityOrder::HigherIsUrgent,
            preempt_grace: Duration::ZERO,
            idle_timeout: Duration::from_secs(3600),
            ..AllocationPolicy::default()
        };
        let e = engine_with(policy, &["T1"]);
        e.create("a", CreateRequest::new(group(&["T1"])).with_priority(10), 0)
            .unwrap();
        let weaker = e
            .create(
                "root",
                CreateRequest::new(group(&["T1"])).queued().preempting().with_priority(5),
                0,
            )
            .unwrap();
        assert_eq!(weaker.state, AllocState::Queued);
        let stronger = e
            .create(
                "root",
                CreateRequest::new(group(&["T1"])).queued().preempting().with_priority(500),
                0,
            )
            .unwrap();
        assert_eq!(stronger.state, AllocState::Active);
        e.check_invariants().unwrap();
    }

    #[test]
    fn preemption_requires_admin_by_default() {
        let e = engine(&["T1"]);
        let err = e
            .create("a", CreateRequest::new(group(&["T1"])).queued().preempting(), 0)
            .unwrap_err();
        assert_eq!(err.code(), "preemption-not-allowed");
        assert!(e.list("root").is_empty());
    }

    #[test]
    fn idle_allocations_time_out() {
        let e = engine(&["T1"]);
        let grant = e.create("a", CreateRequest::new(group(&["T1"])), 0).unwrap();
        e.keepalive(&grant.allocid, "a", 20_000).unwrap();
        assert_eq!(e.maintenance(40_000).unwrap().timed_out, 0);
        assert_eq!(e.maintenance(50_000).unwrap().timed_out, 1);
        assert_eq!(e.owner_of("T1"), None);
        let reply = e.keepalive(&grant.allocid, "a", 50_001).unwrap();
        assert_eq!(reply.state, AllocState::Done);
    }

    #[test]
    fn endtime_must_be_ahead() {
        let e = engine(&["T1"]);
        let now = 1_700_000_000_000;
        let err = e
            .create("a", CreateRequest::new(group(&["T1"])).with_endtime("20000101000000"), now)
            .unwrap_err();
        assert_eq!(err.code(), "invalid-endtime");
        let err = e
            .create("a", CreateRequest::new(group(&["T1"])).with_endtime("tomorrow"), now)
            .unwrap_err();
        assert_eq!(err.code(), "invalid-endtime");
        let ok = e
            .create("a", CreateRequest::new(group(&["T1"])).with_endtime("20990101000000"), now)
            .unwrap();
        assert!(matches!(
            e.query(&ok.allocid, "a").unwrap().expiry,
            Expiry::At(_)
        ));
    }

    #[test]
    fn uuid_cannot_be_reused() {
        let e = engine(&["T1", "T2"]);
        let uuid = Uuid::new_v4().to_string();
        let first = CreateRequest::new(group(&["T1"])).with_extra("uuid", ExtraValue::Str(uuid.clone()));
        e.create("a", first, 0).unwrap();
        let again = CreateRequest::new(group(&["T2"])).with_extra("uuid", ExtraValue::Str(uuid));
        assert_eq!(e.create("a", again, 1).unwrap_err().code(), "invalid-extra-data");
        let bogus = CreateRequest::new(group(&["T2"])).with_extra("uuid", ExtraValue::Int(4));
        assert_eq!(e.create("a", bogus, 1).unwrap_err().code(), "invalid-extra-data");
    }

    #[test]
    fn disabled_target_is_never_granted() {
        let registry = Arc::new(InMemoryTargetRegistry::from_ids(["T1", "T2"]));
        registry.set_disabled("T1", true);
        let e: Engine = AllocationEngine::new(
            AllocationPolicy::default(),
            InMemoryStore::new(),
            WaitQueue::new(8),
            registry.clone(),
            Arc::new(StaticRoles::new(["root"])),
        )
        .unwrap();
        let spec = GroupSpec::new()
            .with_group("first", ["T1"])
            .with_group("second", ["T2"]);
        let grant = e.create("a", CreateRequest::new(spec), 0).unwrap();
        assert_eq!(grant.group_allocated.as_deref(), Some("second"));

        let err = e.create("c", CreateRequest::new(group(&["T1"])), 0).unwrap_err();
        assert_eq!(
            err,
            BrokerError::TargetUnavailable {
                targets: vec!["T1".into()]
            }
        );

        let waiting = e
            .create("b", CreateRequest::new(group(&["T1"])).queued(), 0)
            .unwrap();
        assert_eq!(waiting.state, AllocState::Queued);
        registry.set_disabled("T1", false);
        e.sweep(1).unwrap();
        assert_eq!(e.owner_of("T1"), Some(waiting.allocid));
    }

    #[test]
    fn removed_target_rejects_queued_request() {
        let registry = Arc::new(InMemoryTargetRegistry::from_ids(["T1"]));
        let e: Engine = AllocationEngine::new(
            AllocationPolicy::default(),
            InMemoryStore::new(),
            WaitQueue::new(8),
            registry.clone(),
            Arc::new(StaticRoles::new(["root"])),
        )
        .unwrap();
        e.create("a", CreateRequest::new(group(&["T1"])).with_endtime("static"), 0)
            .unwrap();
        let waiting = e
            .create("b", CreateRequest::new(group(&["T1"])).queued().with_endtime("static"), 0)
            .unwrap();
        registry.remove("T1");
        let report = e.maintenance(1).unwrap();
        assert_eq!(report.rejected, 1);
        let rejected = e.query(&waiting.allocid, "b").unwrap();
        assert_eq!(rejected.state, AllocState::Rejected);
        assert_eq!(rejected.end_reason, Some(EndReason::TargetRemoved));
    }

    #[test]
    fn finished_records_are_purged_after_retention() {
        let e = engine(&["T1"]);
        let grant = e
            .create("a", CreateRequest::new(group(&["T1"])).with_endtime("static"), 0)
            .unwrap();
        e.release(&grant.allocid, "a", 0).unwrap();
        assert_eq!(e.next_deadline_ms(), Some(300_000));
        assert_eq!(e.maintenance(299_999).unwrap().purged, 0);
        assert!(e.query(&grant.allocid, "a").is_ok());
        assert_eq!(e.maintenance(300_000).unwrap().purged, 1);
        assert_eq!(
            e.query(&grant.allocid, "a").unwrap_err().code(),
            "no-such-allocation"
        );
    }
}
