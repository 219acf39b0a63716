//! API-facing request/response models and handlers.
//!
//! Handlers mirror the HTTP surface one to one (`PUT /allocation`,
//! `DELETE /allocation/{id}`, `PATCH /allocation/{id}/{guest}`, ...) but stay
//! transport-free: the caller's identity is already authenticated and the
//! server maps [`ApiError::status`] onto its response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{
    AllocState, Allocation, AllocationEngine, AllocationQueue, AllocationStore, BrokerError,
    CreateRequest, EndReason, Expiry, ExtraValue, GroupSpec,
};
use crate::util::{AllocId, TargetId, UserId};

/// Body of `PUT /allocation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationRequest {
    /// Group name → ordered target ids.
    pub groups: GroupSpec,
    /// Wait instead of failing when busy.
    pub queue: bool,
    /// Requested priority.
    pub priority: Option<i64>,
    /// Ask for less urgent holders to be preempted.
    pub preempt: bool,
    /// Owner when acting on behalf of someone else.
    pub obo_user: Option<UserId>,
    /// Initial guests.
    pub guests: Vec<UserId>,
    /// `static` or `YYYYmmddHHMMSS` (UTC).
    pub endtime: Option<String>,
    /// Free-text reason.
    pub reason: Option<String>,
    /// Driver-specific scalars.
    pub extra_data: BTreeMap<String, ExtraValue>,
}

impl From<AllocationRequest> for CreateRequest {
    fn from(req: AllocationRequest) -> Self {
        Self {
            groups: req.groups,
            priority: req.priority,
            queue: req.queue,
            preempt: req.preempt,
            obo_user: req.obo_user,
            guests: req.guests,
            endtime: req.endtime,
            reason: req.reason,
            extra_data: req.extra_data,
        }
    }
}

/// Reply to `PUT /allocation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCreated {
    /// New allocation id.
    pub allocid: AllocId,
    /// `active` or `queued`.
    pub state: AllocState,
    /// Granted group when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_allocated: Option<String>,
}

/// Reply to `GET /allocation/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationView {
    /// Allocation id.
    pub allocid: AllocId,
    /// Lifecycle state.
    pub state: AllocState,
    /// Requesting identity.
    pub creator: UserId,
    /// Owning identity.
    pub owner: UserId,
    /// Guests, sorted.
    pub guests: Vec<UserId>,
    /// Alternatives requested.
    pub groups: GroupSpec,
    /// Priority.
    pub priority: u32,
    /// Preemption requested.
    pub preempt: bool,
    /// Group granted, once active.
    pub group_allocated: Option<String>,
    /// Targets granted, once active.
    pub targets_granted: Vec<TargetId>,
    /// Creation time, ms since epoch.
    pub created_at_ms: u128,
    /// Last keepalive, ms since epoch.
    pub last_keepalive_ms: u128,
    /// `static`, `idle` or an explicit instant.
    pub expiry: Expiry,
    /// Activation time.
    pub activated_at_ms: Option<u128>,
    /// Reason given at creation.
    pub reason: Option<String>,
    /// Extra data given at creation.
    pub extra_data: BTreeMap<String, ExtraValue>,
    /// Allocation waiting for this one's targets while restarting.
    pub preempted_by: Option<AllocId>,
    /// Grace deadline while restarting.
    pub grace_deadline_ms: Option<u128>,
    /// Why it ended.
    pub end_reason: Option<EndReason>,
    /// When it ended.
    pub ended_at_ms: Option<u128>,
}

impl From<&Allocation> for AllocationView {
    fn from(a: &Allocation) -> Self {
        Self {
            allocid: a.id.clone(),
            state: a.state,
            creator: a.creator.clone(),
            owner: a.owner.clone(),
            guests: a.guests.iter().cloned().collect(),
            groups: a.groups.clone(),
            priority: a.priority,
            preempt: a.preempt,
            group_allocated: a.group_allocated.clone(),
            targets_granted: a.targets_granted.clone(),
            created_at_ms: a.created_at_ms,
            last_keepalive_ms: a.last_keepalive_ms,
            expiry: a.expiry,
            activated_at_ms: a.activated_at_ms,
            reason: a.reason.clone(),
            extra_data: a.extra_data.clone(),
            preempted_by: a.restart.as_ref().map(|r| r.preempted_by.clone()),
            grace_deadline_ms: a.restart.as_ref().map(|r| r.grace_deadline_ms),
            end_reason: a.end_reason,
            ended_at_ms: a.ended_at_ms,
        }
    }
}

/// Reply to `GET /allocation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationList {
    /// Allocations visible to the caller, oldest first.
    pub allocations: Vec<AllocationView>,
}

/// Reply to `PUT /keepalive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveResponse {
    /// Current state.
    pub state: AllocState,
    /// Granted group when active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_allocated: Option<String>,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Allocations waiting in the queue.
    pub queued: usize,
}

/// Error body returned by every handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable code.
    pub code: String,
    /// HTTP status to answer with.
    pub status: u16,
    /// Human-readable detail.
    pub message: String,
    /// Holders of contended targets for `busy`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<AllocId>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "invalid-request".into(),
            status: 400,
            message: message.into(),
            conflicts: Vec::new(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// HTTP status for an engine error.
#[must_use]
pub const fn status_for(err: &BrokerError) -> u16 {
    match err {
        BrokerError::TargetUnknown { .. }
        | BrokerError::DuplicateTarget { .. }
        | BrokerError::InvalidGroupSpec(_)
        | BrokerError::InvalidPriority { .. }
        | BrokerError::InvalidEndtime(_)
        | BrokerError::InvalidExtraData(_) => 400,
        BrokerError::Forbidden(_) | BrokerError::PreemptionNotAllowed(_) => 403,
        BrokerError::NoSuchAllocation(_) => 404,
        BrokerError::Busy { .. } | BrokerError::TargetUnavailable { .. } => 409,
        BrokerError::QueueFull(_) => 429,
        BrokerError::Backend(_) | BrokerError::Invariant(_) => 500,
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        if matches!(err, BrokerError::Backend(_) | BrokerError::Invariant(_)) {
            tracing::error!(error = %err, "allocation request failed internally");
        }
        let conflicts = match &err {
            BrokerError::Busy { conflicts } => conflicts.clone(),
            _ => Vec::new(),
        };
        Self {
            code: err.code().to_string(),
            status: status_for(&err),
            message: err.to_string(),
            conflicts,
        }
    }
}

/// Decode a `PUT /allocation` body.
pub fn parse_allocation_request(body: &str) -> Result<AllocationRequest, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::bad_request(format!("malformed body: {e}")))
}

fn parse_id(raw: &str) -> Result<AllocId, ApiError> {
    AllocId::parse(raw).ok_or_else(|| BrokerError::NoSuchAllocation(raw.to_string()).into())
}

/// `PUT /allocation`.
pub fn put_allocation<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    body: AllocationRequest,
    now_ms: u128,
) -> Result<AllocationCreated, ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let grant = engine.create(caller, body.into(), now_ms).map_err(|e| {
        tracing::warn!(caller, code = e.code(), error = %e, "allocation request rejected");
        ApiError::from(e)
    })?;
    Ok(AllocationCreated {
        allocid: grant.allocid,
        state: grant.state,
        group_allocated: grant.group_allocated,
    })
}

/// `DELETE /allocation/{id}`.
pub fn delete_allocation<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    allocid: &str,
    now_ms: u128,
) -> Result<(), ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let id = parse_id(allocid)?;
    Ok(engine.release(&id, caller, now_ms)?)
}

/// `PATCH /allocation/{id}/{guest}`.
pub fn patch_guest<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    allocid: &str,
    guest: &str,
) -> Result<(), ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    if guest.trim().is_empty() {
        return Err(ApiError::bad_request("guest identity is empty"));
    }
    let id = parse_id(allocid)?;
    Ok(engine.add_guest(&id, caller, guest)?)
}

/// `DELETE /allocation/{id}/{guest}`.
pub fn delete_guest<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    allocid: &str,
    guest: &str,
) -> Result<(), ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let id = parse_id(allocid)?;
    Ok(engine.remove_guest(&id, caller, guest)?)
}

/// `GET /allocation/{id}`.
pub fn get_allocation<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    allocid: &str,
) -> Result<AllocationView, ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let id = parse_id(allocid)?;
    let alloc = engine.query(&id, caller)?;
    Ok(AllocationView::from(&alloc))
}

/// `GET /allocation`.
pub fn list_allocations<St, Q>(engine: &AllocationEngine<St, Q>, caller: &str) -> AllocationList
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    AllocationList {
        allocations: engine.list(caller).iter().map(AllocationView::from).collect(),
    }
}

/// `PUT /keepalive` for one allocation.
pub fn keepalive<St, Q>(
    engine: &AllocationEngine<St, Q>,
    caller: &str,
    allocid: &str,
    now_ms: u128,
) -> Result<KeepaliveResponse, ApiError>
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    let id = parse_id(allocid)?;
    let reply = engine.keepalive(&id, caller, now_ms)?;
    Ok(KeepaliveResponse {
        state: reply.state,
        group_allocated: reply.group_allocated,
    })
}

/// Return a health payload.
pub fn health<St, Q>(engine: &AllocationEngine<St, Q>) -> Health
where
    St: AllocationStore,
    Q: AllocationQueue,
{
    Health {
        ok: engine.check_invariants().is_ok(),
        queued: engine.queue_len(),
    }
}
