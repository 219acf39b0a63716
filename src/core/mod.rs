//! Core allocation abstractions: records, ownership store, wait queue and the
//! engine that ties them together.

pub mod acl;
pub mod allocation;
pub mod audit;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod store;
pub mod wake;

pub use acl::{AuthProvider, StaticRoles};
pub use allocation::{
    AllocState, Allocation, EndReason, Expiry, ExtraValue, GroupSpec, RestartInfo, TargetGroup,
};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use driver::{DriverHook, DriverRegistry, Spawn};
pub use engine::{
    AllocationEngine, CreateRequest, Grant, KeepaliveReply, MaintenanceReport, ENDTIME_FORMAT,
    ENDTIME_STATIC, EXTRA_UUID_KEY,
};
pub use error::{AppResult, BrokerError};
pub use events::{AllocationEvent, EventBus};
pub use policy::{AllocationPolicy, PreemptionPolicy, PriorityOrder};
pub use queue::{AllocationQueue, QueueEntry};
pub use registry::{InMemoryTargetRegistry, TargetInfo, TargetRegistry};
pub use store::{AllocationStore, OwnerChange, RecordOp};
pub use wake::{SweepSignal, Wake, WakeState};
