//! Tests for runtime adapters: spawner, sweeper and API handlers

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use prometheus_target_broker::core::{
    AllocState, AllocationEngine, AllocationPolicy, CreateRequest, DriverHook, GroupSpec,
    InMemoryTargetRegistry, PreemptionPolicy, Spawn, StaticRoles,
};
use prometheus_target_broker::infra::{InMemoryStore, WaitQueue};
use prometheus_target_broker::runtime::api;
use prometheus_target_broker::runtime::sweeper::{spawn_sweeper, spawn_tokio_sweeper};
use prometheus_target_broker::runtime::tokio_spawner::{
    AsyncDriverHook, SpawnedDriverHook, TokioSpawner,
};
use prometheus_target_broker::util::now_ms;

type Engine = AllocationEngine<InMemoryStore, WaitQueue>;

fn engine(policy: AllocationPolicy) -> Engine {
    AllocationEngine::new(
        policy,
        InMemoryStore::new(),
        WaitQueue::new(16),
        Arc::new(InMemoryTargetRegistry::from_ids(["T1", "T2"])),
        Arc::new(StaticRoles::new(["root"])),
    )
    .unwrap()
}

fn t1() -> GroupSpec {
    GroupSpec::new().with_group("g", ["T1"])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

struct ForwardingHook(tokio::sync::mpsc::UnboundedSender<String>);

#[async_trait]
impl AsyncDriverHook for ForwardingHook {
    async fn notify_preempt(&self, target: String) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = self.0.send(target);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_driver_hook_runs_async_notice() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let hook = SpawnedDriverHook::new(
        ForwardingHook(tx),
        TokioSpawner::new(tokio::runtime::Handle::current()),
    );

    hook.notify_preempt("board7");

    let target = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notice delivered");
    assert_eq!(target.as_deref(), Some("board7"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_sweeper_expires_idle_allocation() {
    let policy = AllocationPolicy {
        idle_timeout: Duration::from_millis(50),
        ..AllocationPolicy::default()
    };
    let engine = Arc::new(engine(policy));
    let grant = engine.create("alice", CreateRequest::new(t1()), now_ms()).unwrap();

    let task = spawn_tokio_sweeper(
        Arc::clone(&engine),
        Duration::from_secs(1),
        Duration::from_millis(10),
        &tokio::runtime::Handle::current(),
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.owner_of("T1"), None);
    assert_eq!(engine.query(&grant.allocid, "alice").unwrap().state, AllocState::Done);

    engine.signal().shutdown();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("sweeper stops")
        .unwrap();
}

#[test]
fn test_blocking_sweeper_finishes_preemption_after_grace() {
    let policy = AllocationPolicy {
        preemption: PreemptionPolicy::Any,
        preempt_grace: Duration::from_millis(50),
        idle_timeout: Duration::from_secs(3600),
        ..AllocationPolicy::default()
    };
    let engine = Arc::new(engine(policy));
    let holder = engine.create("alice", CreateRequest::new(t1()), now_ms()).unwrap();
    let urgent = engine
        .create("bob", CreateRequest::new(t1()).queued().preempting().with_priority(1), now_ms())
        .unwrap();
    assert_eq!(urgent.state, AllocState::Queued);

    let sweeper = spawn_sweeper(Arc::clone(&engine), Duration::from_secs(5)).unwrap();
    let started = Instant::now();
    while engine.owner_of("T1").as_ref() != Some(&urgent.allocid) {
        assert!(started.elapsed() < Duration::from_secs(3), "preemption never completed");
        std::thread::sleep(Duration::from_millis(10));
    }
    sweeper.stop();

    let victim = engine.query(&holder.allocid, "alice").unwrap();
    assert_eq!(victim.state, AllocState::Done);
    engine.check_invariants().unwrap();
}

#[test]
fn test_api_allocation_round_trip() {
    let engine = engine(AllocationPolicy::default());
    let body = api::parse_allocation_request(
        r#"{"groups": {"pair": ["T1", "T2"]}, "queue": false, "obo_user": "carol"}"#,
    )
    .unwrap();

    let created = api::put_allocation(&engine, "alice", body, 0).unwrap();
    assert_eq!(created.state, AllocState::Active);
    assert_eq!(created.group_allocated.as_deref(), Some("pair"));

    let id = created.allocid.to_string();
    api::patch_guest(&engine, "carol", &id, "dave").unwrap();
    let view = api::get_allocation(&engine, "dave", &id).unwrap();
    assert_eq!(view.owner, "carol");
    assert_eq!(view.creator, "alice");
    assert_eq!(view.guests, ["dave"]);
    assert_eq!(view.targets_granted, ["T1", "T2"]);

    let err = api::keepalive(&engine, "dave", &id, 1).unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (403, "forbidden"));
    assert_eq!(api::keepalive(&engine, "carol", &id, 1).unwrap().state, AllocState::Active);

    assert_eq!(api::list_allocations(&engine, "dave").allocations.len(), 1);
    assert!(api::list_allocations(&engine, "mallory").allocations.is_empty());

    api::delete_allocation(&engine, "alice", &id, 2).unwrap();
    let again = api::delete_allocation(&engine, "alice", &id, 3).unwrap_err();
    assert_eq!((again.status, again.code.as_str()), (404, "no-such-allocation"));

    let health = api::health(&engine);
    assert!(health.ok);
    assert_eq!(health.queued, 0);
}

#[test]
fn test_api_rejects_bad_input() {
    let engine = engine(AllocationPolicy::default());

    let err = api::parse_allocation_request(r#"{"groups": ["T1"]}"#).unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (400, "invalid-request"));

    let err = api::get_allocation(&engine, "alice", "../../etc").unwrap_err();
    assert_eq!(err.code, "no-such-allocation");

    let body = api::parse_allocation_request(r#"{"groups": {"g": ["T1", "T1"]}}"#).unwrap();
    let err = api::put_allocation(&engine, "alice", body, 0).unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (400, "duplicate-target"));

    let body = api::parse_allocation_request(r#"{"groups": {"g": ["T1"]}}"#).unwrap();
    api::put_allocation(&engine, "alice", body.clone(), 0).unwrap();
    let err = api::put_allocation(&engine, "bob", body, 0).unwrap_err();
    assert_eq!((err.status, err.code.as_str()), (409, "busy"));
    assert_eq!(err.conflicts.len(), 1);
}
