//! End-to-end maintenance passes against an in-memory registry.
//!
//! Workers are simulated by a scripted transport: on `shutdown` a worker
//! either marks its own row `Exited`, ignores the command, or drops the
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

use fleet_core::FleetPolicy;
use fleet_ctl::transport::BoxFuture;
use fleet_ctl::{
    BasicCredentials, CommandClient, Endpoint, RetryPolicy, Scheme, Transport, TransportError,
};
use fleet_manager::{
    EVICTION_OWNER, EvictionOutcome, Evictor, FleetManager, Lifecycle, ProcessProbe,
    ShutdownPoll, WorkerFactory,
};
use fleet_registry::{
    RegistryResult, RegistryStore, ResourceStats, WorkerField, WorkerHealth, WorkerKind,
    WorkerRecord, WorkerRegistry, WorkerStatus,
};

// ── Fakes ──────────────────────────────────────────────────────────

/// Registry wrapper that counts mutating calls per port.
struct CountingRegistry {
    inner: RegistryStore,
    updates: Mutex<HashMap<u16, u32>>,
    releases: Mutex<HashMap<u16, u32>>,
}

impl CountingRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RegistryStore::open_in_memory().unwrap(),
            updates: Mutex::new(HashMap::new()),
            releases: Mutex::new(HashMap::new()),
        })
    }

    fn updates(&self, port: u16) -> u32 {
        self.updates.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    fn releases(&self, port: u16) -> u32 {
        self.releases.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    fn status(&self, port: u16) -> WorkerStatus {
        self.inner.get_worker(port).unwrap().unwrap().status
    }

    fn lock_owner(&self, port: u16) -> Option<String> {
        self.inner.get_worker(port).unwrap().unwrap().lock_owner
    }
}

impl WorkerRegistry for CountingRegistry {
    fn get_worker(&self, port: u16) -> RegistryResult<Option<WorkerRecord>> {
        self.inner.get_worker(port)
    }

    fn get_worker_by_type(&self, kind: WorkerKind) -> RegistryResult<Option<WorkerRecord>> {
        self.inner.get_worker_by_type(kind)
    }

    fn list_workers(&self) -> RegistryResult<Vec<WorkerRecord>> {
        self.inner.list_workers()
    }

    fn put_worker(&self, record: &WorkerRecord) -> RegistryResult<()> {
        *self.updates.lock().unwrap().entry(record.port).or_default() += 1;
        self.inner.put_worker(record)
    }

    fn update_field(&self, port: u16, field: WorkerField) -> RegistryResult<bool> {
        *self.updates.lock().unwrap().entry(port).or_default() += 1;
        self.inner.update_field(port, field)
    }

    fn acquire_lock(&self, port: u16, owner: &str) -> RegistryResult<bool> {
        self.inner.acquire_lock(port, owner)
    }

    fn release_lock(&self, port: u16, owner: &str) -> RegistryResult<bool> {
        *self.releases.lock().unwrap().entry(port).or_default() += 1;
        self.inner.release_lock(port, owner)
    }

    fn resource_stats(&self) -> RegistryResult<Option<ResourceStats>> {
        self.inner.resource_stats()
    }
}

#[derive(Clone, Copy)]
enum OnShutdown {
    Exit,
    Ignore,
    DropConnection,
}

/// Simulated worker control endpoints.
struct FakeWorkers {
    registry: Arc<CountingRegistry>,
    behavior: Mutex<HashMap<u16, OnShutdown>>,
    calls: Mutex<HashMap<u16, u32>>,
    order: Mutex<Vec<u16>>,
}

impl FakeWorkers {
    fn new(registry: Arc<CountingRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            behavior: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        })
    }

    fn on_shutdown(&self, port: u16, behavior: OnShutdown) {
        self.behavior.lock().unwrap().insert(port, behavior);
    }

    fn calls(&self, port: u16) -> u32 {
        self.calls.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn first_contact_order(&self) -> Vec<u16> {
        let mut seen = Vec::new();
        for port in self.order.lock().unwrap().iter() {
            if !seen.contains(port) {
                seen.push(*port);
            }
        }
        seen
    }
}

impl Transport for FakeWorkers {
    fn get<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        _credential: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        let port = endpoint.port;
        *self.calls.lock().unwrap().entry(port).or_default() += 1;
        self.order.lock().unwrap().push(port);
        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .get(&port)
            .copied()
            .unwrap_or(OnShutdown::Exit);

        let result = match behavior {
            OnShutdown::Exit => {
                self.registry
                    .inner
                    .update_field(port, WorkerField::Status(WorkerStatus::Exited))
                    .unwrap();
                Ok(Bytes::from_static(
                    br#"{"success": "True", "status": "Done", "cmd": "shutdown"}"#,
                ))
            }
            OnShutdown::Ignore => Ok(Bytes::from_static(
                br#"{"success": "True", "status": "Pending", "cmd": "shutdown"}"#,
            )),
            OnShutdown::DropConnection => Err(TransportError::Socket(
                "connection closed before message completed".into(),
            )),
        };
        Box::pin(async move { result })
    }

    fn scheme(&self) -> Scheme {
        Scheme::Http
    }
}

#[derive(Default)]
struct RecordingFactory {
    requests: Mutex<Vec<u32>>,
    reconciles: AtomicU32,
}

impl WorkerFactory for RecordingFactory {
    fn reconcile_against_registry(&self) -> anyhow::Result<()> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_tracked_workers(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn spawn_workers(&self, count: u32) -> anyhow::Result<u32> {
        self.requests.lock().unwrap().push(count);
        Ok(count)
    }
}

struct RunningPids(Vec<u32>);

impl ProcessProbe for RunningPids {
    fn is_alive(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }

    fn is_running(&self, pid: u32, _name: &str) -> bool {
        self.0.contains(&pid)
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    registry: Arc<CountingRegistry>,
    workers: Arc<FakeWorkers>,
    factory: Arc<RecordingFactory>,
    evictor: Evictor,
}

fn harness() -> Harness {
    let registry = CountingRegistry::new();
    let workers = FakeWorkers::new(registry.clone());
    let client = CommandClient::new(
        workers.clone(),
        Arc::new(BasicCredentials::new("admin", "secret")),
    )
    .with_retry(RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_millis(1),
    });
    let evictor = Evictor::new(registry.clone(), client).with_poll(ShutdownPoll {
        attempts: 3,
        interval: Duration::from_millis(1),
    });
    Harness {
        registry,
        workers,
        factory: Arc::new(RecordingFactory::default()),
        evictor,
    }
}

fn policy(idle_target_count: u32) -> FleetPolicy {
    FleetPolicy {
        idle_target_count,
        idle_thread_pool_count: 2,
        cpu_threshold_pct: 80.0,
        mem_threshold_pct: 80.0,
        threshold_check_disabled: true,
        idle_timeout_minutes: 60,
    }
}

fn manager(h: &Harness, policy: FleetPolicy) -> FleetManager {
    FleetManager::new(h.registry.clone(), h.factory.clone(), h.evictor.clone(), policy)
        .with_probe(Arc::new(RunningPids(vec![])))
        .with_port(7777)
        .with_tick(Duration::from_millis(5))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Idle worker last active `hours_ago` hours ago.
fn seed_idle(h: &Harness, port: u16, hours_ago: u64) {
    h.registry
        .inner
        .put_worker(&WorkerRecord::idle(port, u32::from(port), now() - hours_ago * 3600 - 1))
        .unwrap();
}

// ── Growth ─────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_fleet_spawns_to_target_without_evictions() {
    let h = harness();
    let report = manager(&h, policy(4)).maintain().await.unwrap();

    assert_eq!(report.available, 0);
    assert_eq!(report.requested, 4);
    assert_eq!(*h.factory.requests.lock().unwrap(), vec![4]);
    assert!(report.corrupted.is_empty());
    assert!(report.excess_idle.is_empty());
    assert_eq!(h.workers.total_calls(), 0);
    assert_eq!(h.factory.reconciles.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn partial_fleet_spawns_only_the_difference() {
    let h = harness();
    seed_idle(&h, 9000, 0);
    let mut bound = WorkerRecord::idle(9001, 9001, now());
    bound.id = Uuid::new_v4();
    bound.status = WorkerStatus::Busy("cluctrl.create".into());
    h.registry.inner.put_worker(&bound).unwrap();

    let report = manager(&h, policy(3)).maintain().await.unwrap();
    assert_eq!(report.available, 1);
    assert_eq!(*h.factory.requests.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn threshold_breach_defers_growth() {
    let h = harness();
    h.registry
        .inner
        .put_resource_stats(&ResourceStats {
            cpu_percent: Some(93.0),
            mem_percent: Some(40.0),
            updated_at: now(),
        })
        .unwrap();

    let mut p = policy(4);
    p.threshold_check_disabled = false;
    let report = manager(&h, p).maintain().await.unwrap();

    assert!(report.growth_deferred);
    assert_eq!(report.requested, 0);
    assert!(h.factory.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_stats_allow_growth() {
    let h = harness();
    let mut p = policy(2);
    p.threshold_check_disabled = false;
    let report = manager(&h, p).maintain().await.unwrap();
    assert!(!report.growth_deferred);
    assert_eq!(*h.factory.requests.lock().unwrap(), vec![2]);
}

// ── Eviction ───────────────────────────────────────────────────────

#[tokio::test]
async fn six_old_idle_workers_shrink_to_target() {
    let h = harness();
    for (port, age) in [(9000, 3), (9001, 6), (9002, 1), (9003, 5), (9004, 2), (9005, 4)] {
        seed_idle(&h, port, age);
    }

    let report = manager(&h, policy(2)).maintain().await.unwrap();

    assert!(h.factory.requests.lock().unwrap().is_empty());
    let evicted: Vec<u16> = report.excess_idle.iter().map(|(p, _)| *p).collect();
    assert_eq!(evicted, vec![9001, 9003, 9005, 9000]);
    assert!(
        report
            .excess_idle
            .iter()
            .all(|(_, o)| *o == EvictionOutcome::Terminated)
    );
    assert_eq!(h.registry.status(9002), WorkerStatus::Idle);
    assert_eq!(h.registry.status(9004), WorkerStatus::Idle);
    for port in [9001, 9003, 9005, 9000] {
        assert_eq!(h.registry.status(port), WorkerStatus::Exited);
        assert_eq!(h.registry.releases(port), 1);
        assert_eq!(h.registry.lock_owner(port), None);
    }
}

#[tokio::test]
async fn corrupted_workers_are_evicted_before_idle_ones() {
    let h = harness();
    for port in [9000, 9001, 9002] {
        seed_idle(&h, port, 4);
    }
    h.registry
        .inner
        .update_field(9002, WorkerField::Health(WorkerHealth::Corrupted))
        .unwrap();

    let report = manager(&h, policy(1)).maintain().await.unwrap();

    assert_eq!(report.corrupted, vec![(9002, EvictionOutcome::Terminated)]);
    // After the corrupted one is gone, two live workers remain over a target of one.
    assert_eq!(report.excess_idle, vec![(9000, EvictionOutcome::Terminated)]);
    assert_eq!(h.workers.first_contact_order(), vec![9002, 9000]);
}

#[tokio::test]
async fn busy_lock_skips_candidate_without_mutation() {
    let h = harness();
    seed_idle(&h, 9000, 5);
    assert!(h.registry.inner.acquire_lock(9000, "dispatcher").unwrap());

    let outcome = h.evictor.shutdown_worker(9000).await;

    assert_eq!(outcome, EvictionOutcome::LockBusy);
    assert_eq!(h.workers.calls(9000), 0);
    assert_eq!(h.registry.updates(9000), 0);
    assert_eq!(h.registry.releases(9000), 0);
    assert_eq!(h.registry.lock_owner(9000).as_deref(), Some("dispatcher"));
    assert_eq!(h.registry.status(9000), WorkerStatus::Idle);
}

#[tokio::test]
async fn bound_worker_is_never_terminated() {
    let h = harness();
    let mut worker = WorkerRecord::idle(9000, 9000, 0);
    worker.id = Uuid::new_v4();
    h.registry.inner.put_worker(&worker).unwrap();

    let outcome = h.evictor.shutdown_worker(9000).await;

    assert_eq!(outcome, EvictionOutcome::RequestBound);
    assert_eq!(h.workers.calls(9000), 0);
    assert_eq!(h.registry.status(9000), WorkerStatus::Idle);
    assert_eq!(h.registry.releases(9000), 1);
    assert_eq!(h.registry.lock_owner(9000), None);
}

#[tokio::test]
async fn socket_exhaustion_releases_lock_and_moves_on() {
    let h = harness();
    seed_idle(&h, 9000, 5);
    seed_idle(&h, 9001, 5);
    h.workers.on_shutdown(9000, OnShutdown::DropConnection);

    let outcomes = h.evictor.evict(&[9000, 9001]).await;

    assert_eq!(
        outcomes,
        vec![(9000, EvictionOutcome::Failed), (9001, EvictionOutcome::Terminated)]
    );
    assert_eq!(h.workers.calls(9000), 5);
    assert_eq!(h.registry.releases(9000), 1);
    assert_eq!(h.registry.lock_owner(9000), None);
    assert_eq!(h.registry.status(9000), WorkerStatus::Idle);
}

#[tokio::test]
async fn unconfirmed_shutdown_still_releases_lock() {
    let h = harness();
    seed_idle(&h, 9000, 5);
    h.workers.on_shutdown(9000, OnShutdown::Ignore);

    let outcome = h.evictor.shutdown_worker(9000).await;

    assert_eq!(outcome, EvictionOutcome::NotConfirmed);
    assert_eq!(h.workers.calls(9000), 1);
    assert_eq!(h.registry.releases(9000), 1);
    assert_eq!(h.registry.lock_owner(9000), None);
}

#[tokio::test]
async fn eviction_reenters_own_stale_lock() {
    let h = harness();
    seed_idle(&h, 9000, 5);
    assert!(h.registry.inner.acquire_lock(9000, EVICTION_OWNER).unwrap());

    assert_eq!(h.evictor.shutdown_worker(9000).await, EvictionOutcome::Terminated);
    assert_eq!(h.registry.lock_owner(9000), None);
}

#[tokio::test]
async fn missing_candidate_is_reported() {
    let h = harness();
    assert_eq!(h.evictor.shutdown_worker(9999).await, EvictionOutcome::Missing);
    assert_eq!(h.registry.releases(9999), 0);
}

// ── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn run_registers_itself_and_exits_on_shutdown() {
    let h = harness();
    let manager = Arc::new(manager(&h, policy(0)));
    let mut lifecycle = manager.lifecycle();
    let (tx, rx) = watch::channel(false);

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(rx).await }
    });

    lifecycle
        .wait_for(|state| *state == Lifecycle::Running)
        .await
        .unwrap();
    let own = h.registry.inner.get_worker(7777).unwrap().unwrap();
    assert_eq!(own.kind, WorkerKind::Workermanager);
    assert_eq!(own.status, WorkerStatus::Wmanaging);
    assert_eq!(own.pid, std::process::id());
    assert!(!own.is_unbound());

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
    assert_eq!(h.registry.status(7777), WorkerStatus::Exited);
}

#[tokio::test]
async fn shutdown_wakes_a_long_tick_immediately() {
    let h = harness();
    let manager = Arc::new(manager(&h, policy(0)).with_tick(Duration::from_secs(3600)));
    let mut lifecycle = manager.lifecycle();
    let (tx, rx) = watch::channel(false);

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run(rx).await }
    });
    lifecycle
        .wait_for(|state| *state == Lifecycle::Running)
        .await
        .unwrap();
    // Let the first pass finish so the loop is parked in its tick wait.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    let sent = std::time::Instant::now();
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop did not wake on shutdown")
        .unwrap()
        .unwrap();

    assert!(sent.elapsed() < Duration::from_secs(1));
    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
    assert_eq!(h.registry.status(7777), WorkerStatus::Exited);
}

#[tokio::test]
async fn start_closes_stale_row_from_previous_port() {
    let h = harness();
    let mut previous = WorkerRecord::idle(7000, 4242, now());
    previous.kind = WorkerKind::Workermanager;
    previous.status = WorkerStatus::Wmanaging;
    previous.id = Uuid::new_v4();
    h.registry.inner.put_worker(&previous).unwrap();

    manager(&h, policy(0)).start().unwrap();

    assert_eq!(h.registry.status(7000), WorkerStatus::Exited);
    assert_eq!(h.registry.status(7777), WorkerStatus::Wmanaging);
    let live = h
        .registry
        .inner
        .get_worker_by_type(WorkerKind::Workermanager)
        .unwrap()
        .unwrap();
    assert_eq!(live.port, 7777);
}

#[tokio::test]
async fn start_refuses_when_another_instance_is_live() {
    let h = harness();
    let mut other = WorkerRecord::idle(7778, 4242, now());
    other.kind = WorkerKind::Workermanager;
    other.status = WorkerStatus::Wmanaging;
    other.id = Uuid::new_v4();
    h.registry.inner.put_worker(&other).unwrap();

    let blocked = manager(&h, policy(0)).with_probe(Arc::new(RunningPids(vec![4242])));
    assert!(blocked.start().is_err());
    assert!(h.registry.inner.get_worker(7777).unwrap().is_none());

    // A dead pid does not block startup.
    let fresh = manager(&h, policy(0)).with_probe(Arc::new(RunningPids(vec![])));
    fresh.start().unwrap();
    assert_eq!(h.registry.status(7777), WorkerStatus::Wmanaging);
}
