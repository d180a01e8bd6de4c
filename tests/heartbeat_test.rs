mod common;

use common::FaultyStore;
use std::sync::Arc;
use std::time::Duration;
use taskmesh::clock::ManualClock;
use taskmesh::config::SchedulerConfig;
use taskmesh::engine::{Coordinator, DispatchOutcome, HeartbeatMonitor};
use taskmesh::model::{NewTask, TaskStatus, WorkerRegistration, WorkerStatus};
use taskmesh::store::{MemoryStore, Store};

fn setup(config: SchedulerConfig) -> (Arc<MemoryStore>, ManualClock, Coordinator) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new();
    let coordinator =
        Coordinator::new(store.clone(), Arc::new(clock.clone()), config).unwrap();
    (store, clock, coordinator)
}

async fn register(coord: &Coordinator, id: &str) {
    coord
        .register_worker(WorkerRegistration::new(id, id, "cpu"))
        .await
        .unwrap();
}

#[tokio::test]
async fn worker_at_the_threshold_is_still_alive() {
    let (_store, clock, coord) = setup(SchedulerConfig::default());
    register(&coord, "w1").await;

    clock.advance(Duration::from_secs(60));
    let report = coord.heartbeat_monitor().sweep().await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.demoted.is_empty());

    clock.advance(Duration::from_secs(1));
    let report = coord.heartbeat_monitor().sweep().await.unwrap();
    assert_eq!(report.demoted, vec!["w1"]);
}

#[tokio::test]
async fn threshold_follows_configured_interval_and_multiplier() {
    let config = SchedulerConfig {
        heartbeat_interval: Duration::from_secs(10),
        missed_heartbeats: 3,
        ..Default::default()
    };
    let (_store, clock, coord) = setup(config);
    register(&coord, "w1").await;

    clock.advance(Duration::from_secs(29));
    assert!(coord.heartbeat_monitor().sweep().await.unwrap().demoted.is_empty());

    clock.advance(Duration::from_secs(2));
    assert_eq!(
        coord.heartbeat_monitor().sweep().await.unwrap().demoted,
        vec!["w1"]
    );
}

#[tokio::test]
async fn already_inactive_workers_are_not_demoted_twice() {
    let (_store, clock, coord) = setup(SchedulerConfig::default());
    register(&coord, "w1").await;
    clock.advance(Duration::from_secs(120));

    assert_eq!(coord.heartbeat_monitor().sweep().await.unwrap().demoted.len(), 1);
    assert!(coord.heartbeat_monitor().sweep().await.unwrap().demoted.is_empty());
}

#[tokio::test]
async fn demoted_worker_is_skipped_by_the_scheduler() {
    let (_store, clock, coord) = setup(SchedulerConfig::default());
    register(&coord, "w1").await;
    clock.advance(Duration::from_secs(61));
    coord.heartbeat_monitor().sweep().await.unwrap();

    let id = coord.create_task(NewTask::new("render")).await.unwrap();
    assert_eq!(
        coord.scheduler().dispatch_once().await,
        DispatchOutcome::NoEligibleWorker { task_id: id }
    );

    coord.heartbeat("w1").await.unwrap();
    assert_eq!(
        coord.scheduler().dispatch_once().await,
        DispatchOutcome::Assigned {
            task_id: id,
            worker_id: "w1".to_string()
        }
    );
}

#[tokio::test]
async fn demotion_leaves_the_assigned_task_to_the_timeout_monitor() {
    let (_store, clock, coord) = setup(SchedulerConfig::default());
    register(&coord, "w1").await;
    let id = coord
        .create_task(NewTask::new("render").timeout(Duration::from_secs(300)))
        .await
        .unwrap();
    coord.scheduler().dispatch_once().await;

    clock.advance(Duration::from_secs(61));
    coord.heartbeat_monitor().sweep().await.unwrap();
    assert_eq!(
        coord.get_worker("w1").await.unwrap().status,
        WorkerStatus::Inactive
    );
    assert_eq!(coord.get_task(id).await.unwrap().status, TaskStatus::Assigned);

    clock.advance(Duration::from_secs(240));
    let report = coord.timeout_monitor().sweep().await.unwrap();
    assert_eq!(report.requeued, vec![id]);
    assert_eq!(coord.get_task(id).await.unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn heartbeat_that_lands_before_demotion_wins() {
    let (store, clock, coord) = setup(SchedulerConfig::default());
    register(&coord, "w1").await;
    clock.advance(Duration::from_secs(61));

    // The monitor's cutoff was computed before this heartbeat arrived.
    let stale_cutoff = coord.get_worker("w1").await.unwrap().last_heartbeat
        + chrono::Duration::seconds(1);
    coord.heartbeat("w1").await.unwrap();

    assert!(!store.demote_worker("w1", stale_cutoff).await.unwrap());
    assert_eq!(
        store.get_worker("w1").await.unwrap().status,
        WorkerStatus::Active
    );
}

#[tokio::test]
async fn standalone_monitor_reports_each_sweep() {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new();
    let monitor = HeartbeatMonitor::new(
        store.clone(),
        Arc::new(clock.clone()),
        Duration::from_secs(5),
        Duration::from_secs(10),
    );
    let now = taskmesh::clock::Clock::now(&clock);
    store
        .upsert_worker(WorkerRegistration::new("a", "a", "cpu"), now)
        .await
        .unwrap();
    store
        .upsert_worker(WorkerRegistration::new("b", "b", "cpu"), now)
        .await
        .unwrap();

    clock.advance(Duration::from_secs(11));
    let report = monitor.sweep().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.demoted, vec!["a", "b"]);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn failure_on_one_worker_does_not_stop_the_sweep() {
    let store = Arc::new(FaultyStore::default());
    let clock = ManualClock::new();
    let coord = Coordinator::new(
        store.clone(),
        Arc::new(clock.clone()),
        SchedulerConfig::default(),
    )
    .unwrap();
    for id in ["w1", "w2", "w3"] {
        register(&coord, id).await;
    }
    store.break_worker("w2");

    clock.advance(Duration::from_secs(61));
    let report = coord.heartbeat_monitor().sweep().await.unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.errors, 1);
    assert_eq!(report.demoted, vec!["w1", "w3"]);
    assert_eq!(
        coord.get_worker("w2").await.unwrap().status,
        WorkerStatus::Active
    );
}
