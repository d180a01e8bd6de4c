use std::sync::Arc;
use std::time::Duration;
use taskmesh::clock::{ManualClock, SystemClock};
use taskmesh::config::SchedulerConfig;
use taskmesh::engine::{Coordinator, DispatchOutcome, SystemStatus};
use taskmesh::error::Error;
use taskmesh::model::{NewTask, Priority, TaskId, TaskStatus, WorkerRegistration};
use taskmesh::store::{MemoryStore, Store};

fn setup() -> (Arc<MemoryStore>, ManualClock, Coordinator) {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new();
    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(clock.clone()),
        SchedulerConfig::default(),
    )
    .unwrap();
    (store, clock, coordinator)
}

async fn register(coord: &Coordinator, id: &str) {
    coord
        .register_worker(WorkerRegistration::new(id, id, "cpu"))
        .await
        .unwrap();
}

async fn wait_for_status(coord: &Coordinator, id: TaskId, want: TaskStatus) -> TaskStatus {
    let mut status = coord.get_task(id).await.unwrap().status;
    for _ in 0..200 {
        if status == want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = coord.get_task(id).await.unwrap().status;
    }
    status
}

#[tokio::test]
async fn create_task_applies_configured_defaults() {
    let (_store, _clock, coord) = setup();
    let id = coord
        .create_task(NewTask::new("resize").payload(serde_json::json!({"w": 640})))
        .await
        .unwrap();

    let task = coord.get_task(id).await.unwrap();
    assert_eq!(task.task_type, "resize");
    assert_eq!(task.payload, serde_json::json!({"w": 640}));
    assert_eq!(task.priority, Priority::Medium);
    assert_eq!(task.timeout, Duration::from_secs(600));
    assert_eq!(task.max_retries, 3);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());
    assert!(coord.queue().contains(id));
}

#[tokio::test]
async fn create_task_rejects_bad_input() {
    let (_store, _clock, coord) = setup();
    assert!(matches!(
        coord.create_task(NewTask::new("")).await.unwrap_err(),
        Error::InvalidOperation(_)
    ));
    assert!(matches!(
        coord
            .create_task(NewTask::new("x").timeout(Duration::ZERO))
            .await
            .unwrap_err(),
        Error::InvalidOperation(_)
    ));
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (_store, _clock, coord) = setup();
    let ghost = TaskId::new();
    assert!(matches!(coord.get_task(ghost).await, Err(Error::NotFound(_))));
    assert!(matches!(
        coord.complete_task(ghost, serde_json::Value::Null).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(coord.cancel_task(ghost).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn list_pending_tasks_is_in_dispatch_order() {
    let (_store, clock, coord) = setup();
    let mut ids = Vec::new();
    for priority in [Priority::Low, Priority::Critical, Priority::Medium, Priority::Critical] {
        clock.advance(Duration::from_millis(5));
        ids.push(
            coord
                .create_task(NewTask::new("job").priority(priority))
                .await
                .unwrap(),
        );
    }

    let pending: Vec<TaskId> = coord
        .list_pending_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(pending, vec![ids[1], ids[3], ids[2], ids[0]]);
}

#[tokio::test]
async fn worker_lifecycle_start_then_complete() {
    let (_store, _clock, coord) = setup();
    register(&coord, "w1").await;
    register(&coord, "w2").await;
    let id = coord.create_task(NewTask::new("job")).await.unwrap();
    coord.scheduler().dispatch_once().await;

    let err = coord.start_task(id, "w2").await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));

    let started = coord.start_task(id, "w1").await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    assert!(started.started_at.is_some());

    let done = coord
        .complete_task(id, serde_json::json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(serde_json::json!({"ok": true})));
    assert!(done.completed_at.is_some());
    assert_eq!(coord.get_worker("w1").await.unwrap().current_task, None);
}

#[tokio::test]
async fn completing_a_pending_task_is_invalid() {
    let (_store, _clock, coord) = setup();
    let id = coord.create_task(NewTask::new("job")).await.unwrap();
    let err = coord
        .complete_task(id, serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn worker_reported_failure_is_terminal() {
    let (_store, _clock, coord) = setup();
    register(&coord, "w1").await;
    let id = coord.create_task(NewTask::new("job")).await.unwrap();
    coord.scheduler().dispatch_once().await;

    let failed = coord.fail_task(id, "disk full").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("disk full"));
    assert_eq!(failed.retry_count, 0);
    assert!(!coord.queue().contains(id));
    assert_eq!(coord.get_worker("w1").await.unwrap().current_task, None);

    assert!(matches!(
        coord.complete_task(id, serde_json::Value::Null).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn cancel_pending_removes_it_from_the_queue() {
    let (_store, _clock, coord) = setup();
    register(&coord, "w1").await;
    let id = coord.create_task(NewTask::new("job")).await.unwrap();

    let cancelled = coord.cancel_task(id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(!coord.queue().contains(id));
    assert_eq!(coord.scheduler().dispatch_once().await, DispatchOutcome::Idle);
}

#[tokio::test]
async fn cancel_in_flight_frees_the_worker_and_rejects_late_results() {
    let (_store, _clock, coord) = setup();
    register(&coord, "w1").await;
    let id = coord.create_task(NewTask::new("job")).await.unwrap();
    coord.scheduler().dispatch_once().await;
    coord.start_task(id, "w1").await.unwrap();

    coord.cancel_task(id).await.unwrap();
    assert_eq!(coord.get_worker("w1").await.unwrap().current_task, None);
    assert!(matches!(
        coord.complete_task(id, serde_json::Value::Null).await,
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        coord.cancel_task(id).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn list_tasks_filters_by_status() {
    let (_store, _clock, coord) = setup();
    register(&coord, "w1").await;
    let a = coord.create_task(NewTask::new("job")).await.unwrap();
    let b = coord.create_task(NewTask::new("job")).await.unwrap();
    coord.cancel_task(b).await.unwrap();

    assert_eq!(coord.list_tasks(None).await.unwrap().len(), 2);
    let pending = coord.list_tasks(Some(TaskStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, a);
    assert!(
        coord
            .list_tasks(Some(TaskStatus::Completed))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn system_status_counts_queue_tasks_and_workers() {
    let (_store, clock, coord) = setup();
    register(&coord, "w1").await;
    register(&coord, "w2").await;
    for _ in 0..3 {
        coord.create_task(NewTask::new("job")).await.unwrap();
    }
    coord.scheduler().dispatch_once().await;

    clock.advance(Duration::from_secs(61));
    coord.heartbeat("w1").await.unwrap();
    coord.heartbeat_monitor().sweep().await.unwrap();

    assert_eq!(
        coord.system_status().await.unwrap(),
        SystemStatus {
            pending_count: 2,
            active_task_count: 1,
            queue_size: 2,
            active_worker_count: 1,
        }
    );
}

#[tokio::test]
async fn recover_rebuilds_the_queue_from_the_store() {
    let (store, clock, coord) = setup();
    register(&coord, "w1").await;
    let first = coord.create_task(NewTask::new("job")).await.unwrap();
    let second = coord.create_task(NewTask::new("job")).await.unwrap();
    coord.scheduler().dispatch_once().await;
    drop(coord);

    // A fresh process over the same store.
    let restarted = Coordinator::new(
        store.clone(),
        Arc::new(clock.clone()),
        SchedulerConfig::default(),
    )
    .unwrap();
    assert!(restarted.queue().is_empty());
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert!(restarted.queue().contains(second));
    assert!(!restarted.queue().contains(first));
    assert_eq!(
        store.get_task(first).await.unwrap().status,
        TaskStatus::Assigned
    );
}

#[tokio::test]
async fn critical_task_waits_for_a_worker_then_dispatches_promptly() {
    let config = SchedulerConfig {
        // Long back-off: only the registration wake-up can dispatch in time.
        no_worker_backoff: Duration::from_secs(30),
        idle_poll: Duration::from_millis(20),
        ..Default::default()
    };
    let coord = Arc::new(
        Coordinator::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), config).unwrap(),
    );
    let runner = tokio::spawn({
        let coord = Arc::clone(&coord);
        async move { coord.run().await }
    });

    let id = coord
        .create_task(
            NewTask::new("page")
                .priority(Priority::Critical)
                .timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coord.get_task(id).await.unwrap().status, TaskStatus::Pending);

    register(&coord, "w1").await;
    assert_eq!(
        wait_for_status(&coord, id, TaskStatus::Assigned).await,
        TaskStatus::Assigned
    );
    assert_eq!(
        coord.get_task(id).await.unwrap().assigned_worker.as_deref(),
        Some("w1")
    );

    coord.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn running_coordinator_processes_tasks_end_to_end() {
    let config = SchedulerConfig {
        heartbeat_interval: Duration::from_millis(50),
        timeout_check_interval: Duration::from_millis(20),
        idle_poll: Duration::from_millis(20),
        no_worker_backoff: Duration::from_millis(20),
        ..Default::default()
    };
    let coord = Arc::new(
        Coordinator::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), config).unwrap(),
    );
    let runner = tokio::spawn({
        let coord = Arc::clone(&coord);
        async move { coord.run().await }
    });
    register(&coord, "w1").await;

    // Completed normally.
    let done = coord.create_task(NewTask::new("job")).await.unwrap();
    assert_eq!(
        wait_for_status(&coord, done, TaskStatus::Assigned).await,
        TaskStatus::Assigned
    );
    coord.start_task(done, "w1").await.unwrap();
    coord
        .complete_task(done, serde_json::json!("ok"))
        .await
        .unwrap();

    // Never acknowledged: times out once per attempt, then fails for good.
    let lost = coord
        .create_task(
            NewTask::new("job")
                .timeout(Duration::from_millis(30))
                .max_retries(2),
        )
        .await
        .unwrap();
    // Keep the worker alive while the retries run.
    let mut final_status = TaskStatus::Pending;
    for _ in 0..100 {
        coord.heartbeat("w1").await.unwrap();
        final_status = coord.get_task(lost).await.unwrap().status;
        if final_status == TaskStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(final_status, TaskStatus::Failed);
    assert_eq!(coord.get_task(lost).await.unwrap().retry_count, 2);

    coord.shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(
        coord.get_task(done).await.unwrap().status,
        TaskStatus::Completed
    );
}
