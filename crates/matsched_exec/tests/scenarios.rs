//! End-to-end scheduling scenarios over the full substrate: queue,
//! scheduler, GPU manager, worker pool, executors, and the task service,
//! with a mock probe and a mock calculator.

use matsched_core::{
    CallbackEvent, CancelToken, ModelCatalog, ModelFamily, ModelRecord, Settings, StructureRef,
    TaskId, TaskPriority, TaskState, TaskType,
};
use matsched_exec::{
    ExecutorRegistry, LogLevel, MockCalculator, MockModelLoader, SubmitRequest,
    SyntheticStructureSource, TaskEvent, TaskLogService, TaskService, WorkerPool,
};
use matsched_sched::{
    GpuManager, GpuStatus, InMemoryTaskRepository, MemoryEstimator, MockProbe, PriorityQueue,
    Scheduler, TaskRepository, WorkerManager,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

struct Rig {
    service: TaskService,
    repo: Arc<InMemoryTaskRepository>,
    gpus: Arc<GpuManager>,
    queue: Arc<PriorityQueue>,
    events: mpsc::Receiver<TaskEvent>,
    shutdown: CancelToken,
}

async fn rig(gpu_count: u32, loader: MockModelLoader) -> Rig {
    let settings = Settings::default();
    let probe = Arc::new(MockProbe::new(gpu_count));
    let gpus = Arc::new(GpuManager::new(
        probe,
        None,
        &[],
        settings.max_models_per_gpu,
        settings.memory_safety_margin_mb,
    ));
    let repo = Arc::new(InMemoryTaskRepository::new());
    let queue = Arc::new(PriorityQueue::new());

    let mut catalog = ModelCatalog::builtin();
    catalog.insert(ModelRecord::new("slow-model", ModelFamily::Custom, 4000));
    let catalog = Arc::new(RwLock::new(catalog));
    let estimator = MemoryEstimator::new(Arc::clone(&catalog));

    let (workers, _lost_rx) = WorkerManager::new(
        settings.heartbeat_interval,
        settings.heartbeat_timeout,
    );
    let workers = Arc::new(workers);

    let (event_tx, event_rx) = mpsc::channel(256);
    let logs = Arc::new(TaskLogService::default());
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&gpus),
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        Arc::new(loader),
        Arc::new(SyntheticStructureSource),
        Arc::new(ExecutorRegistry::standard()),
        Arc::clone(&workers),
        estimator.clone(),
        event_tx.clone(),
        Arc::clone(&logs),
        settings.heartbeat_interval,
    ));

    let shutdown = CancelToken::new();
    let dispatch = pool.spawn(shutdown.clone()).await;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&queue),
        Arc::clone(&gpus),
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        estimator,
        dispatch,
        Duration::from_millis(10),
    ));
    tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let service = TaskService::new(
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        Arc::clone(&queue),
        catalog,
        pool.cancel_registry(),
        event_tx,
        logs,
    );

    Rig {
        service,
        repo,
        gpus,
        queue,
        events: event_rx,
        shutdown,
    }
}

fn structure(n_atoms: usize) -> StructureRef {
    StructureRef {
        id: format!("s-{n_atoms}"),
        n_atoms,
        formula: format!("C{n_atoms}"),
        lattice: [[12.0, 0.0, 0.0], [0.0, 12.0, 0.0], [0.0, 0.0, 12.0]],
    }
}

fn single_point(model: &str) -> SubmitRequest {
    SubmitRequest::new(TaskType::SinglePoint, model, structure(4))
}

/// Collects events until `predicate` has matched `count` times or the
/// timeout expires.
async fn collect_events(
    events: &mut mpsc::Receiver<TaskEvent>,
    count: usize,
    predicate: impl Fn(&TaskEvent) -> bool,
    timeout: Duration,
) -> Vec<TaskEvent> {
    let mut matched = Vec::new();
    let deadline = Instant::now() + timeout;
    while matched.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => {
                if predicate(&event) {
                    matched.push(event);
                }
            }
            _ => break,
        }
    }
    matched
}

/// S1: three same-priority tasks on one device complete in submission order.
#[tokio::test]
async fn test_fifo_within_priority_end_to_end() {
    let mut r = rig(1, MockModelLoader::new()).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let receipt = r.service.submit(single_point("orb-v2")).await.unwrap();
        ids.push(receipt.task_id);
    }

    let completed = collect_events(
        &mut r.events,
        3,
        |e| e.event == CallbackEvent::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(completed.len(), 3);
    let order: Vec<TaskId> = completed.iter().map(|e| e.task_id).collect();
    assert_eq!(order, ids);

    for id in ids {
        let task = r.repo.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.gpu_id.is_none());
        assert!(task.result.is_some());

        // Execution left a structured log trail.
        let logs = r.service.get_task_logs(id, Some(LogLevel::Info), 0).await.unwrap();
        assert!(logs.iter().any(|e| e.message.contains("execution started")));
        assert!(logs.iter().any(|e| e.message.contains("execution completed")));
    }
    r.shutdown.cancel();
}

/// S2: a CRITICAL submission jumps the queue but never preempts the
/// running task.
#[tokio::test]
async fn test_priority_jumps_queue_not_running_task() {
    let loader = MockModelLoader::new().with_factory(|model, _gpu| {
        if model == "slow-model" {
            Arc::new(MockCalculator::new().with_delay(Duration::from_millis(400)))
        } else {
            Arc::new(MockCalculator::new())
        }
    });
    let mut r = rig(1, loader).await;

    let a = r.service.submit(single_point("slow-model")).await.unwrap();
    // Wait until A is actually running.
    let started = collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Started,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(started[0].task_id, a.task_id);

    let b = r.service.submit(single_point("orb-v2")).await.unwrap();
    let mut critical = single_point("orb-v2");
    critical.priority = TaskPriority::Critical;
    let c = r.service.submit(critical).await.unwrap();

    let started_rest = collect_events(
        &mut r.events,
        2,
        |e| e.event == CallbackEvent::Started,
        Duration::from_secs(10),
    )
    .await;
    let order: Vec<TaskId> = started_rest.iter().map(|e| e.task_id).collect();
    assert_eq!(order, vec![c.task_id, b.task_id]);
    r.shutdown.cancel();
}

/// S5: cancelling a queued task removes it and shrinks the queue.
#[tokio::test]
async fn test_cancel_while_queued() {
    let loader = MockModelLoader::new().with_factory(|_, _| {
        Arc::new(MockCalculator::new().with_delay(Duration::from_millis(300)))
    });
    let mut r = rig(1, loader).await;

    let a = r.service.submit(single_point("slow-model")).await.unwrap();
    collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Started,
        Duration::from_secs(5),
    )
    .await;
    let _ = a;

    // B waits behind A.
    let b = r.service.submit(single_point("orb-v2")).await.unwrap();
    let before = r.queue.len().await;
    assert_eq!(before, 1);
    let task = r.repo.get(b.task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Queued);

    let state = r.service.cancel_task(b.task_id).await.unwrap();
    assert_eq!(state, TaskState::Cancelled);
    assert_eq!(r.queue.len().await, 0);
    r.shutdown.cancel();
}

/// S6: a 2 s timeout on a slow executor lands in TIMEOUT within 3 s and
/// frees the device.
#[tokio::test]
async fn test_timeout_trips_within_budget() {
    let loader = MockModelLoader::new().with_factory(|_, _| {
        // Each evaluation takes ~200 ms; the optimizer checkpoints between
        // steps, so cancellation latency is one step.
        Arc::new(MockCalculator::new().with_delay(Duration::from_millis(200)))
    });
    let mut r = rig(1, loader).await;

    let mut request = SubmitRequest::new(TaskType::Optimization, "slow-model", structure(4));
    request.timeout_seconds = Some(2);
    // Unreachable tolerance keeps the optimizer stepping until the deadline.
    request
        .parameters
        .insert("fmax".into(), serde_json::json!(1e-12));
    request
        .parameters
        .insert("filter".into(), serde_json::json!("none"));

    let started_at = Instant::now();
    let receipt = r.service.submit(request).await.unwrap();

    let timeout_events = collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Timeout,
        Duration::from_secs(8),
    )
    .await;
    assert_eq!(timeout_events.len(), 1);
    assert_eq!(timeout_events[0].task_id, receipt.task_id);
    // Submission to terminal: 2 s deadline plus one executor step of slack.
    assert!(started_at.elapsed() < Duration::from_secs(3));

    let task = r.repo.get(receipt.task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Timeout);
    assert!(task.gpu_id.is_none());

    // The device returns to FREE within one worker tick.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = r.gpus.state(0).await.unwrap();
    assert_eq!(state.status, GpuStatus::Free);
    assert!(state.current_task_id.is_none());
    r.shutdown.cancel();
}

/// Cancelling a running task reaches CANCELLED and frees the device.
#[tokio::test]
async fn test_cancel_running_task_cleans_up() {
    let loader = MockModelLoader::new().with_factory(|_, _| {
        Arc::new(MockCalculator::new().with_delay(Duration::from_millis(150)))
    });
    let mut r = rig(1, loader).await;

    let mut request = SubmitRequest::new(TaskType::Optimization, "slow-model", structure(4));
    request
        .parameters
        .insert("fmax".into(), serde_json::json!(1e-12));
    request
        .parameters
        .insert("filter".into(), serde_json::json!("none"));
    let receipt = r.service.submit(request).await.unwrap();

    collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Started,
        Duration::from_secs(5),
    )
    .await;

    r.service.cancel_task(receipt.task_id).await.unwrap();
    let cancelled = collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Cancelled,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(cancelled.len(), 1);

    let task = r.repo.get(receipt.task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.gpu_id.is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(r.gpus.state(0).await.unwrap().status, GpuStatus::Free);
    r.shutdown.cancel();
}

/// A failing calculator fails the task and releases the device; the
/// scheduler keeps going.
#[tokio::test]
async fn test_executor_failure_releases_gpu() {
    let loader = MockModelLoader::new().with_factory(|model, _| {
        if model == "slow-model" {
            Arc::new(MockCalculator::failing("CUDA kernel fault"))
        } else {
            Arc::new(MockCalculator::new())
        }
    });
    let mut r = rig(1, loader).await;

    let bad = r.service.submit(single_point("slow-model")).await.unwrap();
    let failed = collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Failed,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(failed[0].task_id, bad.task_id);
    assert!(failed[0].data["error_message"]
        .as_str()
        .unwrap()
        .contains("CUDA kernel fault"));

    let task = r.repo.get(bad.task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.error.is_some());

    // A healthy follow-up task still schedules and completes.
    let good = r.service.submit(single_point("orb-v2")).await.unwrap();
    let completed = collect_events(
        &mut r.events,
        1,
        |e| e.event == CallbackEvent::Completed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(completed[0].task_id, good.task_id);
    r.shutdown.cancel();
}
