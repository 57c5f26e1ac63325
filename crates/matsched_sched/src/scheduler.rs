//! The scheduling loop: matches the queue head to the best free GPU.
//!
//! When no device fits the head task the whole queue waits; a device
//! freeing or a telemetry refresh re-evaluates the head within one tick.

use crate::gpu::{GpuManager, GpuState};
use crate::memory::MemoryEstimator;
use crate::queue::PriorityQueue;
use crate::repo::TaskRepository;
use matsched_core::{CancelToken, GpuId, SchedError, TaskError, TaskId, TaskState};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A `(task, gpu)` pair handed to a worker.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub task_id: TaskId,
    pub gpu_id: GpuId,
}

/// Result of one scheduling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A task was allocated and handed off.
    Scheduled { task_id: TaskId, gpu_id: GpuId },
    /// Every device is busy, errored, or reserved.
    NoFreeGpu,
    /// Nothing is waiting.
    QueueEmpty,
    /// The queue head had no repository row; it was dropped from the queue.
    TaskVanished { task_id: TaskId },
    /// No free device passes the memory gate; the head stays queued.
    NoSuitableGpu { task_id: TaskId },
    /// Allocation or dequeue lost a race (concurrent cancel or allocation).
    Raced { task_id: TaskId },
}

/// Monotonic scheduling counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub schedule_attempts: AtomicU64,
    pub schedule_successes: AtomicU64,
    pub schedule_failures: AtomicU64,
    pub no_free_gpu: AtomicU64,
    pub no_pending_task: AtomicU64,
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub schedule_attempts: u64,
    pub schedule_successes: u64,
    pub schedule_failures: u64,
    pub no_free_gpu: u64,
    pub no_pending_task: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            schedule_attempts: self.schedule_attempts.load(Ordering::Relaxed),
            schedule_successes: self.schedule_successes.load(Ordering::Relaxed),
            schedule_failures: self.schedule_failures.load(Ordering::Relaxed),
            no_free_gpu: self.no_free_gpu.load(Ordering::Relaxed),
            no_pending_task: self.no_pending_task.load(Ordering::Relaxed),
        }
    }
}

/// Queue status snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusEntry {
    pub task_id: TaskId,
    pub priority: String,
    pub position: usize,
    pub wait_time_seconds: f64,
}

/// Matches queued tasks to free devices at a steady tick.
pub struct Scheduler {
    queue: Arc<PriorityQueue>,
    gpus: Arc<GpuManager>,
    repo: Arc<dyn TaskRepository>,
    estimator: MemoryEstimator,
    dispatch: FxHashMap<GpuId, mpsc::Sender<Assignment>>,
    poll_interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    /// Wires the scheduler to its collaborators. `dispatch` carries one
    /// depth-1 sender per non-reserved device.
    pub fn new(
        queue: Arc<PriorityQueue>,
        gpus: Arc<GpuManager>,
        repo: Arc<dyn TaskRepository>,
        estimator: MemoryEstimator,
        dispatch: FxHashMap<GpuId, mpsc::Sender<Assignment>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            gpus,
            repo,
            estimator,
            dispatch,
            poll_interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Shared counter handle.
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// One scheduling attempt, following the fixed decision order:
    /// refresh, free set, queue head, metadata, device selection, allocation,
    /// handoff.
    pub async fn schedule_next(&self) -> ScheduleOutcome {
        SchedulerStats::bump(&self.stats.schedule_attempts);

        self.gpus.refresh_states().await;

        let free = self.gpus.free_gpus().await;
        if free.is_empty() {
            SchedulerStats::bump(&self.stats.no_free_gpu);
            return ScheduleOutcome::NoFreeGpu;
        }

        let Some(task_id) = self.queue.peek_first().await else {
            SchedulerStats::bump(&self.stats.no_pending_task);
            return ScheduleOutcome::QueueEmpty;
        };

        let task = match self.repo.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "task_fetch_failed");
                self.queue.remove(task_id).await;
                return ScheduleOutcome::TaskVanished { task_id };
            }
        };

        let required_mb = self.estimator.estimate(&task).await;
        let Some(gpu_id) = self.select_best_gpu(&task.model_name, required_mb, &free).await
        else {
            SchedulerStats::bump(&self.stats.schedule_failures);
            warn!(
                task_id = %task_id,
                model = %task.model_name,
                required_memory_mb = required_mb,
                "no_suitable_gpu"
            );
            return ScheduleOutcome::NoSuitableGpu { task_id };
        };

        if !self.gpus.allocate(gpu_id, task_id).await {
            SchedulerStats::bump(&self.stats.schedule_failures);
            return ScheduleOutcome::Raced { task_id };
        }

        // A concurrent cancel may have removed the head between peek and
        // here; in that case give the device back.
        if !self.queue.remove(task_id).await {
            self.gpus.release(gpu_id).await;
            SchedulerStats::bump(&self.stats.schedule_failures);
            return ScheduleOutcome::Raced { task_id };
        }

        if let Err(err) = self.repo.assign(task_id, gpu_id).await {
            warn!(task_id = %task_id, gpu_id, error = %err, "assign_failed");
            self.gpus.release(gpu_id).await;
            SchedulerStats::bump(&self.stats.schedule_failures);
            return ScheduleOutcome::Raced { task_id };
        }

        if let Err(err) = self.hand_off(Assignment { task_id, gpu_id }).await {
            error!(task_id = %task_id, gpu_id, error = %err, "worker_handoff_failed");
            self.gpus.release(gpu_id).await;
            let _ = self.repo.transition(task_id, TaskState::Failed).await;
            let _ = self
                .repo
                .set_error(task_id, TaskError::new("worker unavailable"))
                .await;
            SchedulerStats::bump(&self.stats.schedule_failures);
            return ScheduleOutcome::Raced { task_id };
        }

        SchedulerStats::bump(&self.stats.schedule_successes);
        info!(task_id = %task_id, gpu_id, model = %task.model_name, "task_scheduled");
        ScheduleOutcome::Scheduled { task_id, gpu_id }
    }

    async fn hand_off(&self, assignment: Assignment) -> Result<(), SchedError> {
        let sender = self.dispatch.get(&assignment.gpu_id).ok_or_else(|| {
            SchedError::ResourceUnavailable(format!("no worker for gpu {}", assignment.gpu_id))
        })?;
        sender.send(assignment).await.map_err(|_| {
            SchedError::ResourceUnavailable(format!(
                "worker channel closed for gpu {}",
                assignment.gpu_id
            ))
        })
    }

    /// Picks the highest-scoring free device that passes the memory gate.
    /// Ties break toward the lowest index.
    async fn select_best_gpu(
        &self,
        model_name: &str,
        required_mb: u64,
        free: &[GpuId],
    ) -> Option<GpuId> {
        let mut best: Option<(GpuId, f64)> = None;
        for gpu in free {
            if !self.gpus.check_memory_available(*gpu, required_mb).await {
                continue;
            }
            let Some(state) = self.gpus.state(*gpu).await else {
                continue;
            };
            let score = score_gpu(&state, model_name, self.gpus.max_models_per_gpu());
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((*gpu, score)),
            }
        }
        best.map(|(gpu, _)| gpu)
    }

    /// Runs the loop until the token trips. A successful attempt retries
    /// immediately; anything else waits one poll interval.
    pub async fn run(&self, shutdown: CancelToken) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "scheduler_started");
        while !shutdown.is_cancelled() {
            if matches!(self.schedule_next().await, ScheduleOutcome::Scheduled { .. }) {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => {}
            }
        }
        info!("scheduler_stopped");
    }

    /// Queue snapshot with wait times, head first.
    pub async fn queue_status(&self, count: usize) -> Vec<QueueStatusEntry> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.queue
            .peek(count)
            .await
            .into_iter()
            .map(|entry| QueueStatusEntry {
                task_id: entry.task_id,
                priority: entry.priority.to_string(),
                position: entry.position,
                wait_time_seconds: (now - entry.enqueued_at).max(0.0),
            })
            .collect()
    }
}

/// Device desirability for a task. Higher wins.
///
/// +100 resident model, +50 free cache slot, up to +40 free-memory ratio,
/// up to +20 coolness, up to +10 idleness (full credit when never used).
pub fn score_gpu(state: &GpuState, model_name: &str, max_models_per_gpu: usize) -> f64 {
    let mut score = 0.0;

    if state.loaded_models.iter().any(|m| m == model_name) {
        score += 100.0;
    } else if state.loaded_models.len() < max_models_per_gpu {
        score += 50.0;
    }

    if state.memory_total_mb > 0 {
        score += state.memory_free_mb as f64 / state.memory_total_mb as f64 * 40.0;
    }

    if state.temperature_c > 0 {
        score += ((100.0 - state.temperature_c as f64) / 100.0).max(0.0) * 20.0;
    }

    match state.last_task_completed_at {
        Some(completed_at) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            let idle = (now - completed_at).max(0.0);
            score += (idle / 60.0).min(1.0) * 10.0;
        }
        None => score += 10.0,
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuStatus, MockProbe};
    use crate::repo::InMemoryTaskRepository;
    use matsched_core::{ModelCatalog, StructureRef, Task, TaskPriority, TaskType};
    use tokio::sync::RwLock;

    fn structure(n_atoms: usize) -> StructureRef {
        StructureRef {
            id: "s-1".into(),
            n_atoms,
            formula: "C8".into(),
            lattice: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
        }
    }

    struct Rig {
        queue: Arc<PriorityQueue>,
        gpus: Arc<GpuManager>,
        repo: Arc<InMemoryTaskRepository>,
        scheduler: Scheduler,
        rx: FxHashMap<GpuId, mpsc::Receiver<Assignment>>,
    }

    fn rig_with_probe(probe: Arc<MockProbe>, gpu_count: u32) -> Rig {
        let queue = Arc::new(PriorityQueue::new());
        let gpus = Arc::new(GpuManager::new(probe, None, &[], 2, 2048));
        let repo = Arc::new(InMemoryTaskRepository::new());
        let catalog = Arc::new(RwLock::new(ModelCatalog::builtin()));
        let estimator = MemoryEstimator::new(catalog);

        let mut dispatch = FxHashMap::default();
        let mut rx = FxHashMap::default();
        for gpu in 0..gpu_count {
            let (tx, receiver) = mpsc::channel(1);
            dispatch.insert(gpu, tx);
            rx.insert(gpu, receiver);
        }

        let scheduler = Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&gpus),
            Arc::clone(&repo) as Arc<dyn TaskRepository>,
            estimator,
            dispatch,
            Duration::from_millis(10),
        );
        Rig {
            queue,
            gpus,
            repo,
            scheduler,
            rx,
        }
    }

    fn rig(gpu_count: u32) -> Rig {
        rig_with_probe(Arc::new(MockProbe::new(gpu_count)), gpu_count)
    }

    async fn submit(rig: &Rig, task: Task) -> TaskId {
        let id = task.id;
        let priority = task.priority;
        rig.repo.create(task).await.unwrap();
        rig.repo.transition(id, TaskState::Queued).await.unwrap();
        rig.queue.enqueue(id, priority).await;
        id
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let r = rig(1);
        assert_eq!(r.scheduler.schedule_next().await, ScheduleOutcome::QueueEmpty);
    }

    #[tokio::test]
    async fn test_schedules_head_to_free_gpu() {
        let mut r = rig(1);
        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure(100));
        let id = submit(&r, task).await;

        let outcome = r.scheduler.schedule_next().await;
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                task_id: id,
                gpu_id: 0
            }
        );

        // Device busy, queue drained, task assigned, worker notified.
        assert_eq!(r.gpus.state(0).await.unwrap().status, GpuStatus::Busy);
        assert_eq!(r.queue.len().await, 0);
        let row = r.repo.get(id).await.unwrap();
        assert_eq!(row.state, TaskState::Assigned);
        assert_eq!(row.gpu_id, Some(0));
        let assignment = r.rx.get_mut(&0).unwrap().try_recv().unwrap();
        assert_eq!(assignment.task_id, id);
    }

    #[tokio::test]
    async fn test_no_free_gpu_blocks() {
        let r = rig(1);
        r.gpus.allocate(0, TaskId::new()).await;
        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure(100));
        submit(&r, task).await;
        assert_eq!(r.scheduler.schedule_next().await, ScheduleOutcome::NoFreeGpu);
        assert_eq!(r.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_vanished_task_is_dropped() {
        let r = rig(1);
        let ghost = TaskId::new();
        r.queue.enqueue(ghost, TaskPriority::Normal).await;
        assert_eq!(
            r.scheduler.schedule_next().await,
            ScheduleOutcome::TaskVanished { task_id: ghost }
        );
        assert_eq!(r.queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_memory_gate_blocks_then_refresh_unblocks() {
        let probe = Arc::new(MockProbe::new(2));
        probe.set_memory_free(0, 18_000);
        probe.set_memory_free(1, 18_000);
        let mut r = rig_with_probe(Arc::clone(&probe), 2);

        // (4000 + 3000 * 2) * 2.0 = 20000 MiB estimated, above the
        // 18000 - 2048 usable on both devices.
        let task = Task::new(TaskType::HeatCapacity, "mattersim-v1-1m", structure(3000));
        let id = submit(&r, task).await;
        let outcome = r.scheduler.schedule_next().await;
        assert_eq!(outcome, ScheduleOutcome::NoSuitableGpu { task_id: id });
        assert_eq!(r.queue.position(id).await, Some(0));

        // One device gains memory; the refresh at the next tick unblocks.
        probe.set_memory_free(1, 25_000);
        let outcome = r.scheduler.schedule_next().await;
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                task_id: id,
                gpu_id: 1
            }
        );
        assert!(r.rx.get_mut(&1).unwrap().try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_model_affinity_wins() {
        let mut r = rig(2);
        r.gpus.add_loaded_model(1, "orb-v2").await;

        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure(100));
        let id = submit(&r, task).await;
        let outcome = r.scheduler.schedule_next().await;
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                task_id: id,
                gpu_id: 1
            }
        );
        assert!(r.rx.get_mut(&1).unwrap().try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_tie_breaks_to_lowest_index() {
        let mut r = rig(2);
        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure(100));
        let id = submit(&r, task).await;
        let outcome = r.scheduler.schedule_next().await;
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                task_id: id,
                gpu_id: 0
            }
        );
        assert!(r.rx.get_mut(&0).unwrap().try_recv().is_ok());
    }

    #[test]
    fn test_score_components() {
        let base = GpuState {
            id: 0,
            name: "test".into(),
            memory_total_mb: 24_000,
            memory_used_mb: 2_000,
            memory_free_mb: 22_000,
            utilization_percent: 0,
            temperature_c: 40,
            status: GpuStatus::Free,
            current_task_id: None,
            loaded_models: vec![],
            last_task_completed_at: None,
            error_message: None,
        };

        // Empty cache: slot bonus + memory + temp + full idle credit.
        let fresh = score_gpu(&base, "m", 2);
        assert!(fresh > 50.0 && fresh < 100.0);

        let mut resident = base.clone();
        resident.loaded_models = vec!["m".to_string()];
        assert!(score_gpu(&resident, "m", 2) > fresh + 40.0);

        let mut full_cache = base.clone();
        full_cache.loaded_models = vec!["x".to_string(), "y".to_string()];
        assert!(score_gpu(&full_cache, "m", 2) < fresh);

        let mut hot = base.clone();
        hot.temperature_c = 95;
        assert!(score_gpu(&hot, "m", 2) < fresh);
    }
}
