//! Per-GPU worker pool.
//!
//! One worker task per non-reserved device, each consuming a depth-1
//! handoff channel fed by the scheduler. A worker validates the
//! `Assigned -> Running` edge, binds the calculator (loading the model and
//! updating the device LRU if needed), runs the executor on the blocking
//! pool under a deadline, then records the terminal state, releases the
//! device, and emits callback events. Executor failures never escape the
//! worker loop.

use crate::calculator::{CalcError, ModelLoader, StructureSource};
use crate::context::{merge_parameters, ExecContext, ExecError};
use crate::executors::ExecutorRegistry;
use crate::logs::{LogLevel, TaskLogService};
use matsched_core::{
    CallbackConfig, CallbackEvent, CancelToken, GpuId, Task, TaskError, TaskId, TaskState,
    Timeouts,
};
use matsched_sched::{
    worker_id_for, Assignment, GpuManager, MemoryEstimator, TaskRepository, WorkerManager,
};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A task lifecycle event, fanned out to callback subscribers.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub event: CallbackEvent,
    pub data: Map<String, Value>,
    /// Subscription carried by the task, if any.
    pub callback: Option<CallbackConfig>,
}

/// Cancellation tokens of in-flight tasks.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: StdMutex<FxHashMap<TaskId, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, task_id: TaskId, token: CancelToken) {
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .insert(task_id, token);
    }

    fn remove(&self, task_id: TaskId) {
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .remove(&task_id);
    }

    /// Trips the token of an in-flight task. Returns false when the task is
    /// not currently executing.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self
            .tokens
            .lock()
            .expect("cancel registry poisoned")
            .get(&task_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Executes assignments, one worker per device.
pub struct WorkerPool {
    gpus: Arc<GpuManager>,
    repo: Arc<dyn TaskRepository>,
    loader: Arc<dyn ModelLoader>,
    structures: Arc<dyn StructureSource>,
    executors: Arc<ExecutorRegistry>,
    workers: Arc<WorkerManager>,
    estimator: MemoryEstimator,
    events: mpsc::Sender<TaskEvent>,
    logs: Arc<TaskLogService>,
    cancels: Arc<CancelRegistry>,
    heartbeat_interval: Duration,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gpus: Arc<GpuManager>,
        repo: Arc<dyn TaskRepository>,
        loader: Arc<dyn ModelLoader>,
        structures: Arc<dyn StructureSource>,
        executors: Arc<ExecutorRegistry>,
        workers: Arc<WorkerManager>,
        estimator: MemoryEstimator,
        events: mpsc::Sender<TaskEvent>,
        logs: Arc<TaskLogService>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            gpus,
            repo,
            loader,
            structures,
            executors,
            workers,
            estimator,
            events,
            logs,
            cancels: Arc::new(CancelRegistry::new()),
            heartbeat_interval,
        }
    }

    /// Shared handle used by the cancel path.
    pub fn cancel_registry(&self) -> Arc<CancelRegistry> {
        Arc::clone(&self.cancels)
    }

    /// Spawns one worker per schedulable device and returns the handoff
    /// senders, keyed by device index, for the scheduler.
    pub async fn spawn(
        self: &Arc<Self>,
        shutdown: CancelToken,
    ) -> FxHashMap<GpuId, mpsc::Sender<Assignment>> {
        let mut dispatch = FxHashMap::default();
        for gpu in self.gpus.schedulable_ids().await {
            let (tx, rx) = mpsc::channel::<Assignment>(1);
            dispatch.insert(gpu, tx);
            let pool = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                pool.worker_loop(gpu, rx, shutdown).await;
            });
        }
        dispatch
    }

    async fn worker_loop(
        &self,
        gpu: GpuId,
        mut assignments: mpsc::Receiver<Assignment>,
        shutdown: CancelToken,
    ) {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let worker_id = worker_id_for(&hostname, gpu);
        self.workers
            .register(&worker_id, gpu, &hostname, Some(std::process::id()))
            .await;
        info!(worker_id = %worker_id, gpu_id = gpu, "worker_started");

        // Heartbeats keep flowing while a task executes; they run beside
        // the assignment loop, not inside it.
        let heartbeats = tokio::spawn({
            let workers = Arc::clone(&self.workers);
            let worker_id = worker_id.clone();
            let shutdown = shutdown.clone();
            let interval = self.heartbeat_interval / 2;
            async move {
                while !shutdown.is_cancelled() {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            workers.heartbeat(&worker_id).await;
                        }
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        });

        loop {
            tokio::select! {
                assignment = assignments.recv() => {
                    let Some(assignment) = assignment else { break };
                    self.workers.set_busy(&worker_id, assignment.task_id).await;
                    let succeeded = self.execute_assignment(assignment).await;
                    self.workers.set_idle(&worker_id, succeeded).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        heartbeats.abort();
        self.workers.deregister(&worker_id).await;
        info!(worker_id = %worker_id, gpu_id = gpu, "worker_stopped");
    }

    /// Runs one assignment through to a terminal state. Returns whether the
    /// task completed successfully.
    async fn execute_assignment(&self, assignment: Assignment) -> bool {
        let Assignment { task_id, gpu_id } = assignment;

        let task = match self.repo.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "assigned_task_missing");
                self.gpus.release(gpu_id).await;
                return false;
            }
        };

        // The cancel path needs the token before the first checkpoint runs.
        let token = CancelToken::new();
        self.cancels.insert(task_id, token.clone());

        let succeeded = self.run_task(&task, gpu_id, token).await;
        self.cancels.remove(task_id);
        succeeded
    }

    async fn run_task(&self, task: &Task, gpu_id: GpuId, token: CancelToken) -> bool {
        let task_id = task.id;

        if let Err(err) = self.repo.transition(task_id, TaskState::Running).await {
            // Typically a cancel that won the race after assignment.
            warn!(task_id = %task_id, error = %err, "run_transition_rejected");
            self.gpus.release(gpu_id).await;
            return false;
        }
        self.logs.append(
            task_id,
            LogLevel::Info,
            Some(gpu_id),
            format!("execution started with model {}", task.model_name),
            Map::new(),
        );
        self.emit(task, CallbackEvent::Started, Map::new()).await;

        let atoms = match self.structures.load(&task.structure) {
            Ok(atoms) => atoms,
            Err(err) => {
                self.fail(task, gpu_id, format!("structure load failed: {err}"))
                    .await;
                return false;
            }
        };

        let calc = match self.loader.load(&task.model_name, gpu_id).await {
            Ok(calc) => calc,
            Err(CalcError::OutOfMemory { required_mb }) => {
                self.handle_oom(task, gpu_id, required_mb).await;
                return false;
            }
            Err(err) => {
                self.fail(task, gpu_id, format!("model load failed: {err}"))
                    .await;
                return false;
            }
        };
        if let Some(evicted) = self.gpus.add_loaded_model(gpu_id, &task.model_name).await {
            self.loader.unload(&evicted, gpu_id).await;
        }

        let Some(executor) = self.executors.get(task.task_type) else {
            self.fail(
                task,
                gpu_id,
                format!("no executor for task type {}", task.task_type),
            )
            .await;
            return false;
        };

        let ctx = ExecContext {
            task_id,
            task_type: task.task_type,
            model_name: task.model_name.clone(),
            gpu_id,
            parameters: merge_parameters(executor.default_parameters(), &task.parameters),
            cancel: token.clone(),
        };
        let timeout = Timeouts::effective(task.task_type, task.timeout_seconds);

        let mut handle = tokio::task::spawn_blocking(move || {
            let mut atoms = atoms;
            executor.run(&mut atoms, calc.as_ref(), &ctx)
        });

        let mut timed_out = false;
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
                info!(task_id = %task_id, timeout_s = timeout, "task_deadline_fired");
                timed_out = true;
                token.cancel();
                (&mut handle).await
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => {
                error!(task_id = %task_id, error = %join_err, "executor_panicked");
                self.fail(task, gpu_id, "executor panicked".to_string()).await;
                return false;
            }
        };

        match result {
            Ok(outcome) => {
                let mut result_map = outcome.data;
                if !outcome.output_files.is_empty() {
                    result_map.insert(
                        "output_files".into(),
                        Value::Object(outcome.output_files),
                    );
                }
                let _ = self.repo.set_result(task_id, result_map.clone()).await;
                if let Err(err) = self.repo.transition(task_id, TaskState::Completed).await {
                    warn!(task_id = %task_id, error = %err, "completion_transition_rejected");
                }
                self.gpus.release(gpu_id).await;
                info!(task_id = %task_id, gpu_id, "task_completed");
                self.logs.append(
                    task_id,
                    LogLevel::Info,
                    Some(gpu_id),
                    "execution completed",
                    Map::new(),
                );
                self.emit(task, CallbackEvent::Completed, result_map).await;
                true
            }
            Err(ExecError::Cancelled) => {
                let (state, event) = if timed_out {
                    (TaskState::Timeout, CallbackEvent::Timeout)
                } else {
                    (TaskState::Cancelled, CallbackEvent::Cancelled)
                };
                if let Err(err) = self.repo.transition(task_id, state).await {
                    warn!(task_id = %task_id, error = %err, "cancel_transition_rejected");
                }
                self.gpus.release(gpu_id).await;
                info!(task_id = %task_id, gpu_id, state = %state, "task_stopped");
                self.logs.append(
                    task_id,
                    LogLevel::Warning,
                    Some(gpu_id),
                    format!("execution stopped: {state}"),
                    Map::new(),
                );
                self.emit(task, event, Map::new()).await;
                false
            }
            Err(ExecError::Calculator(CalcError::OutOfMemory { required_mb })) => {
                self.handle_oom(task, gpu_id, required_mb).await;
                false
            }
            Err(err) => {
                self.fail(task, gpu_id, err.to_string()).await;
                false
            }
        }
    }

    /// OOM: feed the estimator, flag the device, fail the task.
    async fn handle_oom(&self, task: &Task, gpu_id: GpuId, required_mb: u64) {
        self.estimator.record_oom(&task.model_name, required_mb).await;
        self.gpus
            .mark_error(gpu_id, format!("out of memory loading {}", task.model_name))
            .await;
        self.fail(task, gpu_id, format!("out of GPU memory (~{required_mb} MiB)"))
            .await;
    }

    async fn fail(&self, task: &Task, gpu_id: GpuId, message: String) {
        let task_id = task.id;
        error!(task_id = %task_id, gpu_id, error = %message, "task_failed");
        self.logs
            .append(task_id, LogLevel::Error, Some(gpu_id), message.clone(), Map::new());
        let _ = self
            .repo
            .set_error(task_id, TaskError::new(message.clone()))
            .await;
        if let Err(err) = self.repo.transition(task_id, TaskState::Failed).await {
            warn!(task_id = %task_id, error = %err, "failure_transition_rejected");
        }
        self.gpus.release(gpu_id).await;

        let mut data = Map::new();
        data.insert("error_message".into(), Value::String(message));
        self.emit(task, CallbackEvent::Failed, data).await;
    }

    async fn emit(&self, task: &Task, event: CallbackEvent, data: Map<String, Value>) {
        let event = TaskEvent {
            task_id: task.id,
            event,
            data,
            callback: task.callback.clone(),
        };
        if self.events.send(event).await.is_err() {
            warn!("task_event_channel_closed");
        }
    }
}
