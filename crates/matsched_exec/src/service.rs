//! Submit/inspect/cancel service.
//!
//! The consumer-facing seam over the repository, the queue, and the worker
//! pool's cancel registry. Validation happens here, before any state
//! changes; the scheduler and workers never see an invalid task.

use crate::logs::{LogLevel, TaskLogEntry, TaskLogService};
use crate::worker::{CancelRegistry, TaskEvent};
use matsched_core::{
    CallbackConfig, CallbackEvent, Lifecycle, ModelCatalog, SchedError, SchedResult, StructureRef,
    Task, TaskId, TaskPriority, TaskState, TaskType, Timeouts,
};
use matsched_sched::{PriorityQueue, TaskFilter, TaskRepository};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

/// Submission input.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    pub model_name: String,
    pub structure: StructureRef,
    pub parameters: Map<String, Value>,
    pub priority: TaskPriority,
    pub callback: Option<CallbackConfig>,
    pub timeout_seconds: Option<u64>,
}

impl SubmitRequest {
    /// Minimal request with defaults.
    pub fn new(task_type: TaskType, model_name: impl Into<String>, structure: StructureRef) -> Self {
        Self {
            task_type,
            model_name: model_name.into(),
            structure,
            parameters: Map::new(),
            priority: TaskPriority::Normal,
            callback: None,
            timeout_seconds: None,
        }
    }
}

/// Submission acknowledgement.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub queue_position: usize,
    pub score: f64,
}

/// Consumer-facing task operations.
pub struct TaskService {
    repo: Arc<dyn TaskRepository>,
    queue: Arc<PriorityQueue>,
    catalog: Arc<RwLock<ModelCatalog>>,
    cancels: Arc<CancelRegistry>,
    events: mpsc::Sender<TaskEvent>,
    logs: Arc<TaskLogService>,
}

impl TaskService {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        queue: Arc<PriorityQueue>,
        catalog: Arc<RwLock<ModelCatalog>>,
        cancels: Arc<CancelRegistry>,
        events: mpsc::Sender<TaskEvent>,
        logs: Arc<TaskLogService>,
    ) -> Self {
        Self {
            repo,
            queue,
            catalog,
            cancels,
            events,
            logs,
        }
    }

    /// Validates and stages a task: repository row in `Pending`, then
    /// `Queued` and enqueued. Returns the id and the queue position.
    pub async fn submit(&self, request: SubmitRequest) -> SchedResult<SubmitReceipt> {
        if !self.catalog.read().await.is_usable(&request.model_name) {
            return Err(SchedError::Validation(format!(
                "unknown or disabled model: {}",
                request.model_name
            )));
        }
        if request.structure.n_atoms == 0 {
            return Err(SchedError::Validation("structure has no atoms".into()));
        }
        if let Some(timeout) = request.timeout_seconds {
            if timeout == 0 {
                return Err(SchedError::Validation("timeout must be positive".into()));
            }
        }

        let mut task = Task::new(request.task_type, request.model_name, request.structure)
            .with_priority(request.priority)
            .with_parameters(request.parameters);
        if let Some(callback) = request.callback {
            task = task.with_callback(callback);
        }
        if let Some(timeout) = request.timeout_seconds {
            task = task.with_timeout(timeout.min(Timeouts::MAX));
        }

        let task_id = task.id;
        let priority = task.priority;
        let callback = task.callback.clone();
        self.repo.create(task).await?;

        let _ = self
            .events
            .send(TaskEvent {
                task_id,
                event: CallbackEvent::Created,
                data: Map::new(),
                callback,
            })
            .await;

        self.repo.transition(task_id, TaskState::Queued).await?;
        let score = self.queue.enqueue(task_id, priority).await;
        let queue_position = self.queue.position(task_id).await.unwrap_or(0);

        info!(
            task_id = %task_id,
            priority = %priority,
            queue_position,
            "task_submitted"
        );
        Ok(SubmitReceipt {
            task_id,
            queue_position,
            score,
        })
    }

    /// Fetches a task row.
    pub async fn get_task(&self, task_id: TaskId) -> SchedResult<Task> {
        self.repo.get(task_id).await
    }

    /// Result view for a terminal task. Non-COMPLETED states expose no
    /// result payload.
    pub async fn get_task_result(&self, task_id: TaskId) -> SchedResult<Map<String, Value>> {
        let task = self.repo.get(task_id).await?;
        if !Lifecycle::is_terminal(task.state) {
            return Err(SchedError::Validation(format!(
                "task {task_id} is not finished (state: {})",
                task.state
            )));
        }
        let mut view = Map::new();
        view.insert("status".into(), json!(task.state));
        match task.state {
            TaskState::Completed => {
                view.insert(
                    "result".into(),
                    Value::Object(task.result.unwrap_or_default()),
                );
            }
            TaskState::Failed => {
                if let Some(error) = task.error {
                    view.insert("error_message".into(), json!(error.message));
                    if let Some(traceback) = error.traceback {
                        view.insert("error_traceback".into(), json!(traceback));
                    }
                }
            }
            _ => {}
        }
        Ok(view)
    }

    /// Lists task rows.
    pub async fn list_tasks(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> SchedResult<Vec<Task>> {
        self.repo.list(filter, limit, offset).await
    }

    /// Cancels a task. Queued tasks leave the queue atomically; in-flight
    /// tasks get their token tripped and reach a terminal state at the next
    /// executor checkpoint. Cancelling a terminal task is benign. Returns
    /// the state observed when the signal was posted.
    pub async fn cancel_task(&self, task_id: TaskId) -> SchedResult<TaskState> {
        let task = self.repo.get(task_id).await?;

        if Lifecycle::is_terminal(task.state) {
            return Ok(task.state);
        }

        match task.state {
            TaskState::Pending => {
                let task = self.repo.transition(task_id, TaskState::Cancelled).await?;
                self.emit_cancelled(&task).await;
                Ok(task.state)
            }
            TaskState::Queued => {
                self.queue.remove(task_id).await;
                let task = self.repo.transition(task_id, TaskState::Cancelled).await?;
                self.emit_cancelled(&task).await;
                Ok(task.state)
            }
            TaskState::Assigned | TaskState::Running => {
                if self.cancels.cancel(task_id) {
                    return Ok(task.state);
                }
                // No token yet: the worker has not picked the task up, so
                // cancel it directly; a lost race means the token exists now.
                match self.repo.transition(task_id, TaskState::Cancelled).await {
                    Ok(task) => {
                        self.emit_cancelled(&task).await;
                        Ok(task.state)
                    }
                    Err(_) => {
                        self.cancels.cancel(task_id);
                        Ok(task.state)
                    }
                }
            }
            _ => Ok(task.state),
        }
    }

    /// Changes the priority of a still-queued task.
    pub async fn reprioritize(&self, task_id: TaskId, priority: TaskPriority) -> bool {
        self.queue.reprioritize(task_id, priority).await
    }

    /// Recent structured log entries of a task, oldest first.
    pub async fn get_task_logs(
        &self,
        task_id: TaskId,
        min_level: Option<LogLevel>,
        limit: usize,
    ) -> SchedResult<Vec<TaskLogEntry>> {
        // Surface NotFound for unknown tasks rather than an empty buffer.
        self.repo.get(task_id).await?;
        Ok(self.logs.get(task_id, min_level, limit))
    }

    /// Live log feed; consumers filter entries by task id.
    pub fn stream_task_logs(&self) -> tokio::sync::broadcast::Receiver<TaskLogEntry> {
        self.logs.subscribe()
    }

    async fn emit_cancelled(&self, task: &Task) {
        let _ = self
            .events
            .send(TaskEvent {
                task_id: task.id,
                event: CallbackEvent::Cancelled,
                data: Map::new(),
                callback: task.callback.clone(),
            })
            .await;
    }
}
