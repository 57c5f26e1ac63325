//! The task repository boundary.
//!
//! The repository is the durable mirror of task rows; the core is the sole
//! mutator while a task is non-terminal. State changes go through
//! [`TaskRepository::transition`], which validates the edge and maintains the
//! timestamp/gpu invariants. The in-memory implementation backs tests and
//! the demo binary.

use async_trait::async_trait;
use chrono::Utc;
use matsched_core::{
    GpuId, Lifecycle, SchedError, SchedResult, Task, TaskError, TaskId, TaskState, TaskType,
};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::info;

/// Row filter for listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<TaskType>,
    pub model_name: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.state.map_or(true, |s| task.state == s)
            && self.task_type.map_or(true, |t| task.task_type == t)
            && self
                .model_name
                .as_deref()
                .map_or(true, |m| task.model_name == m)
    }
}

/// CRUD + validated status updates over task rows.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Inserts a new row. Fails on duplicate id.
    async fn create(&self, task: Task) -> SchedResult<()>;

    /// Fetches a row.
    async fn get(&self, id: TaskId) -> SchedResult<Task>;

    /// Lists rows matching the filter, newest first.
    async fn list(&self, filter: TaskFilter, limit: usize, offset: usize)
        -> SchedResult<Vec<Task>>;

    /// Validated state transition. Stamps `started_at` on entering `Running`
    /// and `completed_at` on entering a terminal state; terminal states also
    /// clear `gpu_id`.
    async fn transition(&self, id: TaskId, to: TaskState) -> SchedResult<Task>;

    /// `Queued -> Assigned` with the device binding recorded.
    async fn assign(&self, id: TaskId, gpu: GpuId) -> SchedResult<Task>;

    /// Attaches the executor result map.
    async fn set_result(&self, id: TaskId, result: Map<String, Value>) -> SchedResult<()>;

    /// Attaches the error descriptor.
    async fn set_error(&self, id: TaskId, error: TaskError) -> SchedResult<()>;
}

/// In-memory repository used by tests and the demo binary.
#[derive(Default)]
pub struct InMemoryTaskRepository {
    rows: RwLock<FxHashMap<TaskId, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether no rows are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn apply_transition(task: &mut Task, to: TaskState) -> SchedResult<()> {
        Lifecycle::validate_transition(task.state, to)?;
        task.state = to;
        if to == TaskState::Running && task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        if Lifecycle::is_terminal(to) {
            task.completed_at = Some(Utc::now());
            task.gpu_id = None;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: Task) -> SchedResult<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&task.id) {
            return Err(SchedError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }
        rows.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> SchedResult<Task> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))
    }

    async fn list(
        &self,
        filter: TaskFilter,
        limit: usize,
        offset: usize,
    ) -> SchedResult<Vec<Task>> {
        let rows = self.rows.read().await;
        let mut tasks: Vec<Task> = rows.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition(&self, id: TaskId, to: TaskState) -> SchedResult<Task> {
        let mut rows = self.rows.write().await;
        let task = rows
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        let from = task.state;
        Self::apply_transition(task, to)?;
        info!(task_id = %id, from = %from, to = %to, "task_state_transition");
        Ok(task.clone())
    }

    async fn assign(&self, id: TaskId, gpu: GpuId) -> SchedResult<Task> {
        let mut rows = self.rows.write().await;
        let task = rows
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        Self::apply_transition(task, TaskState::Assigned)?;
        task.gpu_id = Some(gpu);
        info!(task_id = %id, gpu_id = gpu, "task_assigned");
        Ok(task.clone())
    }

    async fn set_result(&self, id: TaskId, result: Map<String, Value>) -> SchedResult<()> {
        let mut rows = self.rows.write().await;
        let task = rows
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        task.result = Some(result);
        Ok(())
    }

    async fn set_error(&self, id: TaskId, error: TaskError) -> SchedResult<()> {
        let mut rows = self.rows.write().await;
        let task = rows
            .get_mut(&id)
            .ok_or_else(|| SchedError::NotFound(format!("task {id}")))?;
        task.error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matsched_core::StructureRef;

    fn structure() -> StructureRef {
        StructureRef {
            id: "s-1".into(),
            n_atoms: 8,
            formula: "C8".into(),
            lattice: [[3.57, 0.0, 0.0], [0.0, 3.57, 0.0], [0.0, 0.0, 3.57]],
        }
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure());
        let id = task.id;

        repo.create(task.clone()).await.unwrap();
        assert!(matches!(
            repo.create(task).await,
            Err(SchedError::Validation(_))
        ));

        let fetched = repo.get(id).await.unwrap();
        assert_eq!(fetched.state, TaskState::Pending);
        assert!(matches!(
            repo.get(TaskId::new()).await,
            Err(SchedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_maintains_invariants() {
        let repo = InMemoryTaskRepository::new();
        let task = Task::new(TaskType::SinglePoint, "orb-v2", structure());
        let id = task.id;
        repo.create(task).await.unwrap();

        repo.transition(id, TaskState::Queued).await.unwrap();
        let assigned = repo.assign(id, 0).await.unwrap();
        assert_eq!(assigned.gpu_id, Some(0));

        let running = repo.transition(id, TaskState::Running).await.unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.gpu_id, Some(0));

        let done = repo.transition(id, TaskState::Completed).await.unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.gpu_id.is_none());

        // Terminal rows accept no further edges.
        assert!(matches!(
            repo.transition(id, TaskState::Running).await,
            Err(SchedError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let repo = InMemoryTaskRepository::new();
        let a = Task::new(TaskType::SinglePoint, "orb-v2", structure());
        let b = Task::new(TaskType::Optimization, "orb-v2", structure());
        repo.create(a).await.unwrap();
        repo.create(b.clone()).await.unwrap();

        let only_opt = repo
            .list(
                TaskFilter {
                    task_type: Some(TaskType::Optimization),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(only_opt.len(), 1);
        assert_eq!(only_opt[0].id, b.id);
    }
}
