//! The task record and its value vocabulary.
//!
//! A task is the unit of work: one simulation of one structure against one
//! model from the catalog. Tasks are created `Pending`, staged `Queued`,
//! bound to a device `Assigned`, executed `Running`, and end in exactly one
//! of the four terminal states.

use crate::id::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Physical device index.
pub type GpuId = u32;

/// Supported task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Optimization,
    Stability,
    BulkModulus,
    HeatCapacity,
    InteractionEnergy,
    SinglePoint,
}

impl TaskType {
    /// All task types, in catalog order.
    pub const ALL: [TaskType; 6] = [
        TaskType::Optimization,
        TaskType::Stability,
        TaskType::BulkModulus,
        TaskType::HeatCapacity,
        TaskType::InteractionEnergy,
        TaskType::SinglePoint,
    ];

    /// Wire name of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Optimization => "optimization",
            TaskType::Stability => "stability",
            TaskType::BulkModulus => "bulk_modulus",
            TaskType::HeatCapacity => "heat_capacity",
            TaskType::InteractionEnergy => "interaction_energy",
            TaskType::SinglePoint => "single_point",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Lower rank dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Scheduled ahead of everything else.
    Critical,
    High,
    Normal,
    /// Batch work.
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl TaskPriority {
    /// All priorities, highest first.
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Integer rank used in queue scores (CRITICAL=0 .. LOW=3).
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    /// Recovers a priority from a rank, clamping out-of-range values to Low.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => TaskPriority::Critical,
            1 => TaskPriority::High,
            2 => TaskPriority::Normal,
            _ => TaskPriority::Low,
        }
    }

    /// Display name, e.g. `NORMAL`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "CRITICAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::Low => "LOW",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events a subscriber can be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackEvent {
    #[serde(rename = "task.created")]
    Created,
    #[serde(rename = "task.started")]
    Started,
    #[serde(rename = "task.completed")]
    Completed,
    #[serde(rename = "task.failed")]
    Failed,
    #[serde(rename = "task.cancelled")]
    Cancelled,
    #[serde(rename = "task.timeout")]
    Timeout,
    #[serde(rename = "task.progress")]
    Progress,
}

impl CallbackEvent {
    /// Wire name, e.g. `task.completed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackEvent::Created => "task.created",
            CallbackEvent::Started => "task.started",
            CallbackEvent::Completed => "task.completed",
            CallbackEvent::Failed => "task.failed",
            CallbackEvent::Cancelled => "task.cancelled",
            CallbackEvent::Timeout => "task.timeout",
            CallbackEvent::Progress => "task.progress",
        }
    }

    /// Event corresponding to a terminal state, if any.
    pub fn for_terminal_state(state: TaskState) -> Option<Self> {
        match state {
            TaskState::Completed => Some(CallbackEvent::Completed),
            TaskState::Failed => Some(CallbackEvent::Failed),
            TaskState::Cancelled => Some(CallbackEvent::Cancelled),
            TaskState::Timeout => Some(CallbackEvent::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback subscription carried by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Target URL for HTTP POST delivery.
    pub url: String,

    /// Subscribed events.
    pub events: Vec<CallbackEvent>,

    /// Shared secret for payload signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl CallbackConfig {
    /// Subscribes to the default completed/failed pair.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events: vec![CallbackEvent::Completed, CallbackEvent::Failed],
            secret: None,
        }
    }

    /// Replaces the subscribed event set.
    pub fn with_events(mut self, events: Vec<CallbackEvent>) -> Self {
        self.events = events;
        self
    }

    /// Sets the signing secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Whether the subscription covers the given event.
    pub fn subscribes(&self, event: CallbackEvent) -> bool {
        self.events.contains(&event)
    }
}

/// Resolved structure handle produced by the external structure reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureRef {
    /// Storage key of the structure row.
    pub id: String,
    /// Atom count of the parsed structure.
    pub n_atoms: usize,
    /// Reduced chemical formula.
    pub formula: String,
    /// Lattice vectors in Å, rows are a, b, c.
    pub lattice: [[f64; 3]; 3],
}

/// Error descriptor attached to a failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }
}

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub model_name: String,
    pub structure: StructureRef,

    /// Free-form executor parameters, merged over executor defaults.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub priority: TaskPriority,
    pub state: TaskState,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Device binding; set iff state is `Assigned` or `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<GpuId>,

    /// Executor result map; set only on `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackConfig>,

    /// Caller-supplied timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl Task {
    /// Creates a new pending task.
    pub fn new(
        task_type: TaskType,
        model_name: impl Into<String>,
        structure: StructureRef,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            model_name: model_name.into(),
            structure,
            parameters: Map::new(),
            priority: TaskPriority::Normal,
            state: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            gpu_id: None,
            result: None,
            error: None,
            callback: None,
            timeout_seconds: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets executor parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the callback subscription.
    pub fn with_callback(mut self, callback: CallbackConfig) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Sets a custom timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}
