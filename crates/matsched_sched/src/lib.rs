//! Scheduling substrate for matsched.
//!
//! This crate owns everything between task submission and worker handoff:
//! - `queue`: priority queue with FIFO-per-priority ordering
//! - `gpu`: per-device state, allocation gate, resident-model LRU
//! - `memory`: task memory estimation with live adjustment
//! - `repo`: the task repository boundary and an in-memory mirror
//! - `scheduler`: the matching loop producing `(task, gpu)` pairs
//! - `workers`: worker liveness registry with heartbeat timeouts

pub mod gpu;
pub mod memory;
pub mod queue;
pub mod repo;
pub mod scheduler;
pub mod workers;

pub use gpu::{GpuManager, GpuProbe, GpuState, GpuStatus, GpuSummary, GpuTelemetry, MockProbe};
pub use memory::{MemoryEstimate, MemoryEstimator};
pub use queue::{PriorityQueue, QueueEntry};
pub use repo::{InMemoryTaskRepository, TaskFilter, TaskRepository};
pub use scheduler::{
    score_gpu, Assignment, QueueStatusEntry, ScheduleOutcome, Scheduler, SchedulerStats,
    SchedulerStatsSnapshot,
};
pub use workers::{
    worker_id_for, WorkerInfo, WorkerLost, WorkerManager, WorkerSnapshot, WorkerStatus,
    WorkerSummary,
};
