//! Core types for matsched.
//!
//! This crate provides the shared vocabulary of the scheduling substrate:
//! - `cancel`: cooperative cancellation token
//! - `id`: task and record identifiers
//! - `task`: the task record, priorities, states, callback events
//! - `lifecycle`: the state-transition table and timeout policy
//! - `error`: the error taxonomy
//! - `config`: runtime settings and environment overrides
//! - `model`: the ML-potential model catalog

pub mod cancel;
pub mod config;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod model;
pub mod task;

pub use cancel::CancelToken;
pub use config::Settings;
pub use error::{SchedError, SchedResult};
pub use id::{short_id, TaskId};
pub use lifecycle::{Lifecycle, Timeouts};
pub use model::{ModelCatalog, ModelFamily, ModelRecord, ModelStatus};
pub use task::{
    CallbackConfig, CallbackEvent, GpuId, StructureRef, Task, TaskError, TaskPriority, TaskState,
    TaskType,
};
