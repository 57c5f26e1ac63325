//! Execution layer for matsched.
//!
//! This crate turns scheduled assignments into finished results:
//! - `atoms`: the in-memory periodic structure and the guest-gas library
//! - `calculator`: the opaque calculator and model-loader boundaries
//! - `context`: executor inputs and outputs
//! - `executors`: one executor per task type
//! - `logs`: per-task structured log buffers and the live feed
//! - `worker`: the per-GPU worker pool
//! - `service`: submit/inspect/cancel over the repository and queue

pub mod atoms;
pub mod calculator;
pub mod context;
pub mod executors;
pub mod logs;
pub mod service;
pub mod worker;

pub use atoms::{gas_molecule, Atoms, CellParameters};
pub use calculator::{
    CalcError, Calculator, MockCalculator, MockModelLoader, ModelLoader, StructureSource,
    SyntheticStructureSource,
};
pub use context::{ExecContext, ExecError, ExecOutcome};
pub use executors::{Executor, ExecutorRegistry};
pub use logs::{LogLevel, TaskLogEntry, TaskLogService};
pub use service::{SubmitReceipt, SubmitRequest, TaskService};
pub use worker::{CancelRegistry, TaskEvent, WorkerPool};
