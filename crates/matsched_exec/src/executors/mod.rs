//! Per-task-type executors.
//!
//! Each executor drives the calculator through one algorithm and returns a
//! result map. The worker layer is oblivious to which variant it holds; it
//! resolves executors through the registry and merges parameters over
//! [`Executor::default_parameters`] before running.

mod bulk_modulus;
mod heat_capacity;
mod interaction_energy;
pub(crate) mod numeric;
mod optimization;
pub(crate) mod relax;
mod single_point;
mod stability;

pub use bulk_modulus::BulkModulusExecutor;
pub use heat_capacity::HeatCapacityExecutor;
pub use interaction_energy::InteractionEnergyExecutor;
pub use optimization::OptimizationExecutor;
pub use single_point::SinglePointExecutor;
pub use stability::StabilityExecutor;

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use matsched_core::TaskType;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One simulation algorithm.
pub trait Executor: Send + Sync {
    /// Task type this executor serves.
    fn task_type(&self) -> TaskType;

    /// Defaults merged under the caller's parameters before `run`.
    fn default_parameters(&self) -> Map<String, Value>;

    /// Runs the algorithm. Long phases call `ctx.checkpoint()` between
    /// steps so cancellation and timeouts stay effective.
    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError>;
}

/// Task-type to executor mapping.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: FxHashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all six built-in executors.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OptimizationExecutor));
        registry.register(Arc::new(StabilityExecutor));
        registry.register(Arc::new(BulkModulusExecutor));
        registry.register(Arc::new(HeatCapacityExecutor));
        registry.register(Arc::new(InteractionEnergyExecutor));
        registry.register(Arc::new(SinglePointExecutor));
        registry
    }

    /// Adds or replaces an executor.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.task_type(), executor);
    }

    /// Resolves the executor for a task type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).map(Arc::clone)
    }
}
