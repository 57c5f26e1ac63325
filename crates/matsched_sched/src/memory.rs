//! Task memory estimation.
//!
//! `estimate = (model_base + n_atoms * MEMORY_PER_ATOM_MB) * type_multiplier`.
//! Model bases come from the catalog and are adjusted at runtime after
//! observed out-of-memory events.

use matsched_core::{ModelCatalog, Task, TaskType};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Per-atom memory estimate (MiB).
pub const MEMORY_PER_ATOM_MB: u64 = 2;

/// Memory estimate breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEstimate {
    pub model_base_mb: u64,
    pub atom_memory_mb: u64,
    pub task_multiplier: f64,
    pub total_mb: u64,
}

/// Estimator over a shared, runtime-adjustable model catalog.
#[derive(Clone)]
pub struct MemoryEstimator {
    catalog: Arc<RwLock<ModelCatalog>>,
}

impl MemoryEstimator {
    pub fn new(catalog: Arc<RwLock<ModelCatalog>>) -> Self {
        Self { catalog }
    }

    /// Workload multiplier per task type.
    pub fn multiplier(task_type: TaskType) -> f64 {
        match task_type {
            TaskType::Optimization => 1.2,
            TaskType::Stability => 1.5,
            TaskType::BulkModulus => 1.3,
            TaskType::HeatCapacity => 2.0,
            TaskType::InteractionEnergy => 1.2,
            TaskType::SinglePoint => 1.0,
        }
    }

    /// Estimated memory for a task (MiB).
    pub async fn estimate(&self, task: &Task) -> u64 {
        self.estimate_detailed(task).await.total_mb
    }

    /// Full breakdown of the estimate.
    pub async fn estimate_detailed(&self, task: &Task) -> MemoryEstimate {
        let model_base_mb = self.catalog.read().await.memory_estimate(&task.model_name);
        let atom_memory_mb = task.structure.n_atoms as u64 * MEMORY_PER_ATOM_MB;
        let task_multiplier = Self::multiplier(task.task_type);
        let total_mb = ((model_base_mb + atom_memory_mb) as f64 * task_multiplier) as u64;
        MemoryEstimate {
            model_base_mb,
            atom_memory_mb,
            task_multiplier,
            total_mb,
        }
    }

    /// Raises a model's base estimate after an observed OOM.
    pub async fn record_oom(&self, model_name: &str, observed_mb: u64) {
        let mut catalog = self.catalog.write().await;
        let old = catalog.memory_estimate(model_name);
        let new = observed_mb.max(old);
        catalog.set_memory_estimate(model_name, new);
        info!(model = %model_name, old_mb = old, new_mb = new, "model_memory_estimate_updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matsched_core::StructureRef;

    fn structure(n_atoms: usize) -> StructureRef {
        StructureRef {
            id: "s-1".into(),
            n_atoms,
            formula: "C8".into(),
            lattice: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
        }
    }

    #[tokio::test]
    async fn test_estimate_composition() {
        let catalog = Arc::new(RwLock::new(ModelCatalog::builtin()));
        let estimator = MemoryEstimator::new(catalog);

        let task = Task::new(TaskType::HeatCapacity, "orb-v2", structure(500));
        let detail = estimator.estimate_detailed(&task).await;
        assert_eq!(detail.model_base_mb, 3000);
        assert_eq!(detail.atom_memory_mb, 1000);
        assert_eq!(detail.total_mb, 8000); // (3000 + 1000) * 2.0
    }

    #[tokio::test]
    async fn test_unknown_model_uses_default_base() {
        let catalog = Arc::new(RwLock::new(ModelCatalog::builtin()));
        let estimator = MemoryEstimator::new(catalog);

        let task = Task::new(TaskType::SinglePoint, "mystery", structure(100));
        let detail = estimator.estimate_detailed(&task).await;
        assert_eq!(detail.model_base_mb, 4000);
        assert_eq!(detail.total_mb, 4200);
    }

    #[tokio::test]
    async fn test_oom_feedback_raises_estimate() {
        let catalog = Arc::new(RwLock::new(ModelCatalog::builtin()));
        let estimator = MemoryEstimator::new(Arc::clone(&catalog));

        estimator.record_oom("orb-v2", 7000).await;
        assert_eq!(catalog.read().await.memory_estimate("orb-v2"), 7000);

        // A smaller observation never lowers the estimate.
        estimator.record_oom("orb-v2", 1000).await;
        assert_eq!(catalog.read().await.memory_estimate("orb-v2"), 7000);
    }
}
