//! Catalog of machine-learning potential models.

use crate::task::GpuId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Model family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Mace,
    Orb,
    Omat24,
    Grace,
    SevenNet,
    MatterSim,
    Custom,
}

/// Model availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Known but not resident anywhere.
    Available,
    Loading,
    Loaded,
    Error,
    Disabled,
}

/// Catalog entry for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Unique model name, also the scheduling key.
    pub name: String,
    pub family: ModelFamily,
    /// On-disk path or remote identifier resolved by the model loader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Estimated resident memory (MiB), updated after OOM observations.
    pub memory_mb: u64,
    pub status: ModelStatus,
    /// Devices the model is currently resident on (advisory).
    #[serde(default)]
    pub loaded_on: Vec<GpuId>,
}

impl ModelRecord {
    /// Creates an available record.
    pub fn new(name: impl Into<String>, family: ModelFamily, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            family,
            path: None,
            memory_mb,
            status: ModelStatus::Available,
            loaded_on: Vec::new(),
        }
    }

    /// Sets the on-disk path or identifier.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Model catalog with runtime-adjustable memory estimates.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    records: IndexMap<String, ModelRecord>,
}

/// Base memory assumed for models missing from the catalog (MiB).
pub const DEFAULT_MODEL_MEMORY_MB: u64 = 4000;

impl ModelCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the built-in production models.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for record in [
            ModelRecord::new("mace-mp-0-medium", ModelFamily::Mace, 4000)
                .with_path("mace-mp-0-medium.model"),
            ModelRecord::new("mace-mp-0-large", ModelFamily::Mace, 8000)
                .with_path("mace-mp-0-large.model"),
            ModelRecord::new("mace-omat-0-medium", ModelFamily::Mace, 5000)
                .with_path("mace-omat-0-medium.model"),
            ModelRecord::new("mace-omat-0-large", ModelFamily::Mace, 10_000)
                .with_path("mace-omat-0-large.model"),
            ModelRecord::new("orb-v2", ModelFamily::Orb, 3000),
            ModelRecord::new("sevennet-0", ModelFamily::SevenNet, 3500),
            ModelRecord::new("mattersim-v1-1m", ModelFamily::MatterSim, 4000),
            ModelRecord::new("mattersim-v1-5m", ModelFamily::MatterSim, 8000),
            ModelRecord::new("grace-2l-oam", ModelFamily::Grace, 4500),
        ] {
            catalog.insert(record);
        }
        catalog
    }

    /// Adds or replaces a record.
    pub fn insert(&mut self, record: ModelRecord) {
        self.records.insert(record.name.clone(), record);
    }

    /// Looks up a record by name.
    pub fn get(&self, name: &str) -> Option<&ModelRecord> {
        self.records.get(name)
    }

    /// Whether the model exists and is not disabled.
    pub fn is_usable(&self, name: &str) -> bool {
        self.get(name)
            .map(|r| r.status != ModelStatus::Disabled)
            .unwrap_or(false)
    }

    /// All records, in catalog order.
    pub fn list(&self) -> impl Iterator<Item = &ModelRecord> {
        self.records.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated base memory for a model, falling back to the default.
    pub fn memory_estimate(&self, name: &str) -> u64 {
        self.get(name)
            .map(|r| r.memory_mb)
            .unwrap_or(DEFAULT_MODEL_MEMORY_MB)
    }

    /// Updates a model's memory estimate after an observed OOM.
    pub fn set_memory_estimate(&mut self, name: &str, memory_mb: u64) -> bool {
        match self.records.get_mut(name) {
            Some(record) => {
                record.memory_mb = memory_mb;
                true
            }
            None => false,
        }
    }

    /// Updates a model's status.
    pub fn set_status(&mut self, name: &str, status: ModelStatus) -> bool {
        match self.records.get_mut(name) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Records residency of a model on a device.
    pub fn mark_loaded(&mut self, name: &str, gpu: GpuId) {
        if let Some(record) = self.records.get_mut(name) {
            if !record.loaded_on.contains(&gpu) {
                record.loaded_on.push(gpu);
            }
            record.status = ModelStatus::Loaded;
        }
    }

    /// Clears residency of a model on a device.
    pub fn mark_unloaded(&mut self, name: &str, gpu: GpuId) {
        if let Some(record) = self.records.get_mut(name) {
            record.loaded_on.retain(|g| *g != gpu);
            if record.loaded_on.is_empty() && record.status == ModelStatus::Loaded {
                record.status = ModelStatus::Available;
            }
        }
    }
}
