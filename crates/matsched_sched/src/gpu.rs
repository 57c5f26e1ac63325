//! Per-GPU state and the allocation gate.
//!
//! Telemetry comes from a [`GpuProbe`]; probe failures are suppressed and
//! the device keeps its last-known readings; telemetry is never fabricated.
//! Every mutation happens under the target device's lock; cross-device
//! sweeps take locks in ascending index order.

use matsched_core::{GpuId, TaskId};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Device scheduling status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatus {
    Free,
    Busy,
    Error,
    /// Excluded from scheduling for the lifetime of the process.
    Reserved,
}

impl fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GpuStatus::Free => "free",
            GpuStatus::Busy => "busy",
            GpuStatus::Error => "error",
            GpuStatus::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

/// One telemetry sample for a device.
#[derive(Debug, Clone, Serialize)]
pub struct GpuTelemetry {
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_percent: u8,
    pub temperature_c: u8,
}

/// Telemetry source. Implementations wrap NVML or a mock.
pub trait GpuProbe: Send + Sync {
    /// Device indices present on this host.
    fn detect(&self) -> Vec<GpuId>;

    /// Samples one device. Errors are suppressed by the manager.
    fn probe(&self, gpu: GpuId) -> Result<GpuTelemetry, String>;
}

/// Deterministic probe for tests and GPU-less hosts.
#[derive(Debug)]
pub struct MockProbe {
    devices: StdMutex<Vec<(GpuId, GpuTelemetry)>>,
}

impl MockProbe {
    /// `count` identical 24 GiB devices.
    pub fn new(count: u32) -> Self {
        let devices = (0..count)
            .map(|id| {
                (
                    id,
                    GpuTelemetry {
                        name: format!("Mock GPU {id}"),
                        memory_total_mb: 24_000,
                        memory_used_mb: 2_000,
                        memory_free_mb: 22_000,
                        utilization_percent: 0,
                        temperature_c: 40,
                    },
                )
            })
            .collect();
        Self {
            devices: StdMutex::new(devices),
        }
    }

    /// Overrides the free/used memory reading of one device.
    pub fn set_memory_free(&self, gpu: GpuId, memory_free_mb: u64) {
        let mut devices = self.devices.lock().expect("mock probe poisoned");
        if let Some((_, telemetry)) = devices.iter_mut().find(|(id, _)| *id == gpu) {
            telemetry.memory_free_mb = memory_free_mb;
            telemetry.memory_used_mb = telemetry.memory_total_mb.saturating_sub(memory_free_mb);
        }
    }

    /// Overrides the temperature reading of one device.
    pub fn set_temperature(&self, gpu: GpuId, temperature_c: u8) {
        let mut devices = self.devices.lock().expect("mock probe poisoned");
        if let Some((_, telemetry)) = devices.iter_mut().find(|(id, _)| *id == gpu) {
            telemetry.temperature_c = temperature_c;
        }
    }
}

impl GpuProbe for MockProbe {
    fn detect(&self) -> Vec<GpuId> {
        self.devices
            .lock()
            .expect("mock probe poisoned")
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    fn probe(&self, gpu: GpuId) -> Result<GpuTelemetry, String> {
        self.devices
            .lock()
            .expect("mock probe poisoned")
            .iter()
            .find(|(id, _)| *id == gpu)
            .map(|(_, telemetry)| telemetry.clone())
            .ok_or_else(|| format!("no such device: {gpu}"))
    }
}

/// Snapshot of one device.
#[derive(Debug, Clone, Serialize)]
pub struct GpuState {
    pub id: GpuId,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_percent: u8,
    pub temperature_c: u8,
    pub status: GpuStatus,
    pub current_task_id: Option<TaskId>,
    /// Resident models, oldest first (advisory LRU).
    pub loaded_models: Vec<String>,
    /// Seconds since the epoch of the last release.
    pub last_task_completed_at: Option<f64>,
    pub error_message: Option<String>,
}

impl GpuState {
    fn new(id: GpuId, telemetry: GpuTelemetry) -> Self {
        Self {
            id,
            name: telemetry.name,
            memory_total_mb: telemetry.memory_total_mb,
            memory_used_mb: telemetry.memory_used_mb,
            memory_free_mb: telemetry.memory_free_mb,
            utilization_percent: telemetry.utilization_percent,
            temperature_c: telemetry.temperature_c,
            status: GpuStatus::Free,
            current_task_id: None,
            loaded_models: Vec::new(),
            last_task_completed_at: None,
            error_message: None,
        }
    }

    fn apply(&mut self, telemetry: GpuTelemetry) {
        self.name = telemetry.name;
        self.memory_total_mb = telemetry.memory_total_mb;
        self.memory_used_mb = telemetry.memory_used_mb;
        self.memory_free_mb = telemetry.memory_free_mb;
        self.utilization_percent = telemetry.utilization_percent;
        self.temperature_c = telemetry.temperature_c;
    }

    /// Whether the device can take a new task.
    pub fn is_available(&self) -> bool {
        self.status == GpuStatus::Free
    }
}

/// Fleet-level snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSummary {
    pub total_gpus: usize,
    pub free_gpus: usize,
    pub busy_gpus: usize,
    pub error_gpus: usize,
    pub reserved_gpus: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub gpus: Vec<GpuState>,
}

struct Device {
    id: GpuId,
    state: Mutex<GpuState>,
}

/// Authoritative per-GPU state and allocation gate.
pub struct GpuManager {
    devices: Vec<Device>,
    max_models_per_gpu: usize,
    memory_safety_margin_mb: u64,
    probe: Arc<dyn GpuProbe>,
}

impl GpuManager {
    /// Builds states for every probed (or listed) device. Devices in
    /// `reserved` never participate in scheduling.
    pub fn new(
        probe: Arc<dyn GpuProbe>,
        gpu_ids: Option<Vec<GpuId>>,
        reserved: &[GpuId],
        max_models_per_gpu: usize,
        memory_safety_margin_mb: u64,
    ) -> Self {
        let mut ids = gpu_ids.unwrap_or_else(|| probe.detect());
        ids.sort_unstable();
        ids.dedup();

        let devices = ids
            .into_iter()
            .map(|id| {
                let telemetry = probe.probe(id).unwrap_or_else(|err| {
                    warn!(gpu_id = id, error = %err, "gpu_init_probe_failed");
                    GpuTelemetry {
                        name: format!("GPU {id}"),
                        memory_total_mb: 0,
                        memory_used_mb: 0,
                        memory_free_mb: 0,
                        utilization_percent: 0,
                        temperature_c: 0,
                    }
                });
                let mut state = GpuState::new(id, telemetry);
                if reserved.contains(&id) {
                    state.status = GpuStatus::Reserved;
                }
                Device {
                    id,
                    state: Mutex::new(state),
                }
            })
            .collect::<Vec<_>>();

        info!(gpu_count = devices.len(), "gpu_manager_initialized");
        Self {
            devices,
            max_models_per_gpu,
            memory_safety_margin_mb,
            probe,
        }
    }

    fn device(&self, gpu: GpuId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == gpu)
    }

    /// All managed device indices, ascending.
    pub fn ids(&self) -> Vec<GpuId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    /// Device indices that participate in scheduling.
    pub async fn schedulable_ids(&self) -> Vec<GpuId> {
        let mut out = Vec::new();
        for device in &self.devices {
            if device.state.lock().await.status != GpuStatus::Reserved {
                out.push(device.id);
            }
        }
        out
    }

    /// Samples telemetry into every device, keeping last-known values on
    /// probe failure. Never blocks allocation beyond the per-device locks.
    pub async fn refresh_states(&self) {
        for device in &self.devices {
            match self.probe.probe(device.id) {
                Ok(telemetry) => device.state.lock().await.apply(telemetry),
                Err(err) => warn!(gpu_id = device.id, error = %err, "gpu_refresh_failed"),
            }
        }
    }

    /// Devices currently `Free`, ascending index.
    pub async fn free_gpus(&self) -> Vec<GpuId> {
        let mut out = Vec::new();
        for device in &self.devices {
            if device.state.lock().await.is_available() {
                out.push(device.id);
            }
        }
        out
    }

    /// First free device whose LRU contains `model_name`.
    pub async fn gpu_with_model(&self, model_name: &str) -> Option<GpuId> {
        for device in &self.devices {
            let state = device.state.lock().await;
            if state.is_available() && state.loaded_models.iter().any(|m| m == model_name) {
                return Some(device.id);
            }
        }
        None
    }

    /// `Free -> Busy` under the device lock. Returns false if the device is
    /// unknown or not free; exactly one caller wins any given edge.
    pub async fn allocate(&self, gpu: GpuId, task_id: TaskId) -> bool {
        let Some(device) = self.device(gpu) else {
            warn!(gpu_id = gpu, "invalid_gpu_id");
            return false;
        };
        let mut state = device.state.lock().await;
        if !state.is_available() {
            warn!(gpu_id = gpu, status = %state.status, "gpu_not_available");
            return false;
        }
        state.status = GpuStatus::Busy;
        state.current_task_id = Some(task_id);
        info!(gpu_id = gpu, task_id = %task_id, "gpu_allocated");
        true
    }

    /// `Busy -> Free`, clears the current task, stamps the completion time.
    pub async fn release(&self, gpu: GpuId) {
        let Some(device) = self.device(gpu) else {
            return;
        };
        let mut state = device.state.lock().await;
        let released = state.current_task_id.take();
        if state.status == GpuStatus::Busy {
            state.status = GpuStatus::Free;
        }
        state.last_task_completed_at = Some(epoch_seconds());
        info!(gpu_id = gpu, released_task_id = ?released.map(|id| id.to_string()), "gpu_released");
    }

    /// Marks the device errored after a calculator or driver failure.
    pub async fn mark_error(&self, gpu: GpuId, message: impl Into<String>) {
        let Some(device) = self.device(gpu) else {
            return;
        };
        let message = message.into();
        let mut state = device.state.lock().await;
        state.status = GpuStatus::Error;
        state.error_message = Some(message.clone());
        error!(gpu_id = gpu, error = %message, "gpu_marked_error");
    }

    /// Attempts recovery: a successful probe restores the device to `Free`.
    pub async fn recover(&self, gpu: GpuId) -> bool {
        let Some(device) = self.device(gpu) else {
            return false;
        };
        let mut state = device.state.lock().await;
        if state.status != GpuStatus::Error {
            return true;
        }
        match self.probe.probe(gpu) {
            Ok(telemetry) => {
                state.apply(telemetry);
                state.status = GpuStatus::Free;
                state.error_message = None;
                state.current_task_id = None;
                info!(gpu_id = gpu, "gpu_recovered");
                true
            }
            Err(err) => {
                warn!(gpu_id = gpu, error = %err, "gpu_recovery_failed");
                false
            }
        }
    }

    /// Appends a model to the device LRU, evicting the oldest entry at
    /// capacity. Returns the evicted model name, if any. Residency is
    /// advisory: it feeds affinity scoring only.
    pub async fn add_loaded_model(&self, gpu: GpuId, model_name: &str) -> Option<String> {
        let device = self.device(gpu)?;
        let mut state = device.state.lock().await;
        if state.loaded_models.iter().any(|m| m == model_name) {
            return None;
        }
        let evicted = if state.loaded_models.len() >= self.max_models_per_gpu {
            let oldest = state.loaded_models.remove(0);
            info!(gpu_id = gpu, model = %oldest, "model_evicted_from_cache");
            Some(oldest)
        } else {
            None
        };
        state.loaded_models.push(model_name.to_string());
        info!(gpu_id = gpu, model = %model_name, "model_added_to_cache");
        evicted
    }

    /// Removes a model from the device LRU.
    pub async fn remove_loaded_model(&self, gpu: GpuId, model_name: &str) {
        if let Some(device) = self.device(gpu) {
            let mut state = device.state.lock().await;
            state.loaded_models.retain(|m| m != model_name);
        }
    }

    /// Memory gate: free memory minus the safety margin must cover the
    /// requirement.
    pub async fn check_memory_available(&self, gpu: GpuId, required_mb: u64) -> bool {
        let Some(device) = self.device(gpu) else {
            return false;
        };
        let state = device.state.lock().await;
        state
            .memory_free_mb
            .saturating_sub(self.memory_safety_margin_mb)
            >= required_mb
    }

    /// Snapshot of one device.
    pub async fn state(&self, gpu: GpuId) -> Option<GpuState> {
        let device = self.device(gpu)?;
        Some(device.state.lock().await.clone())
    }

    /// Snapshots of all devices, ascending index.
    pub async fn all_states(&self) -> Vec<GpuState> {
        let mut out = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            out.push(device.state.lock().await.clone());
        }
        out
    }

    /// Fleet summary for admin and alert consumers.
    pub async fn summary(&self) -> GpuSummary {
        let gpus = self.all_states().await;
        let count = |status: GpuStatus| gpus.iter().filter(|g| g.status == status).count();
        let total_memory_mb = gpus.iter().map(|g| g.memory_total_mb).sum::<u64>();
        let used_memory_mb = gpus.iter().map(|g| g.memory_used_mb).sum::<u64>();
        GpuSummary {
            total_gpus: gpus.len(),
            free_gpus: count(GpuStatus::Free),
            busy_gpus: count(GpuStatus::Busy),
            error_gpus: count(GpuStatus::Error),
            reserved_gpus: count(GpuStatus::Reserved),
            total_memory_mb,
            used_memory_mb,
            free_memory_mb: total_memory_mb.saturating_sub(used_memory_mb),
            gpus,
        }
    }

    /// Per-GPU resident-model cache capacity.
    pub fn max_models_per_gpu(&self) -> usize {
        self.max_models_per_gpu
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(count: u32) -> GpuManager {
        GpuManager::new(Arc::new(MockProbe::new(count)), None, &[], 2, 2048)
    }

    #[tokio::test]
    async fn test_allocate_release_cycle() {
        let gm = manager(1);
        let task = TaskId::new();

        assert!(gm.allocate(0, task).await);
        let state = gm.state(0).await.unwrap();
        assert_eq!(state.status, GpuStatus::Busy);
        assert_eq!(state.current_task_id, Some(task));

        // Second allocation must lose the race.
        assert!(!gm.allocate(0, TaskId::new()).await);

        gm.release(0).await;
        let state = gm.state(0).await.unwrap();
        assert_eq!(state.status, GpuStatus::Free);
        assert!(state.current_task_id.is_none());
        assert!(state.last_task_completed_at.is_some());
    }

    #[tokio::test]
    async fn test_reserved_gpu_never_allocates() {
        let gm = GpuManager::new(Arc::new(MockProbe::new(2)), None, &[1], 2, 2048);
        assert_eq!(gm.free_gpus().await, vec![0]);
        assert!(!gm.allocate(1, TaskId::new()).await);
        assert_eq!(gm.schedulable_ids().await, vec![0]);
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let gm = manager(1);
        assert_eq!(gm.add_loaded_model(0, "a").await, None);
        assert_eq!(gm.add_loaded_model(0, "b").await, None);
        // Re-adding a resident model is a no-op.
        assert_eq!(gm.add_loaded_model(0, "a").await, None);
        // Third model evicts the head.
        assert_eq!(gm.add_loaded_model(0, "c").await, Some("a".to_string()));
        let state = gm.state(0).await.unwrap();
        assert_eq!(state.loaded_models, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_gate_honors_safety_margin() {
        let gm = manager(1);
        // 22000 free - 2048 margin = 19952 usable.
        assert!(gm.check_memory_available(0, 19_000).await);
        assert!(!gm.check_memory_available(0, 20_000).await);
        assert!(!gm.check_memory_available(9, 1).await);
    }

    #[tokio::test]
    async fn test_refresh_keeps_last_known_on_failure() {
        let probe = MockProbe::new(1);
        probe.set_memory_free(0, 10_000);
        let gm = GpuManager::new(Arc::new(probe), Some(vec![0, 7]), &[], 2, 2048);

        // Device 7 does not exist in the probe; init warns and zeroes it,
        // refresh leaves it untouched.
        gm.refresh_states().await;
        let state = gm.state(0).await.unwrap();
        assert_eq!(state.memory_free_mb, 10_000);
        let ghost = gm.state(7).await.unwrap();
        assert_eq!(ghost.memory_total_mb, 0);
    }

    #[tokio::test]
    async fn test_error_and_recover() {
        let gm = manager(1);
        gm.mark_error(0, "CUDA out of memory").await;
        assert_eq!(gm.state(0).await.unwrap().status, GpuStatus::Error);
        assert!(gm.free_gpus().await.is_empty());

        assert!(gm.recover(0).await);
        let state = gm.state(0).await.unwrap();
        assert_eq!(state.status, GpuStatus::Free);
        assert!(state.error_message.is_none());
    }

    #[tokio::test]
    async fn test_gpu_with_model_requires_free() {
        let gm = manager(2);
        gm.add_loaded_model(1, "orb-v2").await;
        assert_eq!(gm.gpu_with_model("orb-v2").await, Some(1));

        gm.allocate(1, TaskId::new()).await;
        assert_eq!(gm.gpu_with_model("orb-v2").await, None);
    }
}
