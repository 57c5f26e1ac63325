//! Worker liveness registry.
//!
//! Workers register once, then heartbeat at least every
//! `heartbeat_interval`. The monitor loop marks a worker `Offline` when its
//! heartbeat is older than `heartbeat_timeout` and reports it on the lost
//! channel so the owner can fail the in-flight task and release the device.
//! Registration, deregistration, and heartbeat are idempotent.

use matsched_core::{CancelToken, GpuId, TaskId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    /// Whether the worker still counts toward capacity.
    pub fn is_alive(&self) -> bool {
        !matches!(self, WorkerStatus::Offline | WorkerStatus::Error)
    }
}

/// Registry entry for one worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub gpu_id: GpuId,
    pub hostname: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: Instant,
    pub started_at: Instant,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Serializable view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub gpu_id: GpuId,
    pub hostname: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub seconds_since_heartbeat: f64,
    pub uptime_seconds: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl WorkerInfo {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            gpu_id: self.gpu_id,
            hostname: self.hostname.clone(),
            pid: self.pid,
            status: self.status,
            current_task_id: self.current_task_id,
            seconds_since_heartbeat: self.last_heartbeat.elapsed().as_secs_f64(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
        }
    }
}

/// Notification that a worker stopped heartbeating.
#[derive(Debug, Clone)]
pub struct WorkerLost {
    pub worker_id: String,
    pub gpu_id: GpuId,
    /// Task that was in flight when the worker went dark, if any.
    pub task_id: Option<TaskId>,
}

/// Registry summary.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub total_workers: usize,
    pub active_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
}

/// Heartbeat tracker for the worker pool.
pub struct WorkerManager {
    workers: RwLock<FxHashMap<String, WorkerInfo>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    lost_tx: mpsc::Sender<WorkerLost>,
}

impl WorkerManager {
    /// Creates the manager and the channel carrying lost-worker events.
    pub fn new(
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> (Self, mpsc::Receiver<WorkerLost>) {
        let (lost_tx, lost_rx) = mpsc::channel(64);
        (
            Self {
                workers: RwLock::new(FxHashMap::default()),
                heartbeat_interval,
                heartbeat_timeout,
                lost_tx,
            },
            lost_rx,
        )
    }

    /// Registers (or re-registers) a worker as `Running`.
    pub async fn register(
        &self,
        worker_id: impl Into<String>,
        gpu_id: GpuId,
        hostname: impl Into<String>,
        pid: Option<u32>,
    ) {
        let worker_id = worker_id.into();
        let hostname = hostname.into();
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        workers.insert(
            worker_id.clone(),
            WorkerInfo {
                worker_id: worker_id.clone(),
                gpu_id,
                hostname: hostname.clone(),
                pid,
                status: WorkerStatus::Running,
                current_task_id: None,
                last_heartbeat: now,
                started_at: now,
                tasks_completed: 0,
                tasks_failed: 0,
            },
        );
        info!(worker_id = %worker_id, gpu_id, hostname = %hostname, "worker_registered");
    }

    /// Removes a worker. Unknown ids are ignored.
    pub async fn deregister(&self, worker_id: &str) {
        if self.workers.write().await.remove(worker_id).is_some() {
            info!(worker_id = %worker_id, "worker_deregistered");
        }
    }

    /// Refreshes a worker's heartbeat. Returns false for unknown workers.
    pub async fn heartbeat(&self, worker_id: &str) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(info) => {
                info.last_heartbeat = Instant::now();
                if info.status == WorkerStatus::Offline {
                    info.status = WorkerStatus::Idle;
                    info!(worker_id = %worker_id, "worker_recovered");
                }
                true
            }
            None => false,
        }
    }

    /// Marks a worker busy on a task.
    pub async fn set_busy(&self, worker_id: &str, task_id: TaskId) {
        let mut workers = self.workers.write().await;
        if let Some(info) = workers.get_mut(worker_id) {
            info.status = WorkerStatus::Busy;
            info.current_task_id = Some(task_id);
            info.last_heartbeat = Instant::now();
        }
    }

    /// Marks a worker idle after a task, bumping the outcome counter.
    pub async fn set_idle(&self, worker_id: &str, task_succeeded: bool) {
        let mut workers = self.workers.write().await;
        if let Some(info) = workers.get_mut(worker_id) {
            info.status = WorkerStatus::Idle;
            info.current_task_id = None;
            info.last_heartbeat = Instant::now();
            if task_succeeded {
                info.tasks_completed += 1;
            } else {
                info.tasks_failed += 1;
            }
        }
    }

    /// Fetches one worker snapshot.
    pub async fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(WorkerInfo::snapshot)
    }

    /// Number of workers that still count toward capacity.
    pub async fn active_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status.is_alive())
            .count()
    }

    /// Registry summary for the admin surface.
    pub async fn summary(&self) -> WorkerSummary {
        let workers = self.workers.read().await;
        let snapshots: Vec<WorkerSnapshot> = workers.values().map(WorkerInfo::snapshot).collect();
        WorkerSummary {
            total_workers: snapshots.len(),
            active_workers: snapshots.iter().filter(|w| w.status.is_alive()).count(),
            workers: snapshots,
        }
    }

    /// One timeout sweep. Returns the workers newly marked offline.
    pub async fn check_once(&self) -> Vec<WorkerLost> {
        let mut lost = Vec::new();
        let mut workers = self.workers.write().await;
        for info in workers.values_mut() {
            if !info.status.is_alive() {
                continue;
            }
            if info.last_heartbeat.elapsed() > self.heartbeat_timeout {
                info.status = WorkerStatus::Offline;
                warn!(
                    worker_id = %info.worker_id,
                    gpu_id = info.gpu_id,
                    current_task_id = ?info.current_task_id.map(|id| id.to_string()),
                    "worker_timeout"
                );
                lost.push(WorkerLost {
                    worker_id: info.worker_id.clone(),
                    gpu_id: info.gpu_id,
                    task_id: info.current_task_id.take(),
                });
            }
        }
        drop(workers);

        for event in &lost {
            if self.lost_tx.send(event.clone()).await.is_err() {
                warn!("worker_lost_channel_closed");
                break;
            }
        }
        lost
    }

    /// Runs the monitor loop until the token trips.
    pub async fn run(&self, shutdown: CancelToken) {
        info!(
            interval_s = self.heartbeat_interval.as_secs(),
            timeout_s = self.heartbeat_timeout.as_secs(),
            "worker_monitor_started"
        );
        while !shutdown.is_cancelled() {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    self.check_once().await;
                }
                _ = shutdown.cancelled() => {}
            }
        }
        info!("worker_monitor_stopped");
    }
}

/// Conventional worker id for a device on this host.
pub fn worker_id_for(hostname: &str, gpu_id: GpuId) -> String {
    format!("worker-{hostname}-gpu-{gpu_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout_ms: u64) -> (WorkerManager, mpsc::Receiver<WorkerLost>) {
        WorkerManager::new(Duration::from_millis(10), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_register_heartbeat_idempotent() {
        let (wm, _rx) = manager(1000);
        wm.register("w-0", 0, "host", Some(42)).await;
        wm.register("w-0", 0, "host", Some(42)).await;

        assert!(wm.heartbeat("w-0").await);
        assert!(!wm.heartbeat("w-9").await);
        assert_eq!(wm.active_count().await, 1);

        wm.deregister("w-0").await;
        wm.deregister("w-0").await;
        assert_eq!(wm.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_offline_and_reports_task() {
        let (wm, mut rx) = manager(20);
        wm.register("w-0", 3, "host", None).await;
        let task = TaskId::new();
        wm.set_busy("w-0", task).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let lost = wm.check_once().await;
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].gpu_id, 3);
        assert_eq!(lost[0].task_id, Some(task));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.worker_id, "w-0");
        assert_eq!(wm.get("w-0").await.unwrap().status, WorkerStatus::Offline);
        assert_eq!(wm.active_count().await, 0);

        // Already offline workers are not reported twice.
        assert!(wm.check_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_revives_offline_worker() {
        let (wm, _rx) = manager(10);
        wm.register("w-0", 0, "host", None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        wm.check_once().await;
        assert_eq!(wm.get("w-0").await.unwrap().status, WorkerStatus::Offline);

        assert!(wm.heartbeat("w-0").await);
        assert_eq!(wm.get("w-0").await.unwrap().status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_counters_and_summary() {
        let (wm, _rx) = manager(1000);
        wm.register("w-0", 0, "host", None).await;
        let task = TaskId::new();
        wm.set_busy("w-0", task).await;
        wm.set_idle("w-0", true).await;
        wm.set_busy("w-0", TaskId::new()).await;
        wm.set_idle("w-0", false).await;

        let summary = wm.summary().await;
        assert_eq!(summary.total_workers, 1);
        assert_eq!(summary.active_workers, 1);
        assert_eq!(summary.workers[0].tasks_completed, 1);
        assert_eq!(summary.workers[0].tasks_failed, 1);
    }

    #[test]
    fn test_worker_id_convention() {
        assert_eq!(worker_id_for("node1", 2), "worker-node1-gpu-2");
    }
}
