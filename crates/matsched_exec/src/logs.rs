//! Per-task structured logs.
//!
//! Workers append entries as a task moves through its lifecycle; consumers
//! query recent history per task or subscribe to the live feed. Buffers are
//! in-memory rings; the durable sink stays behind the logging boundary.

use chrono::{DateTime, Utc};
use matsched_core::{short_id, GpuId, TaskId};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Entry severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// One structured log line attached to a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogEntry {
    pub id: String,
    pub task_id: TaskId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub gpu_id: Option<GpuId>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Ring-buffered task log store with a live feed.
pub struct TaskLogService {
    buffers: Mutex<FxHashMap<TaskId, VecDeque<TaskLogEntry>>>,
    max_entries_per_task: usize,
    feed: broadcast::Sender<TaskLogEntry>,
}

impl Default for TaskLogService {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl TaskLogService {
    pub fn new(max_entries_per_task: usize) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            buffers: Mutex::new(FxHashMap::default()),
            max_entries_per_task: max_entries_per_task.max(1),
            feed,
        }
    }

    /// Appends an entry and pushes it to live subscribers.
    pub fn append(
        &self,
        task_id: TaskId,
        level: LogLevel,
        gpu_id: Option<GpuId>,
        message: impl Into<String>,
        extra: Map<String, Value>,
    ) -> TaskLogEntry {
        let entry = TaskLogEntry {
            id: short_id("log"),
            task_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
            gpu_id,
            extra,
        };
        {
            let mut buffers = self.buffers.lock().expect("log buffers poisoned");
            let buffer = buffers.entry(task_id).or_default();
            buffer.push_back(entry.clone());
            while buffer.len() > self.max_entries_per_task {
                buffer.pop_front();
            }
        }
        let _ = self.feed.send(entry.clone());
        entry
    }

    /// Recent entries for a task, oldest first, optionally filtered by a
    /// minimum level.
    pub fn get(
        &self,
        task_id: TaskId,
        min_level: Option<LogLevel>,
        limit: usize,
    ) -> Vec<TaskLogEntry> {
        let buffers = self.buffers.lock().expect("log buffers poisoned");
        let Some(buffer) = buffers.get(&task_id) else {
            return Vec::new();
        };
        let limit = if limit == 0 { buffer.len() } else { limit };
        let filtered: Vec<TaskLogEntry> = buffer
            .iter()
            .filter(|e| min_level.map_or(true, |min| e.level >= min))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Live feed of every appended entry; stream consumers filter by task
    /// id. (Transport-level concerns such as push heartbeats belong to the
    /// API surface, not here.)
    pub fn subscribe(&self) -> broadcast::Receiver<TaskLogEntry> {
        self.feed.subscribe()
    }

    /// Drops the buffer of a task, e.g. after retention expiry.
    pub fn clear_task(&self, task_id: TaskId) {
        self.buffers
            .lock()
            .expect("log buffers poisoned")
            .remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error >= LogLevel::Warning);
        assert!(LogLevel::Debug < LogLevel::Info);
    }

    #[test]
    fn test_append_get_with_filter_and_limit() {
        let logs = TaskLogService::new(100);
        let task = TaskId::new();
        logs.append(task, LogLevel::Debug, None, "dbg", Map::new());
        logs.append(task, LogLevel::Info, Some(0), "started", Map::new());
        logs.append(task, LogLevel::Error, Some(0), "boom", Map::new());

        let all = logs.get(task, None, 0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "dbg");

        let warnings_up = logs.get(task, Some(LogLevel::Warning), 0);
        assert_eq!(warnings_up.len(), 1);
        assert_eq!(warnings_up[0].message, "boom");

        let last_two = logs.get(task, None, 2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].message, "started");

        assert!(logs.get(TaskId::new(), None, 0).is_empty());
    }

    #[test]
    fn test_ring_buffer_caps_per_task() {
        let logs = TaskLogService::new(3);
        let task = TaskId::new();
        for i in 0..5 {
            logs.append(task, LogLevel::Info, None, format!("m{i}"), Map::new());
        }
        let entries = logs.get(task, None, 0);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "m2");
    }

    #[tokio::test]
    async fn test_live_feed() {
        let logs = TaskLogService::new(10);
        let mut feed = logs.subscribe();
        let task = TaskId::new();
        logs.append(task, LogLevel::Info, None, "hello", Map::new());

        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.task_id, task);
        assert_eq!(entry.message, "hello");
    }
}
