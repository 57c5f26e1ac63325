//! Priority queue with FIFO-per-priority ordering.
//!
//! Entries are keyed by a numeric score, `priority_rank * 1e12 +
//! enqueue_seconds`; the least score dequeues first, so one ordered
//! structure yields both priority ordering and FIFO within a priority.
//! Internally the ordering key also carries a monotonic sequence number so
//! two enqueues landing on the same timestamp cannot reorder.

use indexmap::IndexMap;
use matsched_core::{TaskId, TaskPriority};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Weight separating priority ranks in the composite score.
const PRIORITY_WEIGHT: f64 = 1e12;

/// Ordering key: rank first, then enqueue time, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScoreKey {
    rank: u8,
    enqueued_us: u64,
    seq: u64,
}

/// A queued task, as reported by `peek`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    /// Enqueue time, seconds since the epoch.
    pub enqueued_at: f64,
    /// Composite ordering score; smaller dequeues first.
    pub score: f64,
    /// 0-based rank in the queue.
    pub position: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    ordered: BTreeMap<ScoreKey, TaskId>,
    index: FxHashMap<TaskId, ScoreKey>,
    seq: u64,
}

/// Concurrent priority queue of waiting task ids.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn now_us() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }

    fn score_of(key: &ScoreKey) -> f64 {
        key.rank as f64 * PRIORITY_WEIGHT + key.enqueued_us as f64 / 1e6
    }

    /// Inserts a task and returns its score.
    pub async fn enqueue(&self, task_id: TaskId, priority: TaskPriority) -> f64 {
        let mut state = self.state.lock().await;
        state.seq += 1;
        let key = ScoreKey {
            rank: priority.rank(),
            enqueued_us: Self::now_us(),
            seq: state.seq,
        };
        state.ordered.insert(key, task_id);
        state.index.insert(task_id, key);
        let score = Self::score_of(&key);
        info!(
            task_id = %task_id,
            priority = %priority,
            score,
            queue_size = state.ordered.len(),
            "task_enqueued"
        );
        score
    }

    /// Removes and returns the least-score entry.
    pub async fn dequeue(&self) -> Option<TaskId> {
        let mut state = self.state.lock().await;
        let key = *state.ordered.keys().next()?;
        let task_id = state.ordered.remove(&key)?;
        state.index.remove(&task_id);
        info!(task_id = %task_id, queue_size = state.ordered.len(), "task_dequeued");
        Some(task_id)
    }

    /// Returns the head without removing it.
    pub async fn peek_first(&self) -> Option<TaskId> {
        let state = self.state.lock().await;
        state.ordered.values().next().copied()
    }

    /// Returns up to `count` entries in dequeue order.
    pub async fn peek(&self, count: usize) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        state
            .ordered
            .iter()
            .take(count)
            .enumerate()
            .map(|(position, (key, task_id))| QueueEntry {
                task_id: *task_id,
                priority: TaskPriority::from_rank(key.rank),
                enqueued_at: key.enqueued_us as f64 / 1e6,
                score: Self::score_of(key),
                position,
            })
            .collect()
    }

    /// Removes a task, returning whether it was present.
    pub async fn remove(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        match state.index.remove(&task_id) {
            Some(key) => {
                state.ordered.remove(&key);
                debug!(task_id = %task_id, "task_removed_from_queue");
                true
            }
            None => false,
        }
    }

    /// 0-based position of a task, if queued.
    pub async fn position(&self, task_id: TaskId) -> Option<usize> {
        let state = self.state.lock().await;
        let key = *state.index.get(&task_id)?;
        Some(state.ordered.range(..key).count())
    }

    /// Number of queued entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ordered.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entry counts per priority, all priorities present.
    pub async fn len_by_priority(&self) -> IndexMap<TaskPriority, usize> {
        let state = self.state.lock().await;
        let mut counts: IndexMap<TaskPriority, usize> =
            TaskPriority::ALL.iter().map(|p| (*p, 0)).collect();
        for key in state.ordered.keys() {
            *counts
                .entry(TaskPriority::from_rank(key.rank))
                .or_default() += 1;
        }
        counts
    }

    /// Seconds a task has been waiting, if queued.
    pub async fn wait_time(&self, task_id: TaskId) -> Option<f64> {
        let state = self.state.lock().await;
        let key = state.index.get(&task_id)?;
        Some((Self::now_us().saturating_sub(key.enqueued_us)) as f64 / 1e6)
    }

    /// Moves a task to a new priority, preserving its enqueue time.
    pub async fn reprioritize(&self, task_id: TaskId, priority: TaskPriority) -> bool {
        let mut state = self.state.lock().await;
        let Some(old_key) = state.index.get(&task_id).copied() else {
            return false;
        };
        let new_key = ScoreKey {
            rank: priority.rank(),
            ..old_key
        };
        state.ordered.remove(&old_key);
        state.ordered.insert(new_key, task_id);
        state.index.insert(task_id, new_key);
        info!(
            task_id = %task_id,
            new_priority = %priority,
            old_score = Self::score_of(&old_key),
            new_score = Self::score_of(&new_key),
            "task_reprioritized"
        );
        true
    }

    /// Drops everything, returning the number of removed entries.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.ordered.len();
        state.ordered.clear();
        state.index.clear();
        count
    }
}
