//! Task lifecycle: the transition table and the timeout policy.
//!
//! All state logic is table-driven on [`TaskState`]; callers never mutate a
//! task's state without validating the edge here first.

use crate::error::{SchedError, SchedResult};
use crate::task::{TaskState, TaskType};

/// State-transition validator.
pub struct Lifecycle;

impl Lifecycle {
    /// Valid targets for a given state. Terminal states have none.
    pub fn valid_targets(from: TaskState) -> &'static [TaskState] {
        match from {
            TaskState::Pending => &[TaskState::Queued, TaskState::Cancelled, TaskState::Failed],
            TaskState::Queued => &[TaskState::Assigned, TaskState::Cancelled, TaskState::Failed],
            TaskState::Assigned => &[TaskState::Running, TaskState::Cancelled, TaskState::Failed],
            TaskState::Running => &[
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Cancelled,
                TaskState::Timeout,
            ],
            TaskState::Completed
            | TaskState::Failed
            | TaskState::Cancelled
            | TaskState::Timeout => &[],
        }
    }

    /// Whether `from -> to` is a legal edge.
    pub fn can_transition(from: TaskState, to: TaskState) -> bool {
        Self::valid_targets(from).contains(&to)
    }

    /// Validates `from -> to`, failing with `InvalidTransition` otherwise.
    pub fn validate_transition(from: TaskState, to: TaskState) -> SchedResult<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(SchedError::InvalidTransition { from, to })
        }
    }

    /// Whether the state accepts no outgoing edges.
    pub fn is_terminal(state: TaskState) -> bool {
        Self::valid_targets(state).is_empty()
    }

    /// Whether a task in this state may still be cancelled.
    pub fn can_cancel(state: TaskState) -> bool {
        matches!(
            state,
            TaskState::Pending | TaskState::Queued | TaskState::Assigned | TaskState::Running
        )
    }

    /// Whether the task still occupies the pipeline.
    pub fn is_active(state: TaskState) -> bool {
        !Self::is_terminal(state)
    }
}

/// Per-type timeout policy, seconds.
pub struct Timeouts;

impl Timeouts {
    /// Fallback for unknown overrides.
    pub const DEFAULT: u64 = 3600;

    /// Upper bound on any effective timeout (24 h).
    pub const MAX: u64 = 86_400;

    /// Default timeout for a task type.
    pub fn default_for(task_type: TaskType) -> u64 {
        match task_type {
            TaskType::Optimization => 1800,
            TaskType::Stability => 7200,
            TaskType::BulkModulus => 3600,
            TaskType::HeatCapacity => 7200,
            TaskType::InteractionEnergy => 1800,
            TaskType::SinglePoint => 600,
        }
    }

    /// Effective timeout: `min(custom, MAX)` when supplied, else the default.
    pub fn effective(task_type: TaskType, custom: Option<u64>) -> u64 {
        match custom {
            Some(seconds) => seconds.min(Self::MAX),
            None => Self::default_for(task_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [
            TaskState::Pending,
            TaskState::Queued,
            TaskState::Assigned,
            TaskState::Running,
            TaskState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(Lifecycle::can_transition(pair[0], pair[1]));
        }
    }

    #[test]
    fn test_terminal_states_are_closed() {
        for state in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
            TaskState::Timeout,
        ] {
            assert!(Lifecycle::is_terminal(state));
            assert!(Lifecycle::valid_targets(state).is_empty());
            assert!(!Lifecycle::can_cancel(state));
        }
    }

    #[test]
    fn test_invalid_edge_is_rejected() {
        let err = Lifecycle::validate_transition(TaskState::Completed, TaskState::Running)
            .unwrap_err();
        assert!(matches!(err, SchedError::InvalidTransition { .. }));
    }

    #[test]
    fn test_timeout_only_from_running() {
        assert!(Lifecycle::can_transition(TaskState::Running, TaskState::Timeout));
        assert!(!Lifecycle::can_transition(TaskState::Queued, TaskState::Timeout));
        assert!(!Lifecycle::can_transition(TaskState::Assigned, TaskState::Timeout));
    }

    #[test]
    fn test_timeout_table() {
        assert_eq!(Timeouts::default_for(TaskType::SinglePoint), 600);
        assert_eq!(Timeouts::default_for(TaskType::Stability), 7200);
        assert_eq!(Timeouts::effective(TaskType::Optimization, None), 1800);
        assert_eq!(Timeouts::effective(TaskType::Optimization, Some(60)), 60);
        assert_eq!(
            Timeouts::effective(TaskType::Optimization, Some(1_000_000)),
            Timeouts::MAX
        );
    }
}
