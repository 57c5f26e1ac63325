//! Executor inputs and outputs.

use crate::calculator::CalcError;
use matsched_core::{CancelToken, GpuId, TaskId, TaskType};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an executor stopped without a result.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The cancellation token tripped at a checkpoint.
    #[error("cancelled")]
    Cancelled,

    /// The calculator raised.
    #[error(transparent)]
    Calculator(#[from] CalcError),

    /// Anything else: bad parameters, failed fit, missing guest molecule.
    #[error("{0}")]
    Failed(String),
}

/// Successful executor output.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Task-type-specific result map.
    pub data: Map<String, Value>,
    /// Logical name to path of any files the executor produced.
    pub output_files: Map<String, Value>,
}

impl ExecOutcome {
    /// Outcome carrying only a result map.
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            output_files: Map::new(),
        }
    }
}

/// Everything an executor sees besides the structure and the calculator.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub model_name: String,
    pub gpu_id: GpuId,
    /// Executor defaults merged with the caller's parameters (caller wins).
    pub parameters: Map<String, Value>,
    pub cancel: CancelToken,
}

impl ExecContext {
    /// Fails with `Cancelled` once the token has tripped. Executors call
    /// this between algorithmic steps.
    pub fn checkpoint(&self) -> Result<(), ExecError> {
        if self.cancel.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Float parameter with fallback.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.parameters.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Integer parameter with fallback.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.parameters.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Boolean parameter with fallback.
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.parameters.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// String parameter with fallback.
    pub fn param_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameters.get(key).and_then(Value::as_str).unwrap_or(default)
    }
}

/// Merges caller parameters over executor defaults; caller keys win,
/// unknown keys pass through untouched.
pub fn merge_parameters(
    defaults: Map<String, Value>,
    overrides: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = defaults;
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(parameters: Map<String, Value>) -> ExecContext {
        ExecContext {
            task_id: TaskId::new(),
            task_type: TaskType::SinglePoint,
            model_name: "orb-v2".into(),
            gpu_id: 0,
            parameters,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_param_accessors() {
        let mut params = Map::new();
        params.insert("fmax".into(), json!(0.05));
        params.insert("steps".into(), json!(100));
        params.insert("relax".into(), json!(false));
        let ctx = ctx(params);

        assert_eq!(ctx.param_f64("fmax", 0.01), 0.05);
        assert_eq!(ctx.param_u64("steps", 500), 100);
        assert!(!ctx.param_bool("relax", true));
        assert_eq!(ctx.param_str("optimizer", "fire"), "fire");
    }

    #[test]
    fn test_merge_caller_wins_unknown_pass() {
        let mut defaults = Map::new();
        defaults.insert("fmax".into(), json!(0.01));
        defaults.insert("steps".into(), json!(500));
        let mut overrides = Map::new();
        overrides.insert("fmax".into(), json!(0.1));
        overrides.insert("unknown_knob".into(), json!("x"));

        let merged = merge_parameters(defaults, &overrides);
        assert_eq!(merged["fmax"], json!(0.1));
        assert_eq!(merged["steps"], json!(500));
        assert_eq!(merged["unknown_knob"], json!("x"));
    }

    #[test]
    fn test_checkpoint_observes_token() {
        let ctx = ctx(Map::new());
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(ctx.checkpoint(), Err(ExecError::Cancelled)));
    }
}
