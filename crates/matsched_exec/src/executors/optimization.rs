//! Structure optimization executor.
//!
//! Full relaxation of positions and, unless disabled, the cell. Converges
//! when `max|force| <= fmax` (and the stress settles, with the cell filter
//! on) or the step budget runs out.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::relax::{fire_relax, relax_with_cell};
use crate::executors::Executor;
use matsched_core::TaskType;
use serde_json::{json, Map, Value};
use tracing::info;

pub struct OptimizationExecutor;

impl Executor for OptimizationExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Optimization
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("fmax".into(), json!(0.01));
        defaults.insert("steps".into(), json!(500));
        defaults.insert("optimizer".into(), json!("fire"));
        defaults.insert("filter".into(), json!("unit_cell"));
        defaults.insert("cell_step".into(), json!(5.0));
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let fmax = ctx.param_f64("fmax", 0.01);
        let steps = ctx.param_u64("steps", 500);
        let use_cell_filter = ctx.param_str("filter", "unit_cell") != "none";
        let cell_step = ctx.param_f64("cell_step", 5.0);

        let initial = atoms.clone();
        let initial_energy = calc.energy(atoms)?;
        let initial_volume = atoms.volume();

        info!(
            task_id = %ctx.task_id,
            n_atoms = atoms.len(),
            initial_energy,
            initial_volume,
            "optimization_start"
        );

        let report = if use_cell_filter {
            relax_with_cell(atoms, calc, ctx, fmax, steps, cell_step)?
        } else {
            fire_relax(atoms, calc, ctx, fmax, steps, None)?
        };

        let final_volume = atoms.volume();
        let volume_change_percent = if initial_volume > 0.0 {
            (final_volume - initial_volume) / initial_volume * 100.0
        } else {
            0.0
        };
        let params = atoms.cell_parameters();

        info!(
            task_id = %ctx.task_id,
            converged = report.converged,
            final_energy = report.final_energy,
            final_fmax = report.final_fmax,
            steps = report.steps,
            "optimization_completed"
        );

        let mut data = Map::new();
        data.insert("converged".into(), json!(report.converged));
        data.insert("final_energy_eV".into(), json!(report.final_energy));
        data.insert("initial_energy_eV".into(), json!(initial_energy));
        data.insert("final_fmax".into(), json!(report.final_fmax));
        data.insert("steps".into(), json!(report.steps));
        data.insert("initial_volume_A3".into(), json!(initial_volume));
        data.insert("final_volume_A3".into(), json!(final_volume));
        data.insert("volume_change_percent".into(), json!(volume_change_percent));
        data.insert(
            "cell_parameters".into(),
            json!({
                "a": params.a,
                "b": params.b,
                "c": params.c,
                "alpha": params.alpha,
                "beta": params.beta,
                "gamma": params.gamma,
            }),
        );
        data.insert("rmsd_from_initial".into(), json!(atoms.rmsd_from(&initial)));
        Ok(ExecOutcome::with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::MockCalculator;
    use matsched_core::{CancelToken, TaskId};

    fn context(parameters: Map<String, Value>) -> ExecContext {
        let defaults = OptimizationExecutor.default_parameters();
        let merged = crate::context::merge_parameters(defaults, &parameters);
        ExecContext {
            task_id: TaskId::new(),
            task_type: TaskType::Optimization,
            model_name: "orb-v2".into(),
            gpu_id: 0,
            parameters: merged,
            cancel: CancelToken::new(),
        }
    }

    fn cluster() -> Atoms {
        // Four atoms, slightly off their pair minima.
        Atoms::new(
            vec!["C".into(); 4],
            vec![
                [0.0, 0.0, 0.0],
                [3.1, 0.0, 0.0],
                [0.0, 3.1, 0.0],
                [3.1, 3.1, 0.0],
            ],
            [[30.0, 0.0, 0.0], [0.0, 30.0, 0.0], [0.0, 0.0, 30.0]],
        )
    }

    #[test]
    fn test_optimization_converges_and_reports() {
        let calc = MockCalculator::new();
        let mut atoms = cluster();
        let mut params = Map::new();
        params.insert("filter".into(), json!("none"));
        params.insert("fmax".into(), json!(0.001));
        let outcome = OptimizationExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();

        assert_eq!(outcome.data["converged"], json!(true));
        let final_energy = outcome.data["final_energy_eV"].as_f64().unwrap();
        let initial_energy = outcome.data["initial_energy_eV"].as_f64().unwrap();
        assert!(final_energy < initial_energy);
        assert!(outcome.data["rmsd_from_initial"].as_f64().unwrap() > 0.0);
        assert!(outcome.data["steps"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_step_budget_reports_unconverged() {
        let calc = MockCalculator::new();
        let mut atoms = cluster();
        let mut params = Map::new();
        params.insert("filter".into(), json!("none"));
        params.insert("fmax".into(), json!(1e-10));
        params.insert("steps".into(), json!(2));
        let outcome = OptimizationExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();
        assert_eq!(outcome.data["converged"], json!(false));
    }
}
