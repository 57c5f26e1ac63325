//! Single-point executor: one energy evaluation, optional forces and
//! stress. The input structure is never mutated.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::numeric::{max_force, rms_force, EV_A3_TO_GPA};
use crate::executors::Executor;
use matsched_core::TaskType;
use serde_json::{json, Map, Value};
use tracing::info;

pub struct SinglePointExecutor;

impl Executor for SinglePointExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::SinglePoint
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("compute_forces".into(), json!(true));
        defaults.insert("compute_stress".into(), json!(true));
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let energy = calc.energy(atoms)?;
        let n_atoms = atoms.len().max(1);

        let mut data = Map::new();
        data.insert("energy_eV".into(), json!(energy));
        data.insert("energy_per_atom_eV".into(), json!(energy / n_atoms as f64));
        data.insert("n_atoms".into(), json!(atoms.len()));
        data.insert("formula".into(), json!(atoms.formula()));
        data.insert("volume_A3".into(), json!(atoms.volume()));

        if ctx.param_bool("compute_forces", true) {
            ctx.checkpoint()?;
            let forces = calc.forces(atoms)?;
            data.insert(
                "forces".into(),
                json!({
                    "fmax_eV_A": max_force(&forces),
                    "frms_eV_A": rms_force(&forces),
                    "forces_array": forces,
                }),
            );
        }

        if ctx.param_bool("compute_stress", true) {
            ctx.checkpoint()?;
            let voigt = calc.stress(atoms)?;
            let voigt_gpa: Vec<f64> = voigt.iter().map(|s| s * EV_A3_TO_GPA).collect();
            let pressure_gpa = -(voigt_gpa[0] + voigt_gpa[1] + voigt_gpa[2]) / 3.0;
            data.insert(
                "stress".into(),
                json!({
                    "stress_voigt_GPa": voigt_gpa,
                    "pressure_GPa": pressure_gpa,
                }),
            );
        }

        let cell = atoms.cell_parameters();
        data.insert(
            "cell".into(),
            json!({
                "a": cell.a,
                "b": cell.b,
                "c": cell.c,
                "alpha": cell.alpha,
                "beta": cell.beta,
                "gamma": cell.gamma,
                "vectors": atoms.cell(),
            }),
        );

        info!(task_id = %ctx.task_id, energy_eV = energy, "single_point_completed");
        Ok(ExecOutcome::with_data(data))
    }
}
