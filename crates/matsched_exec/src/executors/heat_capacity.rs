//! Phonon heat-capacity executor.
//!
//! Finite-displacement force constants on a supercell, mass-weighted into a
//! dynamical matrix whose eigenmodes (the supercell-folded phonon branches)
//! yield harmonic thermal properties. Reports Cv in both J/(mol·K), per
//! mole of unit cells, and kB/atom.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::numeric::{jacobi_eigenvalues, mode_cv_kb, PHONON_EV_FACTOR};
use crate::executors::relax::relax_with_cell;
use crate::executors::Executor;
use matsched_core::TaskType;
use serde_json::{json, Map, Value};
use tracing::info;

/// Gas constant (J/(mol·K)).
const R_J_MOL_K: f64 = 8.314_462_618;

/// Modes below this quantum (eV) are treated as acoustic and skipped.
const ACOUSTIC_FLOOR_EV: f64 = 1e-6;

pub struct HeatCapacityExecutor;

impl Executor for HeatCapacityExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::HeatCapacity
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("run_optimization".into(), json!(true));
        defaults.insert("opt_fmax".into(), json!(0.005));
        defaults.insert("opt_steps".into(), json!(1000));
        defaults.insert("supercell".into(), json!([2, 2, 2]));
        defaults.insert("displacement".into(), json!(0.01));
        defaults.insert("temperature".into(), json!(300.0));
        defaults.insert("temperature_range".into(), Value::Null);
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let supercell_dims = parse_supercell(ctx);
        let displacement = ctx.param_f64("displacement", 0.01);
        let n_primitive = atoms.len();

        info!(
            task_id = %ctx.task_id,
            n_atoms = n_primitive,
            supercell = ?supercell_dims,
            "heat_capacity_start"
        );

        if ctx.param_bool("run_optimization", true) {
            relax_with_cell(
                atoms,
                calc,
                ctx,
                ctx.param_f64("opt_fmax", 0.005),
                ctx.param_u64("opt_steps", 1000),
                5.0,
            )?;
        }

        let supercell = atoms.supercell(supercell_dims[0], supercell_dims[1], supercell_dims[2]);
        let n_super = supercell.len();
        let dof = 3 * n_super;

        // Force constants by central differences, one displacement per DOF.
        let mut force_constants = vec![vec![0.0_f64; dof]; dof];
        let mut n_displacements = 0usize;
        for atom in 0..n_super {
            for axis in 0..3 {
                ctx.checkpoint()?;
                let row = 3 * atom + axis;

                let mut plus = supercell.clone();
                plus.positions_mut()[atom][axis] += displacement;
                let forces_plus = calc.forces(&plus)?;

                let mut minus = supercell.clone();
                minus.positions_mut()[atom][axis] -= displacement;
                let forces_minus = calc.forces(&minus)?;

                for j in 0..n_super {
                    for beta in 0..3 {
                        // Phi = -dF/du.
                        force_constants[row][3 * j + beta] = -(forces_plus[j][beta]
                            - forces_minus[j][beta])
                            / (2.0 * displacement);
                    }
                }
                n_displacements += 2;
            }
        }

        // Symmetrize and enforce the acoustic sum rule on the diagonal blocks.
        for i in 0..dof {
            for j in (i + 1)..dof {
                let avg = 0.5 * (force_constants[i][j] + force_constants[j][i]);
                force_constants[i][j] = avg;
                force_constants[j][i] = avg;
            }
        }
        for atom in 0..n_super {
            for alpha in 0..3 {
                for beta in 0..3 {
                    let row = 3 * atom + alpha;
                    let mut off_sum = 0.0;
                    for j in 0..n_super {
                        if j != atom {
                            off_sum += force_constants[row][3 * j + beta];
                        }
                    }
                    force_constants[row][3 * atom + beta] = -off_sum;
                }
            }
        }

        // Mass-weighted dynamical matrix.
        let masses = supercell.masses();
        let mut dynamical = vec![vec![0.0_f64; dof]; dof];
        for i in 0..n_super {
            for j in 0..n_super {
                let weight = 1.0 / (masses[i] * masses[j]).sqrt();
                for alpha in 0..3 {
                    for beta in 0..3 {
                        dynamical[3 * i + alpha][3 * j + beta] =
                            force_constants[3 * i + alpha][3 * j + beta] * weight;
                    }
                }
            }
        }

        ctx.checkpoint()?;
        let eigenvalues = jacobi_eigenvalues(&dynamical);
        let mut quanta_ev = Vec::with_capacity(dof);
        let mut n_imaginary = 0usize;
        for lambda in eigenvalues {
            if lambda < -1e-8 {
                n_imaginary += 1;
                continue;
            }
            let quantum = PHONON_EV_FACTOR * lambda.max(0.0).sqrt();
            if quantum > ACOUSTIC_FLOOR_EV {
                quanta_ev.push(quantum);
            }
        }

        let temperatures = temperature_grid(ctx);
        let target_temperature = ctx.param_f64("temperature", 300.0);

        let cv_at = |t: f64| -> f64 {
            quanta_ev.iter().map(|&e| mode_cv_kb(e, t)).sum::<f64>() / n_super as f64
        };

        let thermal_properties = if temperatures.len() == 1 {
            let cv_kb = cv_at(temperatures[0]);
            json!({
                "temperature_K": temperatures[0],
                "Cv_kB_per_atom": cv_kb,
                "Cv_J_mol_K": cv_kb * n_primitive as f64 * R_J_MOL_K,
            })
        } else {
            let per_t: Vec<Value> = temperatures
                .iter()
                .map(|&t| {
                    let cv_kb = cv_at(t);
                    json!({
                        "temperature_K": t,
                        "Cv_kB_per_atom": cv_kb,
                        "Cv_J_mol_K": cv_kb * n_primitive as f64 * R_J_MOL_K,
                    })
                })
                .collect();
            Value::Array(per_t)
        };

        let cv_kb_per_atom = cv_at(target_temperature);
        let cv_j_mol_k = cv_kb_per_atom * n_primitive as f64 * R_J_MOL_K;

        info!(
            task_id = %ctx.task_id,
            temperature = target_temperature,
            cv_kb_per_atom,
            n_imaginary,
            "heat_capacity_completed"
        );

        let mut data = Map::new();
        data.insert("Cv_kB_per_atom".into(), json!(cv_kb_per_atom));
        data.insert("Cv_J_mol_K".into(), json!(cv_j_mol_k));
        data.insert("n_atoms".into(), json!(n_primitive));
        data.insert("supercell".into(), json!(supercell_dims));
        data.insert("n_displacements".into(), json!(n_displacements));
        data.insert("n_modes".into(), json!(quanta_ev.len()));
        data.insert("n_imaginary_modes".into(), json!(n_imaginary));
        data.insert("thermal_properties".into(), thermal_properties);
        Ok(ExecOutcome::with_data(data))
    }
}

fn parse_supercell(ctx: &ExecContext) -> [usize; 3] {
    let fallback = [2usize, 2, 2];
    match ctx.parameters.get("supercell").and_then(Value::as_array) {
        Some(values) if values.len() == 3 => {
            let mut dims = fallback;
            for (slot, value) in dims.iter_mut().zip(values) {
                *slot = value.as_u64().unwrap_or(2).max(1) as usize;
            }
            dims
        }
        _ => fallback,
    }
}

fn temperature_grid(ctx: &ExecContext) -> Vec<f64> {
    if let Some(range) = ctx
        .parameters
        .get("temperature_range")
        .and_then(Value::as_array)
    {
        if range.len() == 3 {
            let t_min = range[0].as_f64().unwrap_or(100.0);
            let t_max = range[1].as_f64().unwrap_or(500.0);
            let n = range[2].as_u64().unwrap_or(5).max(2) as usize;
            return (0..n)
                .map(|i| t_min + (t_max - t_min) * i as f64 / (n as f64 - 1.0))
                .collect();
        }
    }
    vec![ctx.param_f64("temperature", 300.0)]
}
