//! Bulk-modulus executor.
//!
//! Samples equally spaced volume strains, optionally relaxes positions at
//! fixed cell per point, then fits a Birch-Murnaghan equation of state to
//! the (V, E) samples.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::numeric::{quadratic_fit, EV_A3_TO_GPA};
use crate::executors::relax::fire_relax;
use crate::executors::Executor;
use matsched_core::TaskType;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

pub struct BulkModulusExecutor;

impl Executor for BulkModulusExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::BulkModulus
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("strain_range".into(), json!(0.06));
        defaults.insert("n_points".into(), json!(7));
        defaults.insert("optimize_atoms".into(), json!(true));
        defaults.insert("opt_fmax".into(), json!(0.01));
        defaults.insert("opt_steps".into(), json!(200));
        defaults.insert("eos_type".into(), json!("birch_murnaghan"));
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let strain_range = ctx.param_f64("strain_range", 0.06);
        let n_points = ctx.param_u64("n_points", 7).max(3) as usize;
        let optimize_atoms = ctx.param_bool("optimize_atoms", true);

        let original_cell = atoms.cell();
        let original_volume = atoms.volume();
        info!(
            task_id = %ctx.task_id,
            n_atoms = atoms.len(),
            original_volume,
            n_points,
            "bulk_modulus_start"
        );

        let mut volumes = Vec::with_capacity(n_points);
        let mut energies = Vec::with_capacity(n_points);
        let mut strain_results = Vec::with_capacity(n_points);

        for index in 0..n_points {
            ctx.checkpoint()?;
            let strain = -strain_range
                + 2.0 * strain_range * index as f64 / (n_points as f64 - 1.0);
            // Volume strain to isotropic length scale.
            let scale = (1.0 + strain).cbrt();
            let scaled_cell = [
                [
                    original_cell[0][0] * scale,
                    original_cell[0][1] * scale,
                    original_cell[0][2] * scale,
                ],
                [
                    original_cell[1][0] * scale,
                    original_cell[1][1] * scale,
                    original_cell[1][2] * scale,
                ],
                [
                    original_cell[2][0] * scale,
                    original_cell[2][1] * scale,
                    original_cell[2][2] * scale,
                ],
            ];

            let mut point = atoms.clone();
            point.set_cell(scaled_cell, true);
            let volume = point.volume();

            let (energy, fmax) = if optimize_atoms {
                let report = fire_relax(
                    &mut point,
                    calc,
                    ctx,
                    ctx.param_f64("opt_fmax", 0.01),
                    ctx.param_u64("opt_steps", 200),
                    None,
                )?;
                (report.final_energy, report.final_fmax)
            } else {
                (calc.energy(&point)?, 0.0)
            };

            volumes.push(volume);
            energies.push(energy);
            strain_results.push(json!({
                "strain": strain,
                "volume_A3": volume,
                "energy_eV": energy,
                "fmax": fmax,
            }));
        }

        let fit = fit_birch_murnaghan(&volumes, &energies);
        let mut data = Map::new();
        match fit {
            Some(fit) => {
                info!(
                    task_id = %ctx.task_id,
                    b0_gpa = fit.b0 * EV_A3_TO_GPA,
                    v0 = fit.v0,
                    "bulk_modulus_fit_success"
                );
                data.insert("fit_success".into(), json!(true));
                data.insert("B0_GPa".into(), json!(fit.b0 * EV_A3_TO_GPA));
                data.insert("V0_A3".into(), json!(fit.v0));
                data.insert("E0_eV".into(), json!(fit.e0));
                data.insert("Bp".into(), json!(fit.bp));
                data.insert("fit_error".into(), Value::Null);
            }
            None => {
                warn!(task_id = %ctx.task_id, "bulk_modulus_fit_failed");
                data.insert("fit_success".into(), json!(false));
                data.insert("B0_GPa".into(), Value::Null);
                data.insert("V0_A3".into(), Value::Null);
                data.insert("E0_eV".into(), Value::Null);
                data.insert("Bp".into(), Value::Null);
                data.insert(
                    "fit_error".into(),
                    json!("equation of state fit did not converge"),
                );
            }
        }
        data.insert("eos_type".into(), json!(ctx.param_str("eos_type", "birch_murnaghan")));
        data.insert("n_points".into(), json!(n_points));
        data.insert("strain_results".into(), Value::Array(strain_results));
        Ok(ExecOutcome::with_data(data))
    }
}

/// Birch-Murnaghan fit parameters; `b0` in eV/Å³.
#[derive(Debug, Clone, Copy)]
pub struct EosFit {
    pub e0: f64,
    pub v0: f64,
    pub b0: f64,
    pub bp: f64,
}

/// Third-order Birch-Murnaghan energy.
fn birch_murnaghan(v: f64, p: &[f64; 4]) -> f64 {
    let [e0, v0, b0, bp] = *p;
    let eta = (v0 / v).powf(2.0 / 3.0);
    e0 + 9.0 * v0 * b0 / 16.0
        * ((eta - 1.0).powi(3) * bp + (eta - 1.0).powi(2) * (6.0 - 4.0 * eta))
}

/// Levenberg-Marquardt least squares over (E0, V0, B0, B').
pub fn fit_birch_murnaghan(volumes: &[f64], energies: &[f64]) -> Option<EosFit> {
    if volumes.len() < 4 || volumes.len() != energies.len() {
        return None;
    }

    // Seed from a quadratic fit: B0 = V0 * d2E/dV2 at the minimum.
    let min_index = energies
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?
        .0;
    let [_, c1, c2] = quadratic_fit(volumes, energies)?;
    let v0_seed = if c2 > 0.0 {
        (-c1 / (2.0 * c2)).clamp(
            volumes.iter().cloned().fold(f64::INFINITY, f64::min),
            volumes.iter().cloned().fold(0.0, f64::max),
        )
    } else {
        volumes[min_index]
    };
    let b0_seed = (2.0 * c2 * v0_seed).max(1e-4);
    let mut params = [energies[min_index], v0_seed, b0_seed, 4.0];

    let residuals = |p: &[f64; 4]| -> Vec<f64> {
        volumes
            .iter()
            .zip(energies)
            .map(|(&v, &e)| birch_murnaghan(v, p) - e)
            .collect()
    };
    let cost = |r: &[f64]| -> f64 { r.iter().map(|x| x * x).sum() };

    let mut lambda = 1e-3;
    let mut current = residuals(&params);
    let mut current_cost = cost(&current);

    for _iter in 0..200 {
        // Numeric Jacobian.
        let mut jacobian = vec![[0.0_f64; 4]; volumes.len()];
        for k in 0..4 {
            let h = (params[k].abs() * 1e-6).max(1e-9);
            let mut bumped = params;
            bumped[k] += h;
            let r_plus = residuals(&bumped);
            for (row, (rp, r)) in jacobian.iter_mut().zip(r_plus.iter().zip(&current)) {
                row[k] = (rp - r) / h;
            }
        }

        // Normal equations with damping: (JtJ + λ diag) δ = -Jt r.
        let mut jtj = [[0.0_f64; 4]; 4];
        let mut jtr = [0.0_f64; 4];
        for (row, r) in jacobian.iter().zip(&current) {
            for a in 0..4 {
                jtr[a] += row[a] * r;
                for b in 0..4 {
                    jtj[a][b] += row[a] * row[b];
                }
            }
        }
        for (a, row) in jtj.iter_mut().enumerate() {
            row[a] *= 1.0 + lambda;
        }

        let Some(delta) = solve4(&jtj, &jtr) else {
            lambda *= 10.0;
            continue;
        };
        let mut trial = params;
        for k in 0..4 {
            trial[k] -= delta[k];
        }
        // Keep the fit physical.
        if trial[1] <= 0.0 || trial[2] <= 0.0 {
            lambda *= 10.0;
            continue;
        }

        let trial_residuals = residuals(&trial);
        let trial_cost = cost(&trial_residuals);
        if trial_cost < current_cost {
            let improvement = current_cost - trial_cost;
            params = trial;
            current = trial_residuals;
            current_cost = trial_cost;
            lambda = (lambda * 0.5).max(1e-12);
            if improvement < 1e-16 {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }

    if !params.iter().all(|p| p.is_finite()) {
        return None;
    }
    Some(EosFit {
        e0: params[0],
        v0: params[1],
        b0: params[2],
        bp: params[3],
    })
}

fn solve4(a: &[[f64; 4]; 4], b: &[f64; 4]) -> Option<[f64; 4]> {
    // Gaussian elimination with partial pivoting.
    let mut m = *a;
    let mut rhs = *b;
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in (col + 1)..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let mut sum = rhs[row];
        for k in (row + 1)..4 {
            sum -= m[row][k] * x[k];
        }
        x[row] = sum / m[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::MockCalculator;
    use matsched_core::{CancelToken, TaskId};

    fn context(overrides: Map<String, Value>) -> ExecContext {
        let merged =
            crate::context::merge_parameters(BulkModulusExecutor.default_parameters(), &overrides);
        ExecContext {
            task_id: TaskId::new(),
            task_type: TaskType::BulkModulus,
            model_name: "orb-v2".into(),
            gpu_id: 0,
            parameters: merged,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_fit_recovers_synthetic_eos() {
        let truth = [-10.0, 100.0, 0.5, 4.5];
        let volumes: Vec<f64> = (0..9).map(|i| 88.0 + 3.0 * i as f64).collect();
        let energies: Vec<f64> = volumes.iter().map(|&v| birch_murnaghan(v, &truth)).collect();

        let fit = fit_birch_murnaghan(&volumes, &energies).unwrap();
        assert!((fit.e0 - truth[0]).abs() < 1e-4);
        assert!((fit.v0 - truth[1]).abs() < 0.1);
        assert!((fit.b0 - truth[2]).abs() < 0.01);
        assert!((fit.bp - truth[3]).abs() < 0.3);
    }

    #[test]
    fn test_executor_produces_fit_over_lattice() {
        // A 2x2x2 cube of atoms near the pair-potential minimum spacing.
        let spacing = 2.5 * 2.0f64.powf(1.0 / 6.0);
        let mut symbols = Vec::new();
        let mut positions = Vec::new();
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..2 {
                    symbols.push("C".to_string());
                    positions.push([
                        i as f64 * spacing,
                        j as f64 * spacing,
                        k as f64 * spacing,
                    ]);
                }
            }
        }
        let a = 2.0 * spacing;
        let mut atoms = Atoms::new(symbols, positions, [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]]);

        let calc = MockCalculator::new();
        let mut params = Map::new();
        params.insert("optimize_atoms".into(), json!(false));
        let outcome = BulkModulusExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();

        assert_eq!(outcome.data["fit_success"], json!(true));
        assert_eq!(outcome.data["n_points"], json!(7));
        let b0 = outcome.data["B0_GPa"].as_f64().unwrap();
        assert!(b0.is_finite() && b0 > 0.0);
        assert_eq!(
            outcome.data["strain_results"].as_array().unwrap().len(),
            7
        );
    }

    #[test]
    fn test_cancellation_between_points() {
        let calc = MockCalculator::new();
        let mut atoms = Atoms::new(
            vec!["C".into(), "C".into()],
            vec![[0.0, 0.0, 0.0], [2.8, 0.0, 0.0]],
            [[6.0, 0.0, 0.0], [0.0, 6.0, 0.0], [0.0, 0.0, 6.0]],
        );
        let ctx = context(Map::new());
        ctx.cancel.cancel();
        assert!(matches!(
            BulkModulusExecutor.run(&mut atoms, &calc, &ctx),
            Err(ExecError::Cancelled)
        ));
    }
}
