//! Host-guest interaction-energy executor.
//!
//! Places a guest molecule from the gas library at candidate positions
//! (grid, random, or explicit), optionally relaxes the guest with the host
//! fixed, and reports `E_total - E_host - E_guest` for the best site along
//! with the top candidates.

use crate::atoms::{gas_molecule, Atoms, GAS_MOLECULES};
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::relax::fire_relax;
use crate::executors::Executor;
use matsched_core::TaskType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::info;

pub struct InteractionEnergyExecutor;

impl Executor for InteractionEnergyExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::InteractionEnergy
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("gas_molecule".into(), json!("CO2"));
        defaults.insert("positions".into(), json!("grid"));
        defaults.insert("n_grid_points".into(), json!([3, 3, 3]));
        defaults.insert("n_random_points".into(), json!(20));
        defaults.insert("specified_positions".into(), json!([]));
        defaults.insert("optimize_gas".into(), json!(true));
        defaults.insert("opt_fmax".into(), json!(0.05));
        defaults.insert("opt_steps".into(), json!(100));
        defaults.insert("min_distance".into(), json!(2.0));
        defaults.insert("top_k".into(), json!(10));
        defaults.insert("seed".into(), json!(42));
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let gas_name = ctx.param_str("gas_molecule", "CO2").to_string();
        let Some(gas) = gas_molecule(&gas_name) else {
            return Err(ExecError::Failed(format!(
                "unknown gas molecule: {gas_name} (available: {})",
                GAS_MOLECULES.join(", ")
            )));
        };

        let host = atoms.clone();
        info!(
            task_id = %ctx.task_id,
            n_host_atoms = host.len(),
            gas = %gas_name,
            "interaction_energy_start"
        );

        let e_host = calc.energy(&host)?;

        // Isolated guest in its vacuum box.
        let mut gas_isolated = gas.clone();
        gas_isolated.center();
        let e_gas = calc.energy(&gas_isolated)?;

        let candidates = generate_positions(&host, ctx)?;
        let min_distance = ctx.param_f64("min_distance", 2.0);
        let optimize_gas = ctx.param_bool("optimize_gas", true);

        let mut results: Vec<(f64, [f64; 3])> = Vec::new();
        let mut skipped = 0usize;

        for candidate in &candidates {
            ctx.checkpoint()?;

            let mut guest = gas.clone();
            let com = guest.center_of_mass();
            guest.translate([
                candidate[0] - com[0],
                candidate[1] - com[1],
                candidate[2] - com[2],
            ]);

            if too_close(&host, &guest, min_distance) {
                skipped += 1;
                continue;
            }

            let mut combined = host.clone();
            combined.extend(&guest);

            if optimize_gas {
                let mut frozen = vec![true; host.len()];
                frozen.extend(std::iter::repeat(false).take(guest.len()));
                fire_relax(
                    &mut combined,
                    calc,
                    ctx,
                    ctx.param_f64("opt_fmax", 0.05),
                    ctx.param_u64("opt_steps", 100),
                    Some(&frozen),
                )?;
            }

            let e_total = calc.energy(&combined)?;
            let e_interaction = e_total - e_host - e_gas;

            // Final guest centroid after relaxation.
            let guest_positions = &combined.positions()[host.len()..];
            let mut centroid = [0.0; 3];
            for position in guest_positions {
                for k in 0..3 {
                    centroid[k] += position[k] / guest_positions.len() as f64;
                }
            }
            results.push((e_interaction, centroid));
        }

        if results.is_empty() {
            return Err(ExecError::Failed(
                "no valid guest placement (all candidates violated the distance floor)".into(),
            ));
        }

        results.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_k = ctx.param_u64("top_k", 10) as usize;
        let best = results[0];

        info!(
            task_id = %ctx.task_id,
            e_interaction_eV = best.0,
            n_positions_scanned = results.len(),
            "interaction_energy_completed"
        );

        let mut data = Map::new();
        data.insert("E_host_eV".into(), json!(e_host));
        data.insert("E_gas_eV".into(), json!(e_gas));
        data.insert("E_interaction_eV".into(), json!(best.0));
        data.insert("best_position".into(), json!(best.1));
        data.insert("gas_molecule".into(), json!(gas_name));
        data.insert("n_positions_scanned".into(), json!(results.len()));
        data.insert("n_positions_skipped".into(), json!(skipped));
        data.insert(
            "top_results".into(),
            Value::Array(
                results
                    .iter()
                    .take(top_k)
                    .map(|(energy, position)| {
                        json!({"E_interaction_eV": energy, "position": position})
                    })
                    .collect(),
            ),
        );
        Ok(ExecOutcome::with_data(data))
    }
}

fn generate_positions(host: &Atoms, ctx: &ExecContext) -> Result<Vec<[f64; 3]>, ExecError> {
    let cell = host.cell();
    let cart = |frac: [f64; 3]| -> [f64; 3] {
        [
            frac[0] * cell[0][0] + frac[1] * cell[1][0] + frac[2] * cell[2][0],
            frac[0] * cell[0][1] + frac[1] * cell[1][1] + frac[2] * cell[2][1],
            frac[0] * cell[0][2] + frac[1] * cell[1][2] + frac[2] * cell[2][2],
        ]
    };

    match ctx.param_str("positions", "grid") {
        "grid" => {
            let dims = ctx
                .parameters
                .get("n_grid_points")
                .and_then(Value::as_array)
                .map(|values| {
                    let mut dims = [3usize; 3];
                    for (slot, value) in dims.iter_mut().zip(values) {
                        *slot = value.as_u64().unwrap_or(3).max(1) as usize;
                    }
                    dims
                })
                .unwrap_or([3, 3, 3]);
            let mut positions = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
            for i in 0..dims[0] {
                for j in 0..dims[1] {
                    for k in 0..dims[2] {
                        positions.push(cart([
                            (i as f64 + 0.5) / dims[0] as f64,
                            (j as f64 + 0.5) / dims[1] as f64,
                            (k as f64 + 0.5) / dims[2] as f64,
                        ]));
                    }
                }
            }
            Ok(positions)
        }
        "random" => {
            let count = ctx.param_u64("n_random_points", 20) as usize;
            let mut rng = StdRng::seed_from_u64(ctx.param_u64("seed", 42));
            Ok((0..count)
                .map(|_| cart([rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()]))
                .collect())
        }
        "specified" => {
            let positions = ctx
                .parameters
                .get("specified_positions")
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| {
                            let coords = entry.as_array()?;
                            if coords.len() != 3 {
                                return None;
                            }
                            Some([
                                coords[0].as_f64()?,
                                coords[1].as_f64()?,
                                coords[2].as_f64()?,
                            ])
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if positions.is_empty() {
                return Err(ExecError::Failed(
                    "positions = \"specified\" requires specified_positions".into(),
                ));
            }
            Ok(positions)
        }
        other => Err(ExecError::Failed(format!(
            "unknown position method: {other}"
        ))),
    }
}

fn too_close(host: &Atoms, guest: &Atoms, min_distance: f64) -> bool {
    let threshold = min_distance * min_distance;
    guest.positions().iter().any(|g| {
        host.positions().iter().any(|h| {
            let dx = g[0] - h[0];
            let dy = g[1] - h[1];
            let dz = g[2] - h[2];
            dx * dx + dy * dy + dz * dz < threshold
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::MockCalculator;
    use matsched_core::{CancelToken, TaskId};

    fn context(overrides: Map<String, Value>) -> ExecContext {
        let merged = crate::context::merge_parameters(
            InteractionEnergyExecutor.default_parameters(),
            &overrides,
        );
        ExecContext {
            task_id: TaskId::new(),
            task_type: TaskType::InteractionEnergy,
            model_name: "orb-v2".into(),
            gpu_id: 0,
            parameters: merged,
            cancel: CancelToken::new(),
        }
    }

    fn host() -> Atoms {
        Atoms::new(
            vec!["C".into(); 4],
            vec![
                [2.0, 2.0, 2.0],
                [10.0, 2.0, 2.0],
                [2.0, 10.0, 2.0],
                [2.0, 2.0, 10.0],
            ],
            [[12.0, 0.0, 0.0], [0.0, 12.0, 0.0], [0.0, 0.0, 12.0]],
        )
    }

    fn quick_params() -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("n_grid_points".into(), json!([2, 2, 2]));
        params.insert("optimize_gas".into(), json!(false));
        params.insert("gas_molecule".into(), json!("N2"));
        params
    }

    #[test]
    fn test_interaction_energy_scan() {
        let calc = MockCalculator::new();
        let mut atoms = host();
        let outcome = InteractionEnergyExecutor
            .run(&mut atoms, &calc, &context(quick_params()))
            .unwrap();

        let e_int = outcome.data["E_interaction_eV"].as_f64().unwrap();
        assert!(e_int.is_finite());
        let scanned = outcome.data["n_positions_scanned"].as_u64().unwrap();
        assert!(scanned >= 1 && scanned <= 8);
        let top = outcome.data["top_results"].as_array().unwrap();
        assert_eq!(top.len(), scanned as usize);
        // Top list is sorted ascending.
        let energies: Vec<f64> = top
            .iter()
            .map(|r| r["E_interaction_eV"].as_f64().unwrap())
            .collect();
        assert!(energies.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_unknown_gas_fails() {
        let calc = MockCalculator::new();
        let mut atoms = host();
        let mut params = quick_params();
        params.insert("gas_molecule".into(), json!("XeF6"));
        assert!(matches!(
            InteractionEnergyExecutor.run(&mut atoms, &calc, &context(params)),
            Err(ExecError::Failed(_))
        ));
    }

    #[test]
    fn test_specified_positions() {
        let calc = MockCalculator::new();
        let mut atoms = host();
        let mut params = quick_params();
        params.insert("positions".into(), json!("specified"));
        params.insert("specified_positions".into(), json!([[6.0, 6.0, 6.0]]));
        let outcome = InteractionEnergyExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();
        assert_eq!(outcome.data["n_positions_scanned"], json!(1));
    }

    #[test]
    fn test_random_positions_deterministic_by_seed() {
        let calc = MockCalculator::new();
        let mut params = quick_params();
        params.insert("positions".into(), json!("random"));
        params.insert("n_random_points".into(), json!(5));

        let mut a = host();
        let first = InteractionEnergyExecutor
            .run(&mut a, &calc, &context(params.clone()))
            .unwrap();
        let mut b = host();
        let second = InteractionEnergyExecutor
            .run(&mut b, &calc, &context(params))
            .unwrap();
        assert_eq!(
            first.data["E_interaction_eV"].as_f64().unwrap(),
            second.data["E_interaction_eV"].as_f64().unwrap()
        );
    }
}
