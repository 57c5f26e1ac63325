//! Molecular-dynamics stability executor.
//!
//! Optional pre-optimization, Langevin NVT equilibration, then NPT
//! production with a Langevin or Berendsen thermostat and a Berendsen-style
//! barostat. A volume drop below half the starting volume flags collapse;
//! the structure is stable iff it did not collapse and the total volume
//! change stays inside `max_volume_change`.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError, ExecOutcome};
use crate::executors::numeric::{BAR_TO_EV_A3, EV_PER_AMU_A2_FS2, KB_EV};
use crate::executors::relax::fire_relax;
use crate::executors::Executor;
use matsched_core::TaskType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::info;

pub struct StabilityExecutor;

/// Outcome of one MD stage.
#[derive(Debug, Clone, Default)]
struct StageResult {
    name: &'static str,
    completed: bool,
    steps_run: u64,
    initial_volume: f64,
    final_volume: f64,
    avg_temperature: f64,
    collapsed: bool,
    error: Option<String>,
}

impl StageResult {
    fn to_json(&self) -> Value {
        let volume_change = if self.initial_volume > 0.0 {
            (self.final_volume - self.initial_volume) / self.initial_volume * 100.0
        } else {
            0.0
        };
        json!({
            "name": self.name,
            "completed": self.completed,
            "steps_run": self.steps_run,
            "initial_volume_A3": self.initial_volume,
            "final_volume_A3": self.final_volume,
            "volume_change_percent": volume_change,
            "avg_temperature_K": self.avg_temperature,
            "collapsed": self.collapsed,
            "error": self.error,
        })
    }
}

struct MdState {
    velocities: Vec<[f64; 3]>,
    masses: Vec<f64>,
}

impl MdState {
    /// Maxwell-Boltzmann velocities at the target temperature.
    fn init(atoms: &Atoms, temperature: f64, rng: &mut StdRng) -> Self {
        let masses = atoms.masses();
        let velocities = masses
            .iter()
            .map(|&m| {
                let sigma = (KB_EV * temperature / (m * EV_PER_AMU_A2_FS2)).sqrt();
                [
                    sigma * gaussian(rng),
                    sigma * gaussian(rng),
                    sigma * gaussian(rng),
                ]
            })
            .collect();
        Self { velocities, masses }
    }

    /// Instantaneous temperature (K).
    fn temperature(&self) -> f64 {
        let n = self.masses.len();
        if n == 0 {
            return 0.0;
        }
        let kinetic: f64 = self
            .masses
            .iter()
            .zip(&self.velocities)
            .map(|(&m, v)| 0.5 * m * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]) * EV_PER_AMU_A2_FS2)
            .sum();
        2.0 * kinetic / (3.0 * n as f64 * KB_EV)
    }
}

/// Box-Muller standard normal.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(1e-12..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl Executor for StabilityExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Stability
    }

    fn default_parameters(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        defaults.insert("run_optimization".into(), json!(true));
        defaults.insert("opt_fmax".into(), json!(0.01));
        defaults.insert("opt_steps".into(), json!(500));
        defaults.insert("nvt_steps".into(), json!(1000));
        defaults.insert("nvt_timestep_fs".into(), json!(1.0));
        defaults.insert("nvt_friction".into(), json!(0.02));
        defaults.insert("npt_steps".into(), json!(5000));
        defaults.insert("npt_timestep_fs".into(), json!(1.0));
        defaults.insert("npt_thermostat".into(), json!("langevin"));
        defaults.insert("npt_friction".into(), json!(0.02));
        defaults.insert("npt_ttime_fs".into(), json!(100.0));
        defaults.insert("npt_pressure_bar".into(), json!(1.0));
        defaults.insert("npt_barostat_coupling".into(), json!(20.0));
        defaults.insert("temperature_K".into(), json!(300.0));
        defaults.insert("log_interval".into(), json!(10));
        defaults.insert("volume_collapse_threshold".into(), json!(0.5));
        defaults.insert("max_volume_change".into(), json!(0.3));
        defaults.insert("seed".into(), json!(42));
        defaults
    }

    fn run(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
    ) -> Result<ExecOutcome, ExecError> {
        let temperature = ctx.param_f64("temperature_K", 300.0);
        let mut rng = StdRng::seed_from_u64(ctx.param_u64("seed", 42));
        let mut stages: Vec<Value> = Vec::new();

        info!(
            task_id = %ctx.task_id,
            n_atoms = atoms.len(),
            temperature,
            "stability_start"
        );

        // Stage 1: optional relaxation.
        if ctx.param_bool("run_optimization", true) {
            let mut stage = StageResult {
                name: "optimization",
                initial_volume: atoms.volume(),
                ..Default::default()
            };
            let report = fire_relax(
                atoms,
                calc,
                ctx,
                ctx.param_f64("opt_fmax", 0.01),
                ctx.param_u64("opt_steps", 500),
                None,
            )?;
            stage.completed = true;
            stage.steps_run = report.steps;
            stage.final_volume = atoms.volume();
            stages.push(stage.to_json());
        }

        let initial_volume = atoms.volume();
        let mut md = MdState::init(atoms, temperature, &mut rng);

        // Stage 2: NVT equilibration (Langevin).
        let nvt = self.run_md_stage(atoms, calc, ctx, &mut md, &mut rng, StageSpec {
            name: "nvt",
            steps: ctx.param_u64("nvt_steps", 1000),
            timestep_fs: ctx.param_f64("nvt_timestep_fs", 1.0),
            friction: ctx.param_f64("nvt_friction", 0.02),
            thermostat: Thermostat::Langevin,
            barostat: None,
            collapse_threshold: ctx.param_f64("volume_collapse_threshold", 0.5),
            log_interval: ctx.param_u64("log_interval", 10).max(1),
            temperature,
        })?;
        let nvt_collapsed = nvt.collapsed;
        stages.push(nvt.to_json());

        // Stage 3: NPT production.
        let mut collapsed = nvt_collapsed;
        if !collapsed {
            let thermostat = if ctx.param_str("npt_thermostat", "langevin") == "berendsen" {
                Thermostat::Berendsen {
                    ttime_fs: ctx.param_f64("npt_ttime_fs", 100.0),
                }
            } else {
                Thermostat::Langevin
            };
            let npt = self.run_md_stage(atoms, calc, ctx, &mut md, &mut rng, StageSpec {
                name: "npt",
                steps: ctx.param_u64("npt_steps", 5000),
                timestep_fs: ctx.param_f64("npt_timestep_fs", 1.0),
                friction: ctx.param_f64("npt_friction", 0.02),
                thermostat,
                barostat: Some(Barostat {
                    pressure: ctx.param_f64("npt_pressure_bar", 1.0) * BAR_TO_EV_A3,
                    coupling: ctx.param_f64("npt_barostat_coupling", 20.0),
                }),
                collapse_threshold: ctx.param_f64("volume_collapse_threshold", 0.5),
                log_interval: ctx.param_u64("log_interval", 10).max(1),
                temperature,
            })?;
            collapsed = npt.collapsed;
            stages.push(npt.to_json());
        }

        let final_volume = atoms.volume();
        let total_change = if initial_volume > 0.0 {
            (final_volume - initial_volume) / initial_volume
        } else {
            0.0
        };
        let max_volume_change = ctx.param_f64("max_volume_change", 0.3);
        let is_stable = !collapsed && total_change.abs() < max_volume_change;

        info!(
            task_id = %ctx.task_id,
            is_stable,
            collapsed,
            volume_change_percent = total_change * 100.0,
            "stability_completed"
        );

        let mut data = Map::new();
        data.insert("is_stable".into(), json!(is_stable));
        data.insert("is_collapsed".into(), json!(collapsed));
        data.insert("initial_volume_A3".into(), json!(initial_volume));
        data.insert("final_volume_A3".into(), json!(final_volume));
        data.insert("volume_change_percent".into(), json!(total_change * 100.0));
        data.insert("temperature_K".into(), json!(temperature));
        data.insert("stages".into(), Value::Array(stages));
        Ok(ExecOutcome::with_data(data))
    }
}

enum Thermostat {
    Langevin,
    Berendsen { ttime_fs: f64 },
}

struct Barostat {
    /// Target pressure (eV/Å³).
    pressure: f64,
    /// Dimensionless volume-coupling strength.
    coupling: f64,
}

struct StageSpec {
    name: &'static str,
    steps: u64,
    timestep_fs: f64,
    friction: f64,
    thermostat: Thermostat,
    barostat: Option<Barostat>,
    collapse_threshold: f64,
    log_interval: u64,
    temperature: f64,
}

impl StabilityExecutor {
    fn run_md_stage(
        &self,
        atoms: &mut Atoms,
        calc: &dyn Calculator,
        ctx: &ExecContext,
        md: &mut MdState,
        rng: &mut StdRng,
        spec: StageSpec,
    ) -> Result<StageResult, ExecError> {
        let mut stage = StageResult {
            name: spec.name,
            initial_volume: atoms.volume(),
            ..Default::default()
        };
        let dt = spec.timestep_fs;
        let mut temperature_sum = 0.0;
        let mut temperature_samples = 0u64;

        for step in 0..spec.steps {
            ctx.checkpoint()?;
            let forces = calc.forces(atoms)?;

            match &spec.thermostat {
                Thermostat::Langevin => {
                    for ((v, f), &m) in md.velocities.iter_mut().zip(&forces).zip(&md.masses) {
                        let noise_sigma = (2.0 * spec.friction * KB_EV * spec.temperature * dt
                            / (m * EV_PER_AMU_A2_FS2))
                            .sqrt();
                        for k in 0..3 {
                            let accel = f[k] / (m * EV_PER_AMU_A2_FS2);
                            v[k] += dt * (accel - spec.friction * v[k])
                                + noise_sigma * gaussian(rng);
                        }
                    }
                }
                Thermostat::Berendsen { ttime_fs } => {
                    for ((v, f), &m) in md.velocities.iter_mut().zip(&forces).zip(&md.masses) {
                        for k in 0..3 {
                            v[k] += dt * f[k] / (m * EV_PER_AMU_A2_FS2);
                        }
                    }
                    let t_now = md.temperature().max(1e-9);
                    let lambda = (1.0 + dt / ttime_fs * (spec.temperature / t_now - 1.0))
                        .max(0.0)
                        .sqrt()
                        .clamp(0.9, 1.1);
                    for v in &mut md.velocities {
                        for k in 0..3 {
                            v[k] *= lambda;
                        }
                    }
                }
            }

            {
                let positions = atoms.positions_mut();
                for (position, v) in positions.iter_mut().zip(&md.velocities) {
                    for k in 0..3 {
                        position[k] += dt * v[k];
                    }
                }
            }

            if let Some(barostat) = &spec.barostat {
                let voigt = calc.stress(atoms)?;
                let pressure = -(voigt[0] + voigt[1] + voigt[2]) / 3.0;
                let delta = (barostat.coupling * dt * (barostat.pressure - pressure))
                    .clamp(-0.01, 0.01);
                let mu = (1.0 - delta).cbrt();
                let cell = atoms.cell();
                let scaled = [
                    [cell[0][0] * mu, cell[0][1] * mu, cell[0][2] * mu],
                    [cell[1][0] * mu, cell[1][1] * mu, cell[1][2] * mu],
                    [cell[2][0] * mu, cell[2][1] * mu, cell[2][2] * mu],
                ];
                atoms.set_cell(scaled, true);
            }

            if step % spec.log_interval == 0 {
                temperature_sum += md.temperature();
                temperature_samples += 1;
                if atoms.volume() < stage.initial_volume * spec.collapse_threshold {
                    stage.collapsed = true;
                    stage.steps_run = step + 1;
                    break;
                }
            }
            stage.steps_run = step + 1;
        }

        stage.completed = true;
        stage.final_volume = atoms.volume();
        stage.avg_temperature = if temperature_samples > 0 {
            temperature_sum / temperature_samples as f64
        } else {
            spec.temperature
        };
        info!(
            task_id = %ctx.task_id,
            stage = spec.name,
            steps = stage.steps_run,
            avg_temperature = stage.avg_temperature,
            collapsed = stage.collapsed,
            "md_stage_completed"
        );
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::MockCalculator;
    use matsched_core::{CancelToken, TaskId};

    fn context(overrides: Map<String, Value>) -> ExecContext {
        let merged =
            crate::context::merge_parameters(StabilityExecutor.default_parameters(), &overrides);
        ExecContext {
            task_id: TaskId::new(),
            task_type: TaskType::Stability,
            model_name: "orb-v2".into(),
            gpu_id: 0,
            parameters: merged,
            cancel: CancelToken::new(),
        }
    }

    fn small_cluster() -> Atoms {
        Atoms::new(
            vec!["C".into(); 4],
            vec![
                [0.0, 0.0, 0.0],
                [2.8, 0.0, 0.0],
                [0.0, 2.8, 0.0],
                [0.0, 0.0, 2.8],
            ],
            [[25.0, 0.0, 0.0], [0.0, 25.0, 0.0], [0.0, 0.0, 25.0]],
        )
    }

    fn quick_overrides() -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("nvt_steps".into(), json!(50));
        params.insert("npt_steps".into(), json!(50));
        params.insert("opt_steps".into(), json!(100));
        params.insert("opt_fmax".into(), json!(0.05));
        params.insert("temperature_K".into(), json!(50.0));
        params
    }

    #[test]
    fn test_stability_runs_all_stages() {
        let calc = MockCalculator::new();
        let mut atoms = small_cluster();
        let outcome = StabilityExecutor
            .run(&mut atoms, &calc, &context(quick_overrides()))
            .unwrap();

        let stages = outcome.data["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0]["name"], json!("optimization"));
        assert_eq!(stages[1]["name"], json!("nvt"));
        assert_eq!(stages[2]["name"], json!("npt"));
        assert!(outcome.data["is_stable"].is_boolean());
        assert!(stages[1]["avg_temperature_K"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_skip_optimization_stage() {
        let calc = MockCalculator::new();
        let mut atoms = small_cluster();
        let mut params = quick_overrides();
        params.insert("run_optimization".into(), json!(false));
        let outcome = StabilityExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();
        let stages = outcome.data["stages"].as_array().unwrap();
        assert_eq!(stages[0]["name"], json!("nvt"));
    }

    #[test]
    fn test_berendsen_thermostat_variant() {
        let calc = MockCalculator::new();
        let mut atoms = small_cluster();
        let mut params = quick_overrides();
        params.insert("npt_thermostat".into(), json!("berendsen"));
        let outcome = StabilityExecutor
            .run(&mut atoms, &calc, &context(params))
            .unwrap();
        assert!(outcome.data["is_stable"].is_boolean());
    }

    #[test]
    fn test_cancellation_mid_md() {
        let calc = MockCalculator::new();
        let mut atoms = small_cluster();
        let ctx = context(quick_overrides());
        ctx.cancel.cancel();
        assert!(matches!(
            StabilityExecutor.run(&mut atoms, &calc, &ctx),
            Err(ExecError::Cancelled)
        ));
    }
}
