//! Geometry relaxation driver.
//!
//! A FIRE-style damped-dynamics minimizer with an optional variable-cell
//! outer loop. The cell loop plays the role of a cell filter: after the
//! positions settle, a strain step proportional to the stress tensor relaxes
//! the lattice, and the pair iterates until both forces and stress are
//! below tolerance or the step budget runs out.

use crate::atoms::Atoms;
use crate::calculator::Calculator;
use crate::context::{ExecContext, ExecError};
use crate::executors::numeric::max_force;

/// Relaxation summary.
#[derive(Debug, Clone)]
pub struct RelaxReport {
    pub converged: bool,
    pub steps: u64,
    pub final_energy: f64,
    pub final_fmax: f64,
}

const DT_START: f64 = 0.08;
const DT_MAX: f64 = 0.4;
const N_MIN: usize = 5;
const F_INC: f64 = 1.1;
const F_DEC: f64 = 0.5;
const ALPHA_START: f64 = 0.1;
const F_ALPHA: f64 = 0.99;
const MAX_STEP_A: f64 = 0.2;

/// Fixed-cell FIRE relaxation. Atoms flagged in `frozen` keep their
/// positions. Checks the cancellation token every step.
pub fn fire_relax(
    atoms: &mut Atoms,
    calc: &dyn Calculator,
    ctx: &ExecContext,
    fmax: f64,
    max_steps: u64,
    frozen: Option<&[bool]>,
) -> Result<RelaxReport, ExecError> {
    let n = atoms.len();
    let mut velocities = vec![[0.0_f64; 3]; n];
    let mut dt = DT_START;
    let mut alpha = ALPHA_START;
    let mut uphill_free_steps = 0usize;
    let mut steps = 0u64;

    loop {
        ctx.checkpoint()?;
        let mut forces = calc.forces(atoms)?;
        if let Some(frozen) = frozen {
            for (force, &hold) in forces.iter_mut().zip(frozen) {
                if hold {
                    *force = [0.0; 3];
                }
            }
        }
        let fmax_now = max_force(&forces);
        if fmax_now <= fmax {
            let final_energy = calc.energy(atoms)?;
            return Ok(RelaxReport {
                converged: true,
                steps,
                final_energy,
                final_fmax: fmax_now,
            });
        }
        if steps >= max_steps {
            let final_energy = calc.energy(atoms)?;
            return Ok(RelaxReport {
                converged: false,
                steps,
                final_energy,
                final_fmax: fmax_now,
            });
        }

        // FIRE velocity mixing.
        let power: f64 = velocities
            .iter()
            .zip(&forces)
            .map(|(v, f)| v[0] * f[0] + v[1] * f[1] + v[2] * f[2])
            .sum();
        if power > 0.0 {
            let v_norm: f64 = velocities
                .iter()
                .map(|v| v[0] * v[0] + v[1] * v[1] + v[2] * v[2])
                .sum::<f64>()
                .sqrt();
            let f_norm: f64 = forces
                .iter()
                .map(|f| f[0] * f[0] + f[1] * f[1] + f[2] * f[2])
                .sum::<f64>()
                .sqrt()
                .max(1e-12);
            for (v, f) in velocities.iter_mut().zip(&forces) {
                for k in 0..3 {
                    v[k] = (1.0 - alpha) * v[k] + alpha * v_norm * f[k] / f_norm;
                }
            }
            uphill_free_steps += 1;
            if uphill_free_steps > N_MIN {
                dt = (dt * F_INC).min(DT_MAX);
                alpha *= F_ALPHA;
            }
        } else {
            velocities.iter_mut().for_each(|v| *v = [0.0; 3]);
            dt *= F_DEC;
            alpha = ALPHA_START;
            uphill_free_steps = 0;
        }

        // Semi-implicit Euler with a displacement cap.
        for (v, f) in velocities.iter_mut().zip(&forces) {
            for k in 0..3 {
                v[k] += dt * f[k];
            }
        }
        let positions = atoms.positions_mut();
        for (position, v) in positions.iter_mut().zip(&velocities) {
            for k in 0..3 {
                let step = (dt * v[k]).clamp(-MAX_STEP_A, MAX_STEP_A);
                position[k] += step;
            }
        }
        steps += 1;
    }
}

/// Stress tolerance for the variable-cell loop (eV/Å³).
pub const STRESS_TOL: f64 = 5e-4;

/// Variable-cell relaxation: inner FIRE on positions, outer strain steps
/// from the stress tensor. `cell_step` scales strain per unit stress.
pub fn relax_with_cell(
    atoms: &mut Atoms,
    calc: &dyn Calculator,
    ctx: &ExecContext,
    fmax: f64,
    max_steps: u64,
    cell_step: f64,
) -> Result<RelaxReport, ExecError> {
    let mut total_steps = 0u64;
    let mut last = RelaxReport {
        converged: false,
        steps: 0,
        final_energy: 0.0,
        final_fmax: f64::INFINITY,
    };

    for _outer in 0..30 {
        ctx.checkpoint()?;
        let budget = max_steps.saturating_sub(total_steps);
        if budget == 0 {
            break;
        }
        last = fire_relax(atoms, calc, ctx, fmax, budget, None)?;
        total_steps += last.steps;

        let voigt = calc.stress(atoms)?;
        let stress_max = voigt.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
        if last.converged && stress_max <= STRESS_TOL {
            return Ok(RelaxReport {
                converged: true,
                steps: total_steps,
                final_energy: last.final_energy,
                final_fmax: last.final_fmax,
            });
        }
        if total_steps >= max_steps {
            break;
        }

        // Strain step opposing the stress; symmetric 3x3 from Voigt.
        let clamp = |x: f64| x.clamp(-0.02, 0.02);
        let strain = [
            [clamp(-cell_step * voigt[0]), clamp(-cell_step * voigt[5]), clamp(-cell_step * voigt[4])],
            [clamp(-cell_step * voigt[5]), clamp(-cell_step * voigt[1]), clamp(-cell_step * voigt[3])],
            [clamp(-cell_step * voigt[4]), clamp(-cell_step * voigt[3]), clamp(-cell_step * voigt[2])],
        ];
        let cell = atoms.cell();
        let mut new_cell = [[0.0; 3]; 3];
        for (row, new_row) in cell.iter().zip(new_cell.iter_mut()) {
            for a in 0..3 {
                new_row[a] = row[a] + row[0] * strain[0][a] + row[1] * strain[1][a] + row[2] * strain[2][a];
            }
        }
        atoms.set_cell(new_cell, true);
        total_steps += 1;
    }

    Ok(RelaxReport {
        converged: false,
        steps: total_steps,
        final_energy: last.final_energy,
        final_fmax: last.final_fmax,
    })
}
