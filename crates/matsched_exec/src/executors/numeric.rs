//! Shared numeric helpers and unit constants for the executors.

/// Boltzmann constant (eV/K).
pub const KB_EV: f64 = 8.617_333_262e-5;

/// 1 amu·Å²/fs² in eV.
pub const EV_PER_AMU_A2_FS2: f64 = 103.642_696;

/// 1 eV/Å³ in GPa.
pub const EV_A3_TO_GPA: f64 = 160.217_662;

/// 1 bar in eV/Å³.
pub const BAR_TO_EV_A3: f64 = 6.241_509e-7;

/// ħ·sqrt(1 eV/(Å²·amu)) in eV; multiplies `sqrt(eigenvalue)` to give a
/// phonon quantum.
pub const PHONON_EV_FACTOR: f64 = 0.064_654_1;

/// Maximum per-atom force magnitude (eV/Å).
pub fn max_force(forces: &[[f64; 3]]) -> f64 {
    forces
        .iter()
        .map(|f| f[0] * f[0] + f[1] * f[1] + f[2] * f[2])
        .fold(0.0_f64, f64::max)
        .sqrt()
}

/// Root-mean-square force component (eV/Å).
pub fn rms_force(forces: &[[f64; 3]]) -> f64 {
    if forces.is_empty() {
        return 0.0;
    }
    let sum: f64 = forces
        .iter()
        .map(|f| f[0] * f[0] + f[1] * f[1] + f[2] * f[2])
        .sum();
    (sum / (3.0 * forces.len() as f64)).sqrt()
}

/// Least-squares quadratic fit `y = c0 + c1 x + c2 x²` via normal equations.
pub fn quadratic_fit(xs: &[f64], ys: &[f64]) -> Option<[f64; 3]> {
    if xs.len() < 3 || xs.len() != ys.len() {
        return None;
    }
    let n = xs.len() as f64;
    let (mut sx, mut sx2, mut sx3, mut sx4) = (0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut sxy, mut sx2y) = (0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }
    let a = [[n, sx, sx2], [sx, sx2, sx3], [sx2, sx3, sx4]];
    let b = [sy, sxy, sx2y];
    solve3(&a, &b)
}

fn solve3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let det = crate::atoms::det3(a);
    if det.abs() < 1e-300 {
        return None;
    }
    let inv = crate::atoms::inv3(a);
    Some([
        inv[0][0] * b[0] + inv[0][1] * b[1] + inv[0][2] * b[2],
        inv[1][0] * b[0] + inv[1][1] * b[1] + inv[1][2] * b[2],
        inv[2][0] * b[0] + inv[2][1] * b[1] + inv[2][2] * b[2],
    ])
}

/// Eigenvalues of a symmetric matrix by the cyclic Jacobi method.
/// Good enough for the dynamical matrices the phonon path produces.
pub fn jacobi_eigenvalues(matrix: &[Vec<f64>]) -> Vec<f64> {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();

    for _sweep in 0..100 {
        let mut off_diag = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                off_diag += a[i][j] * a[i][j];
            }
        }
        if off_diag < 1e-20 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q].abs() < 1e-14 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
            }
        }
    }

    let mut eigenvalues: Vec<f64> = (0..n).map(|i| a[i][i]).collect();
    eigenvalues.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    eigenvalues
}

/// Harmonic-mode heat capacity in kB units at temperature `t_kelvin` for a
/// phonon quantum `energy_ev`.
pub fn mode_cv_kb(energy_ev: f64, t_kelvin: f64) -> f64 {
    if t_kelvin <= 0.0 || energy_ev <= 0.0 {
        return 0.0;
    }
    let x = energy_ev / (KB_EV * t_kelvin);
    if x > 500.0 {
        return 0.0;
    }
    let ex = x.exp();
    x * x * ex / ((ex - 1.0) * (ex - 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_and_rms_force() {
        let forces = vec![[3.0, 0.0, 4.0], [0.0, 0.0, 0.0]];
        assert!((max_force(&forces) - 5.0).abs() < 1e-12);
        assert!(rms_force(&forces) > 0.0);
    }

    #[test]
    fn test_quadratic_fit_recovers_parabola() {
        let xs: Vec<f64> = (0..7).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 - 3.0 * x + 0.5 * x * x).collect();
        let [c0, c1, c2] = quadratic_fit(&xs, &ys).unwrap();
        assert!((c0 - 2.0).abs() < 1e-8);
        assert!((c1 + 3.0).abs() < 1e-8);
        assert!((c2 - 0.5).abs() < 1e-8);
    }

    #[test]
    fn test_jacobi_diagonal_and_symmetric() {
        let diag = vec![vec![3.0, 0.0], vec![0.0, 1.0]];
        assert_eq!(jacobi_eigenvalues(&diag), vec![1.0, 3.0]);

        // [[2,1],[1,2]] has eigenvalues 1 and 3.
        let sym = vec![vec![2.0, 1.0], vec![1.0, 2.0]];
        let eigenvalues = jacobi_eigenvalues(&sym);
        assert!((eigenvalues[0] - 1.0).abs() < 1e-9);
        assert!((eigenvalues[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_mode_cv_limits() {
        // Classical limit: kT >> ħω gives 1 kB per mode.
        assert!((mode_cv_kb(1e-6, 300.0) - 1.0).abs() < 1e-3);
        // Frozen mode: kT << ħω gives ~0.
        assert!(mode_cv_kb(1.0, 10.0) < 1e-10);
    }
}
