//! In-memory periodic structure.
//!
//! Positions are cartesian Å, the cell rows are the lattice vectors a, b, c.
//! This is the representation executors drive; everything model-specific
//! stays behind the calculator boundary.

use serde::{Deserialize, Serialize};

/// Cell lengths (Å) and angles (degrees).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CellParameters {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

/// A periodic crystal: element symbols, cartesian positions, lattice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atoms {
    symbols: Vec<String>,
    positions: Vec<[f64; 3]>,
    cell: [[f64; 3]; 3],
    pbc: bool,
}

impl Atoms {
    /// Builds a structure. Symbol and position counts must match.
    pub fn new(symbols: Vec<String>, positions: Vec<[f64; 3]>, cell: [[f64; 3]; 3]) -> Self {
        debug_assert_eq!(symbols.len(), positions.len());
        Self {
            symbols,
            positions,
            cell,
            pbc: true,
        }
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the structure has no atoms.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Element symbols.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Cartesian positions (Å).
    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    /// Mutable cartesian positions (Å).
    pub fn positions_mut(&mut self) -> &mut [[f64; 3]] {
        &mut self.positions
    }

    /// Lattice vectors, rows a, b, c (Å).
    pub fn cell(&self) -> [[f64; 3]; 3] {
        self.cell
    }

    /// Periodic boundary flag.
    pub fn pbc(&self) -> bool {
        self.pbc
    }

    /// Sets the periodic boundary flag.
    pub fn set_pbc(&mut self, pbc: bool) {
        self.pbc = pbc;
    }

    /// Replaces the cell. With `scale_atoms`, positions follow the
    /// deformation (fractional coordinates are preserved).
    pub fn set_cell(&mut self, cell: [[f64; 3]; 3], scale_atoms: bool) {
        if scale_atoms {
            let fractional = self.scaled_positions();
            self.cell = cell;
            for (position, frac) in self.positions.iter_mut().zip(fractional) {
                *position = mat_vec_t(&cell, &frac);
            }
        } else {
            self.cell = cell;
        }
    }

    /// Cell volume (Å³).
    pub fn volume(&self) -> f64 {
        det3(&self.cell).abs()
    }

    /// Fractional coordinates of all atoms.
    pub fn scaled_positions(&self) -> Vec<[f64; 3]> {
        let inv = inv3(&self.cell);
        self.positions
            .iter()
            .map(|p| mat_vec_t(&inv, p))
            .collect()
    }

    /// Cell lengths and angles.
    pub fn cell_parameters(&self) -> CellParameters {
        let [a_vec, b_vec, c_vec] = self.cell;
        let a = norm(&a_vec);
        let b = norm(&b_vec);
        let c = norm(&c_vec);
        let angle = |u: &[f64; 3], v: &[f64; 3]| {
            let lu = norm(u);
            let lv = norm(v);
            if lu == 0.0 || lv == 0.0 {
                return 90.0;
            }
            (dot(u, v) / (lu * lv)).clamp(-1.0, 1.0).acos().to_degrees()
        };
        CellParameters {
            a,
            b,
            c,
            alpha: angle(&b_vec, &c_vec),
            beta: angle(&a_vec, &c_vec),
            gamma: angle(&a_vec, &b_vec),
        }
    }

    /// Reduced chemical formula, elements in alphabetical order.
    pub fn formula(&self) -> String {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for symbol in &self.symbols {
            match counts.iter_mut().find(|(s, _)| s == symbol) {
                Some((_, n)) => *n += 1,
                None => counts.push((symbol.clone(), 1)),
            }
        }
        counts.sort_by(|a, b| a.0.cmp(&b.0));
        counts
            .into_iter()
            .map(|(s, n)| if n == 1 { s } else { format!("{s}{n}") })
            .collect()
    }

    /// Total mass (amu).
    pub fn total_mass(&self) -> f64 {
        self.symbols.iter().map(|s| atomic_mass(s)).sum()
    }

    /// Per-atom masses (amu).
    pub fn masses(&self) -> Vec<f64> {
        self.symbols.iter().map(|s| atomic_mass(s)).collect()
    }

    /// Mass-weighted center (Å).
    pub fn center_of_mass(&self) -> [f64; 3] {
        let mut com = [0.0; 3];
        let mut total = 0.0;
        for (symbol, position) in self.symbols.iter().zip(&self.positions) {
            let m = atomic_mass(symbol);
            total += m;
            for k in 0..3 {
                com[k] += m * position[k];
            }
        }
        if total > 0.0 {
            for c in &mut com {
                *c /= total;
            }
        }
        com
    }

    /// Rigid translation of every atom.
    pub fn translate(&mut self, shift: [f64; 3]) {
        for position in &mut self.positions {
            for k in 0..3 {
                position[k] += shift[k];
            }
        }
    }

    /// Moves the center of mass to the cell center.
    pub fn center(&mut self) {
        let com = self.center_of_mass();
        let target = mat_vec_t(&self.cell, &[0.5, 0.5, 0.5]);
        self.translate([target[0] - com[0], target[1] - com[1], target[2] - com[2]]);
    }

    /// Appends the atoms of `other` (positions taken as-is).
    pub fn extend(&mut self, other: &Atoms) {
        self.symbols.extend_from_slice(&other.symbols);
        self.positions.extend_from_slice(&other.positions);
    }

    /// Builds an `(nx, ny, nz)` supercell.
    pub fn supercell(&self, nx: usize, ny: usize, nz: usize) -> Atoms {
        let mut symbols = Vec::with_capacity(self.len() * nx * ny * nz);
        let mut positions = Vec::with_capacity(self.len() * nx * ny * nz);
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    let shift = [
                        i as f64 * self.cell[0][0]
                            + j as f64 * self.cell[1][0]
                            + k as f64 * self.cell[2][0],
                        i as f64 * self.cell[0][1]
                            + j as f64 * self.cell[1][1]
                            + k as f64 * self.cell[2][1],
                        i as f64 * self.cell[0][2]
                            + j as f64 * self.cell[1][2]
                            + k as f64 * self.cell[2][2],
                    ];
                    for (symbol, position) in self.symbols.iter().zip(&self.positions) {
                        symbols.push(symbol.clone());
                        positions.push([
                            position[0] + shift[0],
                            position[1] + shift[1],
                            position[2] + shift[2],
                        ]);
                    }
                }
            }
        }
        let cell = [
            [
                self.cell[0][0] * nx as f64,
                self.cell[0][1] * nx as f64,
                self.cell[0][2] * nx as f64,
            ],
            [
                self.cell[1][0] * ny as f64,
                self.cell[1][1] * ny as f64,
                self.cell[1][2] * ny as f64,
            ],
            [
                self.cell[2][0] * nz as f64,
                self.cell[2][1] * nz as f64,
                self.cell[2][2] * nz as f64,
            ],
        ];
        Atoms::new(symbols, positions, cell)
    }

    /// Root-mean-square displacement against a same-length reference.
    pub fn rmsd_from(&self, reference: &Atoms) -> Option<f64> {
        if self.len() != reference.len() || self.is_empty() {
            return None;
        }
        let sum: f64 = self
            .positions
            .iter()
            .zip(&reference.positions)
            .map(|(p, r)| {
                (p[0] - r[0]).powi(2) + (p[1] - r[1]).powi(2) + (p[2] - r[2]).powi(2)
            })
            .sum();
        Some((sum / (3.0 * self.len() as f64)).sqrt())
    }
}

/// Standard guest molecules for adsorption scans.
pub fn gas_molecule(name: &str) -> Option<Atoms> {
    let vacuum = [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]];
    let build = |symbols: &[&str], positions: &[[f64; 3]]| {
        Atoms::new(
            symbols.iter().map(|s| s.to_string()).collect(),
            positions.to_vec(),
            vacuum,
        )
    };
    match name {
        "H2" => Some(build(&["H", "H"], &[[0.0, 0.0, 0.0], [0.0, 0.0, 0.74]])),
        "CO2" => Some(build(
            &["C", "O", "O"],
            &[[0.0, 0.0, 0.0], [0.0, 0.0, 1.16], [0.0, 0.0, -1.16]],
        )),
        "CH4" => Some(build(
            &["C", "H", "H", "H", "H"],
            &[
                [0.0, 0.0, 0.0],
                [0.629, 0.629, 0.629],
                [-0.629, -0.629, 0.629],
                [-0.629, 0.629, -0.629],
                [0.629, -0.629, -0.629],
            ],
        )),
        "N2" => Some(build(&["N", "N"], &[[0.0, 0.0, 0.0], [0.0, 0.0, 1.10]])),
        "H2O" => Some(build(
            &["O", "H", "H"],
            &[[0.0, 0.0, 0.0], [0.757, 0.587, 0.0], [-0.757, 0.587, 0.0]],
        )),
        "CO" => Some(build(&["C", "O"], &[[0.0, 0.0, 0.0], [0.0, 0.0, 1.13]])),
        "NH3" => Some(build(
            &["N", "H", "H", "H"],
            &[
                [0.0, 0.0, 0.0],
                [0.0, 0.94, 0.38],
                [0.81, -0.47, 0.38],
                [-0.81, -0.47, 0.38],
            ],
        )),
        _ => None,
    }
}

/// Names of the bundled guest molecules.
pub const GAS_MOLECULES: [&str; 7] = ["H2", "CO2", "CH4", "N2", "H2O", "CO", "NH3"];

/// Atomic mass (amu) for the elements this service encounters; unknown
/// symbols default to carbon.
pub fn atomic_mass(symbol: &str) -> f64 {
    match symbol {
        "H" => 1.008,
        "He" => 4.003,
        "Li" => 6.94,
        "B" => 10.81,
        "C" => 12.011,
        "N" => 14.007,
        "O" => 15.999,
        "F" => 18.998,
        "Na" => 22.990,
        "Mg" => 24.305,
        "Al" => 26.982,
        "Si" => 28.085,
        "P" => 30.974,
        "S" => 32.06,
        "Cl" => 35.45,
        "K" => 39.098,
        "Ca" => 40.078,
        "Ti" => 47.867,
        "V" => 50.942,
        "Cr" => 51.996,
        "Mn" => 54.938,
        "Fe" => 55.845,
        "Co" => 58.933,
        "Ni" => 58.693,
        "Cu" => 63.546,
        "Zn" => 65.38,
        "Zr" => 91.224,
        "Ag" => 107.87,
        "Au" => 196.97,
        _ => 12.011,
    }
}

// Small dense linear algebra on 3x3 row matrices.

pub(crate) fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

pub(crate) fn inv3(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let d = det3(m);
    let inv_det = if d.abs() < 1e-300 { 0.0 } else { 1.0 / d };
    let mut out = [[0.0; 3]; 3];
    out[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
    out[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
    out[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
    out[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
    out[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
    out[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
    out[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
    out[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
    out[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
    out
}

/// Row-vector times matrix: `v * M` for fractional/cartesian conversion.
pub(crate) fn mat_vec_t(m: &[[f64; 3]; 3], v: &[f64; 3]) -> [f64; 3] {
    [
        v[0] * m[0][0] + v[1] * m[1][0] + v[2] * m[2][0],
        v[0] * m[0][1] + v[1] * m[1][1] + v[2] * m[2][1],
        v[0] * m[0][2] + v[1] * m[1][2] + v[2] * m[2][2],
    ]
}

pub(crate) fn dot(u: &[f64; 3], v: &[f64; 3]) -> f64 {
    u[0] * v[0] + u[1] * v[1] + u[2] * v[2]
}

pub(crate) fn norm(v: &[f64; 3]) -> f64 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(n: usize, a: f64) -> Atoms {
        let mut symbols = Vec::new();
        let mut positions = Vec::new();
        for i in 0..n {
            symbols.push("C".to_string());
            positions.push([i as f64 * a / n as f64, 0.5, 0.5]);
        }
        Atoms::new(symbols, positions, [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]])
    }

    #[test]
    fn test_volume_and_parameters() {
        let atoms = cubic(2, 4.0);
        assert!((atoms.volume() - 64.0).abs() < 1e-12);
        let params = atoms.cell_parameters();
        assert!((params.a - 4.0).abs() < 1e-12);
        assert!((params.alpha - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_cell_scales_atoms() {
        let mut atoms = cubic(2, 4.0);
        let frac_before = atoms.scaled_positions();
        atoms.set_cell([[8.0, 0.0, 0.0], [0.0, 8.0, 0.0], [0.0, 0.0, 8.0]], true);
        let frac_after = atoms.scaled_positions();
        for (before, after) in frac_before.iter().zip(&frac_after) {
            for k in 0..3 {
                assert!((before[k] - after[k]).abs() < 1e-12);
            }
        }
        assert!((atoms.volume() - 512.0).abs() < 1e-9);
    }

    #[test]
    fn test_formula() {
        let atoms = Atoms::new(
            vec!["O".into(), "H".into(), "H".into()],
            vec![[0.0; 3], [0.0; 3], [0.0; 3]],
            [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
        );
        assert_eq!(atoms.formula(), "H2O");
    }

    #[test]
    fn test_supercell_counts_and_volume() {
        let atoms = cubic(2, 4.0);
        let sc = atoms.supercell(2, 2, 2);
        assert_eq!(sc.len(), 16);
        assert!((sc.volume() - 8.0 * atoms.volume()).abs() < 1e-9);
    }

    #[test]
    fn test_gas_library() {
        for name in GAS_MOLECULES {
            let gas = gas_molecule(name).unwrap();
            assert!(!gas.is_empty());
        }
        assert!(gas_molecule("XYZ").is_none());
    }

    #[test]
    fn test_rmsd() {
        let a = cubic(2, 4.0);
        let mut b = a.clone();
        assert_eq!(a.rmsd_from(&b), Some(0.0));
        b.translate([1.0, 0.0, 0.0]);
        let rmsd = a.rmsd_from(&b).unwrap();
        assert!((rmsd - (1.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }
}
