//! The calculator and model-loader boundaries.
//!
//! A calculator is an opaque handle bound to one model on one device; the
//! core only ever asks it for energy, forces, and stress. The mock
//! implementation is a smooth pair potential, deterministic enough to drive
//! every executor in tests and the demo binary.

use crate::atoms::Atoms;
use async_trait::async_trait;
use matsched_core::{GpuId, StructureRef};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Calculator-side failures.
#[derive(Debug, Clone, Error)]
pub enum CalcError {
    /// The device ran out of memory; feeds the live memory estimator.
    #[error("out of GPU memory (required ~{required_mb} MiB)")]
    OutOfMemory { required_mb: u64 },

    #[error("{0}")]
    Failure(String),
}

/// Opaque energy/forces/stress provider bound to a device.
pub trait Calculator: Send + Sync {
    /// Potential energy (eV).
    fn energy(&self, atoms: &Atoms) -> Result<f64, CalcError>;

    /// Per-atom forces (eV/Å).
    fn forces(&self, atoms: &Atoms) -> Result<Vec<[f64; 3]>, CalcError>;

    /// Stress in Voigt order xx, yy, zz, yz, xz, xy (eV/Å³).
    fn stress(&self, atoms: &Atoms) -> Result<[f64; 6], CalcError>;
}

/// Translates `(model, gpu)` into a calculator, caching loads.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Loads (or returns the cached) calculator for a model on a device.
    async fn load(&self, model_name: &str, gpu: GpuId) -> Result<Arc<dyn Calculator>, CalcError>;

    /// Drops the cached calculator for a model on a device.
    async fn unload(&self, model_name: &str, gpu: GpuId);
}

/// Resolves a structure reference into atoms. The real implementation wraps
/// the external structure reader; parsing is out of scope here.
pub trait StructureSource: Send + Sync {
    fn load(&self, structure: &StructureRef) -> Result<Atoms, CalcError>;
}

/// Deterministic structure source: lays `n_atoms` carbon atoms on a uniform
/// grid inside the referenced lattice.
#[derive(Debug, Default)]
pub struct SyntheticStructureSource;

impl StructureSource for SyntheticStructureSource {
    fn load(&self, structure: &StructureRef) -> Result<Atoms, CalcError> {
        if structure.n_atoms == 0 {
            return Err(CalcError::Failure(format!(
                "structure {} has no atoms",
                structure.id
            )));
        }
        let n = structure.n_atoms;
        let per_side = (n as f64).cbrt().ceil() as usize;
        let cell = structure.lattice;
        let mut symbols = Vec::with_capacity(n);
        let mut positions = Vec::with_capacity(n);
        'fill: for i in 0..per_side {
            for j in 0..per_side {
                for k in 0..per_side {
                    if positions.len() == n {
                        break 'fill;
                    }
                    let frac = [
                        (i as f64 + 0.5) / per_side as f64,
                        (j as f64 + 0.5) / per_side as f64,
                        (k as f64 + 0.5) / per_side as f64,
                    ];
                    symbols.push("C".to_string());
                    positions.push([
                        frac[0] * cell[0][0] + frac[1] * cell[1][0] + frac[2] * cell[2][0],
                        frac[0] * cell[0][1] + frac[1] * cell[1][1] + frac[2] * cell[2][1],
                        frac[0] * cell[0][2] + frac[1] * cell[1][2] + frac[2] * cell[2][2],
                    ]);
                }
            }
        }
        Ok(Atoms::new(symbols, positions, cell))
    }
}

enum MockBehavior {
    Normal,
    Fail(String),
    OutOfMemory { required_mb: u64 },
}

/// Lennard-Jones-style mock calculator.
///
/// Direct pair sum without periodic images, smooth and analytic. An
/// optional per-call delay turns it into a slow model for timeout and
/// cancellation tests.
pub struct MockCalculator {
    epsilon: f64,
    sigma: f64,
    delay: Option<Duration>,
    behavior: MockBehavior,
    calls: AtomicU64,
}

impl Default for MockCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCalculator {
    /// Well depth 0.01 eV, σ 2.5 Å.
    pub fn new() -> Self {
        Self {
            epsilon: 0.01,
            sigma: 2.5,
            delay: None,
            behavior: MockBehavior::Normal,
            calls: AtomicU64::new(0),
        }
    }

    /// Sleeps this long on every evaluation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fails with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        let mut calc = Self::new();
        calc.behavior = MockBehavior::Fail(message.into());
        calc
    }

    /// Always fails with an out-of-memory error.
    pub fn out_of_memory(required_mb: u64) -> Self {
        let mut calc = Self::new();
        calc.behavior = MockBehavior::OutOfMemory { required_mb };
        calc
    }

    /// Number of evaluations so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Result<(), CalcError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.behavior {
            MockBehavior::Normal => {}
            MockBehavior::Fail(message) => return Err(CalcError::Failure(message.clone())),
            MockBehavior::OutOfMemory { required_mb } => {
                return Err(CalcError::OutOfMemory {
                    required_mb: *required_mb,
                })
            }
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    /// dU/dr for the pair potential.
    fn du_dr(&self, r: f64) -> f64 {
        let sr6 = (self.sigma / r).powi(6);
        let sr12 = sr6 * sr6;
        4.0 * self.epsilon * (-12.0 * sr12 + 6.0 * sr6) / r
    }

    fn pair_energy(&self, r: f64) -> f64 {
        let sr6 = (self.sigma / r).powi(6);
        let sr12 = sr6 * sr6;
        4.0 * self.epsilon * (sr12 - sr6)
    }
}

const MIN_PAIR_DISTANCE: f64 = 1e-6;

impl Calculator for MockCalculator {
    fn energy(&self, atoms: &Atoms) -> Result<f64, CalcError> {
        self.checkpoint()?;
        let positions = atoms.positions();
        let mut energy = 0.0;
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let r = distance(&positions[i], &positions[j]).max(MIN_PAIR_DISTANCE);
                energy += self.pair_energy(r);
            }
        }
        Ok(energy)
    }

    fn forces(&self, atoms: &Atoms) -> Result<Vec<[f64; 3]>, CalcError> {
        self.checkpoint()?;
        let positions = atoms.positions();
        let mut forces = vec![[0.0; 3]; positions.len()];
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let dx = [
                    positions[i][0] - positions[j][0],
                    positions[i][1] - positions[j][1],
                    positions[i][2] - positions[j][2],
                ];
                let r = (dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2])
                    .sqrt()
                    .max(MIN_PAIR_DISTANCE);
                // F_i = -dU/dr * r_hat_ij
                let factor = -self.du_dr(r) / r;
                for k in 0..3 {
                    forces[i][k] += factor * dx[k];
                    forces[j][k] -= factor * dx[k];
                }
            }
        }
        Ok(forces)
    }

    fn stress(&self, atoms: &Atoms) -> Result<[f64; 6], CalcError> {
        self.checkpoint()?;
        let positions = atoms.positions();
        let volume = atoms.volume().max(MIN_PAIR_DISTANCE);
        let mut tensor = [[0.0; 3]; 3];
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                let dx = [
                    positions[i][0] - positions[j][0],
                    positions[i][1] - positions[j][1],
                    positions[i][2] - positions[j][2],
                ];
                let r = (dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2])
                    .sqrt()
                    .max(MIN_PAIR_DISTANCE);
                let du = self.du_dr(r);
                for a in 0..3 {
                    for b in 0..3 {
                        tensor[a][b] += du * dx[a] * dx[b] / r;
                    }
                }
            }
        }
        for row in &mut tensor {
            for value in row.iter_mut() {
                *value /= volume;
            }
        }
        Ok([
            tensor[0][0],
            tensor[1][1],
            tensor[2][2],
            tensor[1][2],
            tensor[0][2],
            tensor[0][1],
        ])
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

type CalculatorFactory = Box<dyn Fn(&str, GpuId) -> Arc<dyn Calculator> + Send + Sync>;

/// In-process model loader with a `(model, gpu)` cache.
pub struct MockModelLoader {
    load_delay: Duration,
    factory: CalculatorFactory,
    loaded: Mutex<FxHashMap<(String, GpuId), Arc<dyn Calculator>>>,
}

impl Default for MockModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModelLoader {
    /// Instant loads of the default mock calculator.
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            factory: Box::new(|_, _| Arc::new(MockCalculator::new())),
            loaded: Mutex::new(FxHashMap::default()),
        }
    }

    /// Simulates model load time.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Custom calculator per `(model, gpu)`.
    pub fn with_factory(
        mut self,
        factory: impl Fn(&str, GpuId) -> Arc<dyn Calculator> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }

    /// Number of cached calculators.
    pub fn cached_count(&self) -> usize {
        self.loaded.lock().expect("loader poisoned").len()
    }
}

#[async_trait]
impl ModelLoader for MockModelLoader {
    async fn load(&self, model_name: &str, gpu: GpuId) -> Result<Arc<dyn Calculator>, CalcError> {
        let key = (model_name.to_string(), gpu);
        if let Some(calc) = self.loaded.lock().expect("loader poisoned").get(&key) {
            return Ok(Arc::clone(calc));
        }
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        let calc = (self.factory)(model_name, gpu);
        self.loaded
            .lock()
            .expect("loader poisoned")
            .insert(key, Arc::clone(&calc));
        Ok(calc)
    }

    async fn unload(&self, model_name: &str, gpu: GpuId) {
        self.loaded
            .lock()
            .expect("loader poisoned")
            .remove(&(model_name.to_string(), gpu));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimer(r: f64) -> Atoms {
        Atoms::new(
            vec!["C".into(), "C".into()],
            vec![[0.0, 0.0, 0.0], [r, 0.0, 0.0]],
            [[20.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]],
        )
    }

    #[test]
    fn test_energy_minimum_near_sigma() {
        let calc = MockCalculator::new();
        let r_min = 2.5 * 2.0f64.powf(1.0 / 6.0);
        let e_min = calc.energy(&dimer(r_min)).unwrap();
        assert!(e_min < calc.energy(&dimer(r_min - 0.2)).unwrap());
        assert!(e_min < calc.energy(&dimer(r_min + 0.2)).unwrap());
        assert!((e_min + 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_forces_match_energy_gradient() {
        let calc = MockCalculator::new();
        let r = 2.6;
        let h = 1e-6;
        let e_plus = calc.energy(&dimer(r + h)).unwrap();
        let e_minus = calc.energy(&dimer(r - h)).unwrap();
        let numeric = -(e_plus - e_minus) / (2.0 * h);

        let forces = calc.forces(&dimer(r)).unwrap();
        // Force on the second atom along +x.
        assert!((forces[1][0] - numeric).abs() < 1e-5);
        // Newton's third law.
        assert!((forces[0][0] + forces[1][0]).abs() < 1e-12);
    }

    #[test]
    fn test_compressed_pair_has_negative_stress_trace() {
        let calc = MockCalculator::new();
        let stress = calc.stress(&dimer(2.0)).unwrap();
        let trace = stress[0] + stress[1] + stress[2];
        assert!(trace < 0.0);
    }

    #[test]
    fn test_failure_modes() {
        let failing = MockCalculator::failing("boom");
        assert!(matches!(
            failing.energy(&dimer(2.5)),
            Err(CalcError::Failure(_))
        ));

        let oom = MockCalculator::out_of_memory(12_000);
        assert!(matches!(
            oom.forces(&dimer(2.5)),
            Err(CalcError::OutOfMemory { required_mb: 12_000 })
        ));
    }

    #[tokio::test]
    async fn test_loader_caches_by_model_and_gpu() {
        let loader = MockModelLoader::new();
        let a = loader.load("m1", 0).await.unwrap();
        let b = loader.load("m1", 0).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        loader.load("m1", 1).await.unwrap();
        assert_eq!(loader.cached_count(), 2);

        loader.unload("m1", 0).await;
        assert_eq!(loader.cached_count(), 1);
    }

    #[test]
    fn test_synthetic_structure_source() {
        let source = SyntheticStructureSource;
        let structure = StructureRef {
            id: "s".into(),
            n_atoms: 8,
            formula: "C8".into(),
            lattice: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
        };
        let atoms = source.load(&structure).unwrap();
        assert_eq!(atoms.len(), 8);
        assert_eq!(atoms.formula(), "C8");
    }
}
