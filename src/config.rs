//! Simulation configuration.
//!
//! This module defines the immutable configuration value that is built once
//! before any core component runs and then passed by reference everywhere:
//!
//! - [`SimulationConfig`]: all run parameters
//! - [`Method`]: which driver the run uses
//! - [`QmEngineKind`] / [`MmEngineKind`]: the active external engines
//! - [`Ensemble`]: fixed-volume or fixed-pressure sampling
//! - [`Thresholds`]: optimizer convergence criteria derived from the RMSD tolerance
//!
//! Settings validation (conflicting options, missing regions) happens before a
//! configuration reaches the core; nothing here re-checks it.

use crate::constants::K_BOLTZ;
use serde::{Deserialize, Serialize};

/// Max-force tolerance as a multiple of the RMSD tolerance.
pub const MAX_FORCE_FACTOR: f64 = 20.0;
/// RMS-force tolerance as a multiple of the RMSD tolerance.
pub const RMS_FORCE_FACTOR: f64 = 10.0;

/// Quantum engine selection. Exactly one variant is active per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QmEngineKind {
    /// Gaussian
    Gaussian,
    /// PSI4
    Psi4,
    /// NWChem
    NwChem,
    /// No QM engine (pure MM or model potentials)
    #[default]
    None,
}

/// Molecular mechanics engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MmEngineKind {
    /// TINKER
    Tinker,
    /// LAMMPS
    Lammps,
    /// No MM engine
    #[default]
    None,
}

/// Thermodynamic ensemble for sampling runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Ensemble {
    /// Constant volume
    #[default]
    Nvt,
    /// Constant pressure (enables Monte Carlo volume moves)
    Npt,
}

/// Driver selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Method {
    /// Energy of every bead, no geometry change
    #[default]
    SinglePoint,
    /// Steepest descent minimization
    SteepestDescent,
    /// Davidon-Fletcher-Powell quasi-Newton minimization
    Dfp,
    /// Steepest descent of the QM atoms on forces averaged over sampled
    /// classical environments
    EnsembleSd,
    /// Climbing-image nudged elastic band
    Neb,
    /// Path-integral Monte Carlo
    Pimc,
    /// Force-bias Monte Carlo over independent path images
    ForceBiasNeb,
    /// Velocity-Verlet molecular dynamics
    Dynamics,
}

/// Convergence thresholds for geometry optimizations.
///
/// Only the RMSD tolerance is user supplied; the force tolerances follow
/// from it by fixed multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// RMS atomic displacement between iterations (Å)
    pub rmsd: f64,
    /// Largest force component (eV/Å)
    pub max_force: f64,
    /// RMS force (eV/Å)
    pub rms_force: f64,
}

impl Thresholds {
    /// Builds the full set from an RMSD tolerance.
    ///
    /// ```
    /// use qmmm::config::Thresholds;
    ///
    /// let t = Thresholds::from_rmsd(0.001);
    /// assert!((t.max_force - 0.02).abs() < 1e-15);
    /// assert!((t.rms_force - 0.01).abs() < 1e-15);
    /// ```
    pub fn from_rmsd(rmsd: f64) -> Self {
        Self {
            rmsd,
            max_force: MAX_FORCE_FACTOR * rmsd,
            rms_force: RMS_FORCE_FACTOR * rmsd,
        }
    }
}

/// Complete configuration for a simulation.
///
/// # Examples
///
/// ```
/// use qmmm::config::{Method, SimulationConfig};
///
/// let mut config = SimulationConfig::default();
/// config.method = Method::Neb;
/// config.nbeads = 7;
/// config.spring_constant = 2.0;
/// assert!(config.beta() > 0.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Driver for this run
    pub method: Method,
    /// Active QM engine
    pub qm_engine: QmEngineKind,
    /// Active MM engine
    pub mm_engine: MmEngineKind,
    /// Number of replicas (path-integral slices or path images)
    pub nbeads: usize,
    /// Temperature (K)
    pub temperature: f64,
    /// External pressure (atm)
    pub pressure: f64,
    /// Sampling ensemble
    pub ensemble: Ensemble,
    /// Elastic band spring constant (eV/Å²)
    pub spring_constant: f64,
    /// RMSD tolerance from which all optimizer thresholds derive (Å)
    pub opt_tolerance: f64,
    /// Steepest-descent step scale (Å² / eV)
    pub step_scale: f64,
    /// Largest displacement of any coordinate in one step (Å)
    pub max_step: f64,
    /// Optimizer and path iteration cap
    pub max_iterations: usize,
    /// Keep the first and last path images fixed
    pub frozen_ends: bool,
    /// Steps between progress reports and trajectory frames
    pub print_every: usize,
    /// Equilibration steps (MC and MD)
    pub eq_steps: usize,
    /// Production steps (MC and MD)
    pub prod_steps: usize,
    /// Target Monte Carlo acceptance ratio
    pub acceptance_ratio: f64,
    /// MD time step (fs)
    pub time_step: f64,
    /// Berendsen thermostat time constant (fs)
    pub tau_temp: f64,
    /// Orthorhombic periodic box lengths (Å), if periodic
    pub box_lengths: Option<[f64; 3]>,
    /// CPUs handed to each external engine call
    pub engine_cpus: usize,
    /// Smoothed electrostatic cutoff radius (Å); no cutoff when absent
    pub lrec_cutoff: Option<f64>,
    /// Exponent of the cutoff smoothing function
    pub lrec_exponent: u32,
    /// Atoms that define NEB tangents, spring lengths and path RMSD; every
    /// unfrozen atom when absent
    pub neb_atoms: Option<Vec<usize>>,
    /// Superimpose geometries before the displacement convergence test
    pub align_rmsd: bool,
    /// Environment samples per ensemble steepest-descent step
    pub ensemble_samples: usize,
    /// Displacement range of environment samples (Å)
    pub ensemble_step: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            method: Method::SinglePoint,
            qm_engine: QmEngineKind::None,
            mm_engine: MmEngineKind::None,
            nbeads: 1,
            temperature: 298.15,
            pressure: 1.0,
            ensemble: Ensemble::Nvt,
            spring_constant: 1.0,
            opt_tolerance: 1e-3,
            step_scale: 0.01,
            max_step: 0.1,
            max_iterations: 200,
            frozen_ends: true,
            print_every: 10,
            eq_steps: 1000,
            prod_steps: 1000,
            acceptance_ratio: 0.5,
            time_step: 0.5,
            tau_temp: 100.0,
            box_lengths: None,
            engine_cpus: 1,
            lrec_cutoff: None,
            lrec_exponent: 3,
            neb_atoms: None,
            align_rmsd: false,
            ensemble_samples: 50,
            ensemble_step: 0.05,
        }
    }
}

impl SimulationConfig {
    /// Inverse temperature `1/(k_B T)` in 1/eV.
    pub fn beta(&self) -> f64 {
        1.0 / (K_BOLTZ * self.temperature)
    }

    /// Convergence thresholds for this run.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from_rmsd(self.opt_tolerance)
    }

    /// True when more than one replica is carried.
    pub fn is_replicated(&self) -> bool {
        self.nbeads > 1
    }

    /// True when the replicas are path-integral slices rather than path images.
    pub fn is_path_integral(&self) -> bool {
        matches!(self.method, Method::Pimc)
    }

    /// True when the replicas form a reaction path.
    pub fn is_reaction_path(&self) -> bool {
        matches!(self.method, Method::Neb | Method::ForceBiasNeb)
    }
}
