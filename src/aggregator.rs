//! Energy and force aggregation over engines and beads.
//!
//! An [`Aggregator`] owns the active energy providers (external QM/MM
//! engines, the classical electrostatics, test potentials) and optionally the
//! eFF parameters. It evaluates one bead or all beads, in parallel over beads.
//!
//! Each Coulomb pair is counted by exactly one provider. Whenever an engine
//! is added, the pair classes advertised by all engines are collected and
//! handed back to every engine, so the in-core electrostatics drops the
//! QM-MM pairs an embedding QM package already returns and the classical
//! pairs an MM package already returns.
//!
//! Replicated systems report averages, never sums: the physical potential of
//! a path-integral system is the mean of its bead energies, and the eFF terms
//! are divided by the replica count for the same reason. The harmonic springs
//! between adjacent path-integral slices are added by [`ring_polymer_energy`].

use crate::config::{Method, MmEngineKind, QmEngineKind, SimulationConfig};
use crate::constants::{HBAR, TO_EV};
use crate::eff::{electron_kinetic_energy, total_eff_energy, EffParams};
use crate::engine::{Engine, PairCoverage};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use log::{debug, info};
use rayon::prelude::*;

/// Energy and forces of one bead.
#[derive(Debug, Clone, PartialEq)]
pub struct BeadResult {
    /// Sum over engines (eV)
    pub energy: f64,
    /// Per-atom force (eV/Å)
    pub forces: Vec<Coord>,
}

/// Parts of the total energy of a replicated system.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyBreakdown {
    /// Bead-averaged engine energy
    pub potential: f64,
    /// Ring-polymer spring energy
    pub spring: f64,
    /// Bead-averaged eFF interaction energy
    pub eff: f64,
    /// Bead-averaged eFF kinetic energy
    pub kinetic: f64,
}

impl EnergyBreakdown {
    /// Sum of all parts.
    pub fn total(&self) -> f64 {
        self.potential + self.spring + self.eff + self.kinetic
    }
}

/// Collects engines and evaluates beads.
#[derive(Default)]
pub struct Aggregator {
    engines: Vec<Box<dyn Engine>>,
    eff: Option<EffParams>,
}

impl Aggregator {
    /// Aggregator without engines; every energy is zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an engine.
    pub fn with_engine<E: Engine + 'static>(self, engine: E) -> Self {
        self.with_boxed(Box::new(engine))
    }

    /// Adds an already boxed engine and redistributes the Coulomb pair
    /// coverage over all engines.
    pub fn with_boxed(mut self, engine: Box<dyn Engine>) -> Self {
        info!("Energy provider: {}", engine.name());
        self.engines.push(engine);
        let covered = self.coulomb_coverage();
        for engine in &mut self.engines {
            engine.exclude_coulomb_pairs(covered);
        }
        self
    }

    /// Coulomb pair classes covered by any engine.
    pub fn coulomb_coverage(&self) -> PairCoverage {
        self.engines
            .iter()
            .fold(PairCoverage::default(), |c, e| c.union(e.coulomb_coverage()))
    }

    /// Enables the eFF terms.
    pub fn with_eff(mut self, params: EffParams) -> Self {
        self.eff = Some(params);
        self
    }

    /// eFF parameters, when enabled.
    pub fn eff_params(&self) -> Option<&EffParams> {
        self.eff.as_ref()
    }

    /// Active engines in evaluation order.
    pub fn engines(&self) -> &[Box<dyn Engine>] {
        &self.engines
    }

    /// Energy of one bead summed over engines.
    pub fn bead_energy(&self, system: &System, bead: usize) -> Result<f64> {
        system.check_bead(bead)?;
        self.engines
            .iter()
            .map(|engine| engine.energy(system, bead))
            .sum()
    }

    /// Energy and forces of one bead summed over engines.
    pub fn bead_forces(&self, system: &System, bead: usize) -> Result<BeadResult> {
        system.check_bead(bead)?;
        let mut result = BeadResult {
            energy: 0.0,
            forces: vec![Coord::zeros(); system.natoms()],
        };
        for engine in &self.engines {
            let (energy, forces) = engine.forces(system, bead)?;
            if forces.len() != system.natoms() {
                return Err(QmmmError::Engine(format!(
                    "{} returned {} forces for {} atoms",
                    engine.name(),
                    forces.len(),
                    system.natoms()
                )));
            }
            result.energy += energy;
            for (total, f) in result.forces.iter_mut().zip(forces) {
                *total += f;
            }
        }
        Ok(result)
    }

    /// Energies of every bead, evaluated in parallel.
    pub fn energies(&self, system: &System) -> Result<Vec<f64>> {
        (0..system.nbeads())
            .into_par_iter()
            .map(|k| self.bead_energy(system, k))
            .collect()
    }

    /// Energies and forces of every bead, evaluated in parallel.
    pub fn forces(&self, system: &System) -> Result<Vec<BeadResult>> {
        (0..system.nbeads())
            .into_par_iter()
            .map(|k| self.bead_forces(system, k))
            .collect()
    }

    /// Engine energy averaged over beads.
    pub fn path_potential(&self, system: &System) -> Result<f64> {
        let energies = self.energies(system)?;
        Ok(energies.iter().sum::<f64>() / system.nbeads() as f64)
    }

    /// Every energy term of a path-integral system at inverse temperature
    /// `beta`. The eFF scratch accumulators are refreshed as a side effect.
    pub fn total_energy(&self, system: &mut System, beta: f64) -> Result<EnergyBreakdown> {
        let nbeads = system.nbeads() as f64;
        let mut breakdown = EnergyBreakdown {
            potential: self.path_potential(system)?,
            spring: ring_polymer_energy(system, beta),
            ..Default::default()
        };
        if let Some(params) = &self.eff {
            if !system.electrons.is_empty() {
                breakdown.eff = total_eff_energy(system, params)?;
                breakdown.kinetic = electron_kinetic_energy(&mut system.electrons, params) / nbeads;
            }
        }
        debug!("Energy breakdown: {:?}", breakdown);
        Ok(breakdown)
    }
}

/// Squared angular frequency prefactor `P/(βħ)²`, converted so that
/// `½·m·factor·|Δr|²` with `m` in amu and `Δr` in Å is in eV.
pub fn spring_prefactor(nbeads: usize, beta: f64) -> f64 {
    let omega = 1.0 / (beta * HBAR);
    nbeads as f64 * omega * omega * TO_EV
}

/// Harmonic energy between adjacent path-integral slices, cyclic over beads,
/// for atoms and electrons. Zero for a single bead.
pub fn ring_polymer_energy(system: &System, beta: f64) -> f64 {
    let nbeads = system.nbeads();
    if nbeads < 2 {
        return 0.0;
    }
    let factor = spring_prefactor(nbeads, beta);
    let ring = |positions: Vec<Coord>| -> f64 {
        (0..nbeads)
            .map(|k| (positions[k] - positions[(k + nbeads - 1) % nbeads]).norm_squared())
            .sum()
    };

    let atoms: f64 = system
        .atoms
        .par_iter()
        .map(|a| 0.5 * a.mass * factor * ring(a.beads().iter().map(|b| b.position).collect()))
        .sum();
    let electrons: f64 = system
        .electrons
        .par_iter()
        .map(|e| 0.5 * e.mass * factor * ring(e.beads().iter().map(|b| b.position).collect()))
        .sum();
    atoms + electrons
}

/// Division of the worker threads between replicas and external engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPolicy {
    /// Threads in the global pool
    pub threads: usize,
    /// CPUs granted to each external engine call
    pub engine_cpus: usize,
}

impl ThreadPolicy {
    /// Splits `available` threads. When replicas are sampled independently
    /// (PIMC, force-bias path) and an external engine is active, each
    /// replica thread gets `engine_cpus` CPUs, so the pool shrinks to
    /// `available / engine_cpus`.
    pub fn new(config: &SimulationConfig, available: usize) -> Self {
        let available = available.max(1);
        let engine_cpus = config.engine_cpus.clamp(1, available);
        let external =
            config.qm_engine != QmEngineKind::None || config.mm_engine != MmEngineKind::None;
        let per_replica = matches!(config.method, Method::Pimc | Method::ForceBiasNeb);
        let threads = if config.is_replicated() && per_replica && external {
            (available / engine_cpus).max(1)
        } else {
            available
        };
        Self {
            threads,
            engine_cpus,
        }
    }

    /// Installs the global rayon pool.
    pub fn install(&self) -> std::result::Result<(), rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build_global()
    }
}
