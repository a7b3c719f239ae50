//! Velocity-Verlet molecular dynamics with a Berendsen thermostat.
//!
//! One bead of a [`System`] is propagated with forces from an
//! [`Aggregator`]. Units follow the rest of the crate: Å, fs, amu, eV, so
//! accelerations are `F / (m · AMU_ANG2_FS2_TO_EV)` in Å/fs².
//!
//! A run has an equilibration phase and a production phase with their own
//! step counts. Both use the same stepping; only production writes frames
//! to the trajectory sink.

use crate::aggregator::Aggregator;
use crate::config::SimulationConfig;
use crate::constants::{AMU_ANG2_FS2_TO_EV, K_BOLTZ};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use crate::io::TrajectorySink;
use log::{info, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// Averages over the printed samples of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MdSummary {
    /// Steps taken
    pub steps: usize,
    /// Samples averaged
    pub samples: usize,
    /// Mean potential energy (eV)
    pub average_energy: f64,
    /// Mean temperature (K)
    pub average_temperature: f64,
    /// Temperature after the last step (K)
    pub final_temperature: f64,
}

/// Kinetic energy (eV) of the given velocities (Å/fs).
pub fn kinetic_energy(system: &System, velocities: &[Coord]) -> f64 {
    system
        .atoms
        .iter()
        .zip(velocities)
        .map(|(atom, v)| 0.5 * atom.mass * v.norm_squared() * AMU_ANG2_FS2_TO_EV)
        .sum()
}

/// Instantaneous temperature `2·KE / (3·N·k_B)` over the unfrozen atoms.
pub fn temperature(system: &System, velocities: &[Coord]) -> f64 {
    let n = system.atoms.iter().filter(|a| !a.frozen).count();
    if n == 0 {
        return 0.0;
    }
    2.0 * kinetic_energy(system, velocities) / (3.0 * n as f64 * K_BOLTZ)
}

/// Berendsen velocity scale `sqrt(1 + dt/τ · (T0/T − 1))`.
///
/// ```
/// use qmmm::dynamics::berendsen_scale;
///
/// assert_eq!(berendsen_scale(300.0, 300.0, 0.5, 100.0), 1.0);
/// assert!(berendsen_scale(600.0, 300.0, 0.5, 100.0) < 1.0);
/// ```
pub fn berendsen_scale(current: f64, target: f64, dt: f64, tau: f64) -> f64 {
    if current <= 0.0 || tau <= 0.0 {
        return 1.0;
    }
    (1.0 + dt / tau * (target / current - 1.0)).max(0.0).sqrt()
}

/// Maxwell-Boltzmann velocities at `target` K with zero total momentum.
/// Frozen atoms get zero velocity.
pub fn maxwell_boltzmann<R: Rng + ?Sized>(system: &System, target: f64, rng: &mut R) -> Result<Vec<Coord>> {
    let mut velocities = Vec::with_capacity(system.natoms());
    for atom in &system.atoms {
        if atom.frozen {
            velocities.push(Coord::zeros());
            continue;
        }
        let sigma = (K_BOLTZ * target / (atom.mass * AMU_ANG2_FS2_TO_EV)).sqrt();
        let normal = Normal::new(0.0, sigma)
            .map_err(|e| QmmmError::InvalidData(format!("velocity distribution: {}", e)))?;
        velocities.push(Coord::from_fn(|_, _| normal.sample(rng)));
    }

    let (momentum, mass) = system
        .atoms
        .iter()
        .zip(&velocities)
        .filter(|(a, _)| !a.frozen)
        .fold((Coord::zeros(), 0.0), |(p, m), (a, v)| (p + v * a.mass, m + a.mass));
    if mass > 0.0 {
        let drift = momentum / mass;
        for (atom, v) in system.atoms.iter().zip(velocities.iter_mut()) {
            if !atom.frozen {
                *v -= drift;
            }
        }
    }
    Ok(velocities)
}

/// Velocity-Verlet integrator for one bead.
pub struct VelocityVerlet<'a> {
    aggregator: &'a Aggregator,
    config: &'a SimulationConfig,
    bead: usize,
}

impl<'a> VelocityVerlet<'a> {
    /// Integrator for `bead`, using the time step, thermostat and step
    /// counts of `config`.
    pub fn new(aggregator: &'a Aggregator, config: &'a SimulationConfig, bead: usize) -> Self {
        Self {
            aggregator,
            config,
            bead,
        }
    }

    fn accelerations(&self, system: &System, forces: &[Coord]) -> Vec<Coord> {
        system
            .atoms
            .par_iter()
            .zip(forces.par_iter())
            .map(|(atom, f)| {
                if atom.frozen {
                    Coord::zeros()
                } else {
                    f / (atom.mass * AMU_ANG2_FS2_TO_EV)
                }
            })
            .collect()
    }

    /// Runs `steps` steps, updating positions and `velocities` in place.
    ///
    /// Energy and temperature are sampled on the first step and every
    /// `print_every` steps after it; in production those samples are also
    /// written to `sink`.
    pub fn run_phase(
        &self,
        system: &mut System,
        velocities: &mut [Coord],
        steps: usize,
        production: bool,
        mut sink: Option<&mut dyn TrajectorySink>,
    ) -> Result<MdSummary> {
        if velocities.len() != system.natoms() {
            return Err(QmmmError::InvalidData(format!(
                "{} velocities for {} atoms",
                velocities.len(),
                system.natoms()
            )));
        }
        let bead = self.bead;
        let dt = self.config.time_step;
        let print_every = self.config.print_every.max(1);
        info!(
            "Starting {} ({} steps, dt = {} fs)",
            if production { "production run" } else { "equilibration" },
            steps,
            dt
        );

        let mut result = self.aggregator.bead_forces(system, bead)?;
        let mut accel = self.accelerations(system, &result.forces);
        let mut summary = MdSummary {
            steps,
            ..Default::default()
        };
        let mut energy_sum = 0.0;
        let mut temperature_sum = 0.0;

        for n in 0..steps {
            system
                .atoms
                .par_iter_mut()
                .zip(velocities.par_iter())
                .zip(accel.par_iter())
                .try_for_each(|((atom, v), a)| -> Result<()> {
                    if !atom.frozen {
                        atom.bead_mut(bead)?.position += v * dt + a * (0.5 * dt * dt);
                    }
                    Ok(())
                })?;

            result = self.aggregator.bead_forces(system, bead)?;
            let next = self.accelerations(system, &result.forces);
            velocities
                .par_iter_mut()
                .zip(accel.par_iter().zip(next.par_iter()))
                .for_each(|(v, (a0, a1))| *v += (a0 + a1) * (0.5 * dt));
            accel = next;

            let t = temperature(system, velocities);
            let lambda = berendsen_scale(t, self.config.temperature, dt, self.config.tau_temp);
            velocities.par_iter_mut().for_each(|v| *v *= lambda);
            let t = t * lambda * lambda;
            summary.final_temperature = t;

            if n == 0 || (n + 1) % print_every == 0 {
                energy_sum += result.energy;
                temperature_sum += t;
                summary.samples += 1;
                info!(
                    "MD step {}: T = {:.2} K, E = {:.8} eV",
                    n + 1,
                    t,
                    result.energy
                );
                if production {
                    if let Some(sink) = sink.as_deref_mut() {
                        sink.write_frame(
                            system,
                            &format!("MD step {} T = {:.2} K E = {:.8} eV", n + 1, t, result.energy),
                        )?;
                    }
                }
            }
        }

        if summary.samples > 0 {
            summary.average_energy = energy_sum / summary.samples as f64;
            summary.average_temperature = temperature_sum / summary.samples as f64;
        } else {
            warn!("No MD samples collected");
        }
        info!(
            "MD {} complete: average energy {:.8} eV, average temperature {:.2} K",
            if production { "production" } else { "equilibration" },
            summary.average_energy,
            summary.average_temperature
        );
        Ok(summary)
    }

    /// Draws initial velocities, then runs equilibration and production.
    pub fn run<R: Rng + ?Sized>(
        &self,
        system: &mut System,
        rng: &mut R,
        sink: Option<&mut dyn TrajectorySink>,
    ) -> Result<(MdSummary, MdSummary)> {
        let mut velocities = maxwell_boltzmann(system, self.config.temperature, rng)?;
        let equilibration =
            self.run_phase(system, &mut velocities, self.config.eq_steps, false, None)?;
        let production = self.run_phase(system, &mut velocities, self.config.prod_steps, true, sink)?;
        Ok((equilibration, production))
    }
}
