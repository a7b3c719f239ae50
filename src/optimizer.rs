//! Geometry optimizers for a single bead.
//!
//! Both drivers move the unfrozen atoms of one bead of a [`System`] using the
//! forces from an [`Aggregator`], and stop when [`check_convergence`] is
//! satisfied or the iteration cap is reached:
//!
//! - [`steepest_descent`]: step along the force scaled by a fixed factor
//! - [`dfp`]: step along the force scaled by a DFP inverse Hessian
//! - [`ensemble_steepest_descent`]: steepest descent of the QM atoms on
//!   forces averaged over Metropolis samples of the classical environment
//!
//! Every trial step is clamped component-wise to the maximum step size. A
//! step that raises the energy by more than [`UPHILL_TOLERANCE`] is halved and
//! retried up to [`MAX_UPHILL_RETRIES`] times and then accepted anyway.
//!
//! DFP only steps along descent directions: the inverse Hessian is reset to
//! `step_scale · I` when `Fᵀ·H·F` is not positive, when an update would
//! record non-positive curvature, or when a quasi-Newton step is still
//! uphill after the halvings, in which case the iteration is redone as a
//! steepest-descent step.
//!
//! Running out of iterations is not an error: the report carries
//! [`OptStatus::IterationLimitReached`] and the bead keeps the last geometry.

use crate::aggregator::Aggregator;
use crate::alignment::aligned_rms_displacement;
use crate::config::{SimulationConfig, Thresholds};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use crate::hessian_update::{initial_inverse_hessian, update_inverse_hessian_dfp};
use crate::montecarlo::metropolis_accept;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Largest accepted energy rise of a trial step (eV).
pub const UPHILL_TOLERANCE: f64 = 1e-6;
/// Step halvings tried before an uphill step is accepted.
pub const MAX_UPHILL_RETRIES: usize = 3;

/// Lifecycle of an optimization or path run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptStatus {
    /// Still iterating
    Running,
    /// All criteria met
    Converged,
    /// Stopped at the iteration cap
    IterationLimitReached,
}

/// Outcome of one convergence test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceStatus {
    /// RMS atomic displacement since the previous iteration (Å)
    pub rmsd: f64,
    /// Largest force component (eV/Å), when forces are known
    pub max_force: Option<f64>,
    /// RMS force component (eV/Å), when forces are known
    pub rms_force: Option<f64>,
    /// Displacement criterion met
    pub rmsd_converged: bool,
    /// Max-force criterion met (true when no forces are known)
    pub max_force_converged: bool,
    /// RMS-force criterion met (true when no forces are known)
    pub rms_force_converged: bool,
}

impl ConvergenceStatus {
    /// All criteria met.
    pub fn is_converged(&self) -> bool {
        self.rmsd_converged && self.max_force_converged && self.rms_force_converged
    }
}

/// RMS displacement per atom of two flattened geometries.
pub fn rms_displacement(x_old: &DVector<f64>, x_new: &DVector<f64>) -> f64 {
    let natoms = x_old.len() / 3;
    if natoms == 0 {
        return 0.0;
    }
    ((x_new - x_old).norm_squared() / natoms as f64).sqrt()
}

/// Largest absolute component and RMS component of a force vector.
pub fn force_norms(forces: &DVector<f64>) -> (f64, f64) {
    if forces.is_empty() {
        return (0.0, 0.0);
    }
    let max = forces.amax();
    let rms = forces.norm() / (forces.len() as f64).sqrt();
    (max, rms)
}

/// Tests the displacement criterion and, when `forces` are given, the force
/// criteria. Displacement alone never suffices once forces are available.
pub fn check_convergence(
    x_old: &DVector<f64>,
    x_new: &DVector<f64>,
    forces: Option<&DVector<f64>>,
    thresholds: &Thresholds,
) -> ConvergenceStatus {
    convergence_status(rms_displacement(x_old, x_new), forces, thresholds)
}

/// [`check_convergence`] with the displacement measured after Kabsch
/// superposition, so rigid motion does not count.
pub fn check_aligned_convergence(
    x_old: &DVector<f64>,
    x_new: &DVector<f64>,
    forces: Option<&DVector<f64>>,
    thresholds: &Thresholds,
) -> ConvergenceStatus {
    convergence_status(aligned_rms_displacement(x_old, x_new), forces, thresholds)
}

/// Convergence test for the configured displacement measure.
pub fn check_configured(
    config: &SimulationConfig,
    x_old: &DVector<f64>,
    x_new: &DVector<f64>,
    forces: Option<&DVector<f64>>,
) -> ConvergenceStatus {
    if config.align_rmsd {
        check_aligned_convergence(x_old, x_new, forces, &config.thresholds())
    } else {
        check_convergence(x_old, x_new, forces, &config.thresholds())
    }
}

fn convergence_status(
    rmsd: f64,
    forces: Option<&DVector<f64>>,
    thresholds: &Thresholds,
) -> ConvergenceStatus {
    let norms = forces.map(force_norms);
    ConvergenceStatus {
        rmsd,
        max_force: norms.map(|(max, _)| max),
        rms_force: norms.map(|(_, rms)| rms),
        rmsd_converged: rmsd < thresholds.rmsd,
        max_force_converged: norms.map_or(true, |(max, _)| max < thresholds.max_force),
        rms_force_converged: norms.map_or(true, |(_, rms)| rms < thresholds.rms_force),
    }
}

/// Clamps every component of `step` to `[-max_step, max_step]`.
pub fn clamp_step(step: &DVector<f64>, max_step: f64) -> DVector<f64> {
    step.map(|v| v.clamp(-max_step, max_step))
}

/// Forces on the selected atoms, flattened like [`System::flatten_bead`].
pub fn gather_forces(forces: &[Coord], indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(
        indices.len() * 3,
        indices.iter().flat_map(|&i| forces[i].iter().copied()),
    )
}

/// Mutable iteration state of an optimizer.
#[derive(Debug, Clone)]
pub struct OptimizationState {
    /// Completed iterations
    pub iteration: usize,
    /// Current status
    pub status: OptStatus,
    /// Current flattened coordinates
    pub coords: DVector<f64>,
    /// Forces at `coords`
    pub forces: DVector<f64>,
    /// Energy at `coords`
    pub energy: f64,
    /// Coordinates of the previous iteration
    pub prev_coords: Option<DVector<f64>>,
    /// Forces of the previous iteration
    pub prev_forces: Option<DVector<f64>>,
    /// Inverse Hessian approximation (DFP only)
    pub inverse_hessian: Option<DMatrix<f64>>,
}

impl OptimizationState {
    fn new(coords: DVector<f64>, energy: f64, forces: DVector<f64>) -> Self {
        Self {
            iteration: 0,
            status: OptStatus::Running,
            coords,
            forces,
            energy,
            prev_coords: None,
            prev_forces: None,
            inverse_hessian: None,
        }
    }

    fn accept(&mut self, coords: DVector<f64>, energy: f64, forces: DVector<f64>) {
        self.prev_coords = Some(std::mem::replace(&mut self.coords, coords));
        self.prev_forces = Some(std::mem::replace(&mut self.forces, forces));
        self.energy = energy;
    }
}

/// Summary of a finished optimization.
#[derive(Debug, Clone)]
pub struct OptReport {
    /// Terminal status
    pub status: OptStatus,
    /// Iterations performed
    pub iterations: usize,
    /// Final energy (eV)
    pub energy: f64,
    /// Energy after every accepted step, starting with the initial energy
    pub energies: Vec<f64>,
    /// Last convergence test
    pub convergence: Option<ConvergenceStatus>,
    /// Final inverse Hessian (DFP only)
    pub inverse_hessian: Option<DMatrix<f64>>,
}

struct Problem<'a> {
    system: &'a mut System,
    bead: usize,
    indices: Vec<usize>,
    aggregator: &'a Aggregator,
}

impl Problem<'_> {
    fn evaluate_at(&mut self, coords: &DVector<f64>) -> Result<(f64, DVector<f64>)> {
        self.system.unflatten_bead(self.bead, &self.indices, coords)?;
        let result = self.aggregator.bead_forces(self.system, self.bead)?;
        Ok((result.energy, gather_forces(&result.forces, &self.indices)))
    }

    /// Tries `coords + direction`, halving an uphill step as needed.
    fn line_step(
        &mut self,
        state: &OptimizationState,
        direction: &DVector<f64>,
        max_step: f64,
    ) -> Result<Trial> {
        let mut scale = 1.0;
        let mut attempt = 0;
        loop {
            let coords = &state.coords + clamp_step(&(direction * scale), max_step);
            let (energy, forces) = self.evaluate_at(&coords)?;
            let rise = energy - state.energy;
            if rise <= UPHILL_TOLERANCE || attempt == MAX_UPHILL_RETRIES {
                return Ok(Trial {
                    coords,
                    energy,
                    forces,
                    uphill: rise > UPHILL_TOLERANCE,
                });
            }
            debug!("Uphill step (+{:.3e} eV), halving", rise);
            scale *= 0.5;
            attempt += 1;
        }
    }
}

/// Result of a line step.
struct Trial {
    coords: DVector<f64>,
    energy: f64,
    forces: DVector<f64>,
    /// Still uphill after every halving
    uphill: bool,
}

/// True when `H·F` points downhill.
fn is_descent(h_inv: &DMatrix<f64>, forces: &DVector<f64>) -> bool {
    let slope = forces.dot(&(h_inv * forces));
    slope > 0.0 || forces.iter().all(|&f| f == 0.0)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    SteepestDescent,
    Dfp,
}

fn run(
    system: &mut System,
    bead: usize,
    aggregator: &Aggregator,
    config: &SimulationConfig,
    flavor: Flavor,
    seed: Option<DMatrix<f64>>,
) -> Result<OptReport> {
    let indices = system.unfrozen_atoms();
    let mut problem = Problem {
        system,
        bead,
        indices,
        aggregator,
    };

    let x0 = problem.system.flatten_bead(bead, &problem.indices)?;
    let (e0, f0) = problem.evaluate_at(&x0)?;
    let mut state = OptimizationState::new(x0, e0, f0);
    if flavor == Flavor::Dfp {
        let n = state.coords.len();
        state.inverse_hessian = Some(match seed {
            Some(h_inv) if h_inv.shape() == (n, n) => {
                info!("Starting from a stored {}x{} inverse Hessian", n, n);
                h_inv
            }
            Some(h_inv) => {
                return Err(QmmmError::InvalidData(format!(
                    "stored inverse Hessian is {}x{}, bead {} has {} coordinates",
                    h_inv.nrows(),
                    h_inv.ncols(),
                    bead,
                    n
                )))
            }
            None => initial_inverse_hessian(n, config.step_scale),
        });
    }
    let mut energies = vec![e0];
    let mut convergence = None;

    while state.iteration < config.max_iterations {
        if let Some(h_inv) = &state.inverse_hessian {
            if !is_descent(h_inv, &state.forces) {
                warn!("Inverse Hessian no longer gives a descent direction, resetting");
                state.inverse_hessian = Some(initial_inverse_hessian(state.coords.len(), config.step_scale));
            }
        }
        let direction = match &state.inverse_hessian {
            Some(h_inv) => h_inv * &state.forces,
            None => &state.forces * config.step_scale,
        };
        let mut trial = problem.line_step(&state, &direction, config.max_step)?;
        if trial.uphill && state.inverse_hessian.is_some() {
            warn!(
                "Quasi-Newton step still uphill (+{:.3e} eV), retrying as steepest descent",
                trial.energy - state.energy
            );
            state.inverse_hessian = Some(initial_inverse_hessian(state.coords.len(), config.step_scale));
            trial = problem.line_step(&state, &(&state.forces * config.step_scale), config.max_step)?;
        }
        if trial.uphill {
            warn!(
                "Accepting uphill step (+{:.3e} eV) after {} halvings",
                trial.energy - state.energy,
                MAX_UPHILL_RETRIES
            );
        }
        let Trial {
            coords,
            energy,
            forces,
            ..
        } = trial;

        if let Some(h_inv) = state.inverse_hessian.take() {
            // Gradients are negative forces.
            let s = &coords - &state.coords;
            let y = &state.forces - &forces;
            state.inverse_hessian = Some(match update_inverse_hessian_dfp(&h_inv, &s, &y) {
                Some(updated) => updated,
                None => {
                    warn!("Degenerate or non-positive DFP curvature, falling back to steepest descent");
                    initial_inverse_hessian(s.len(), config.step_scale)
                }
            });
        }

        state.accept(coords, energy, forces);
        state.iteration += 1;
        energies.push(energy);

        let prev = state.prev_coords.as_ref().unwrap_or(&state.coords);
        let status = check_configured(config, prev, &state.coords, Some(&state.forces));
        info!(
            "Step {}: E = {:.8} eV, RMSD = {:.3e}, max |F| = {:.3e}, rms F = {:.3e}",
            state.iteration,
            energy,
            status.rmsd,
            status.max_force.unwrap_or(0.0),
            status.rms_force.unwrap_or(0.0)
        );
        convergence = Some(status);
        if status.is_converged() {
            state.status = OptStatus::Converged;
            break;
        }
    }

    if state.status == OptStatus::Running {
        warn!(
            "Optimization stopped after {} iterations without converging",
            state.iteration
        );
        state.status = OptStatus::IterationLimitReached;
    } else {
        info!("Optimization converged in {} iterations", state.iteration);
    }

    Ok(OptReport {
        status: state.status,
        iterations: state.iteration,
        energy: state.energy,
        energies,
        convergence,
        inverse_hessian: state.inverse_hessian,
    })
}

/// Steepest-descent minimization of `bead`.
pub fn steepest_descent(
    system: &mut System,
    bead: usize,
    aggregator: &Aggregator,
    config: &SimulationConfig,
) -> Result<OptReport> {
    info!("Steepest descent on bead {}", bead);
    run(system, bead, aggregator, config, Flavor::SteepestDescent, None)
}

/// DFP quasi-Newton minimization of `bead`. The inverse Hessian starts as
/// `step_scale · I`, so the first step equals a steepest-descent step.
pub fn dfp(
    system: &mut System,
    bead: usize,
    aggregator: &Aggregator,
    config: &SimulationConfig,
) -> Result<OptReport> {
    info!("DFP optimization on bead {}", bead);
    run(system, bead, aggregator, config, Flavor::Dfp, None)
}

/// DFP minimization of `bead` starting from a stored inverse Hessian, such
/// as the one kept in a checkpoint. The matrix must match the flattened
/// coordinates of the unfrozen atoms.
pub fn dfp_from(
    system: &mut System,
    bead: usize,
    aggregator: &Aggregator,
    config: &SimulationConfig,
    inverse_hessian: DMatrix<f64>,
) -> Result<OptReport> {
    info!("DFP optimization on bead {} (restarted)", bead);
    run(system, bead, aggregator, config, Flavor::Dfp, Some(inverse_hessian))
}

/// Metropolis sampling of the classical atoms of one bead.
struct Environment<'a> {
    aggregator: &'a Aggregator,
    bead: usize,
    quantum: Vec<usize>,
    classical: Vec<usize>,
    samples: usize,
    step: f64,
    beta: f64,
}

impl Environment<'_> {
    /// Energy and quantum-atom forces averaged over `samples` Metropolis
    /// moves of the classical atoms. Without classical atoms or samples this
    /// is a single evaluation of the current geometry.
    fn average<R: Rng + ?Sized>(&self, system: &mut System, rng: &mut R) -> Result<(f64, DVector<f64>, usize)> {
        let mut current = self.aggregator.bead_forces(system, self.bead)?;
        if self.classical.is_empty() || self.samples == 0 {
            return Ok((current.energy, gather_forces(&current.forces, &self.quantum), 0));
        }

        let unit = Uniform::new_inclusive(-self.step, self.step);
        let mut energy = 0.0;
        let mut forces = DVector::zeros(self.quantum.len() * 3);
        let mut accepted = 0;
        for _ in 0..self.samples {
            let i = self.classical[rng.gen_range(0..self.classical.len())];
            let old = system.atoms[i].position(self.bead)?;
            let shift = Coord::from_fn(|_, _| unit.sample(&mut *rng));
            system.atoms[i].set_position(self.bead, old + shift)?;

            let trial = self.aggregator.bead_forces(system, self.bead)?;
            if metropolis_accept(trial.energy - current.energy, self.beta, rng.gen()) {
                current = trial;
                accepted += 1;
            } else {
                system.atoms[i].set_position(self.bead, old)?;
            }
            energy += current.energy;
            forces += gather_forces(&current.forces, &self.quantum);
        }
        let n = self.samples as f64;
        Ok((energy / n, forces / n, accepted))
    }
}

/// Steepest descent of the unfrozen QM atoms of `bead` on ensemble-averaged
/// forces.
///
/// Before every step the unfrozen classical atoms are sampled with
/// `ensemble_samples` single-atom Metropolis moves of at most
/// `ensemble_step` per component at the run temperature, and the forces on
/// the QM atoms are averaged over the visited states. The QM atoms then move
/// by `step_scale · ⟨F⟩`, clamped to `max_step`. Averaged energies are
/// noisy, so no uphill check is made. The classical atoms keep their last
/// sampled positions.
///
/// Without classical atoms to sample this reduces to steepest descent on the
/// exact forces.
pub fn ensemble_steepest_descent<R: Rng + ?Sized>(
    system: &mut System,
    bead: usize,
    aggregator: &Aggregator,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<OptReport> {
    system.check_bead(bead)?;
    let unfrozen = system.unfrozen_atoms();
    let (quantum, classical): (Vec<usize>, Vec<usize>) = unfrozen
        .into_iter()
        .partition(|&i| system.atoms[i].region.is_quantum());
    if quantum.is_empty() {
        return Err(QmmmError::InvalidData(
            "ensemble steepest descent needs unfrozen QM atoms".to_string(),
        ));
    }
    if !config.ensemble_step.is_finite() || config.ensemble_step < 0.0 {
        return Err(QmmmError::InvalidData(format!(
            "ensemble_step must be a non-negative length, got {}",
            config.ensemble_step
        )));
    }
    info!(
        "Ensemble steepest descent on bead {}: {} QM atoms, {} sampled classical atoms, {} samples per step",
        bead,
        quantum.len(),
        classical.len(),
        config.ensemble_samples
    );

    let environment = Environment {
        aggregator,
        bead,
        quantum,
        classical,
        samples: config.ensemble_samples,
        step: config.ensemble_step,
        beta: config.beta(),
    };
    let mut coords = system.flatten_bead(bead, &environment.quantum)?;
    let (mut energy, mut forces, _) = environment.average(system, rng)?;
    let mut energies = vec![energy];
    let mut convergence = None;
    let mut status = OptStatus::Running;
    let mut iteration = 0;

    while iteration < config.max_iterations {
        let next = &coords + clamp_step(&(&forces * config.step_scale), config.max_step);
        system.unflatten_bead(bead, &environment.quantum, &next)?;
        let (e, f, accepted) = environment.average(system, rng)?;
        energy = e;
        forces = f;
        iteration += 1;
        energies.push(energy);

        let test = check_configured(config, &coords, &next, Some(&forces));
        info!(
            "Ensemble step {}: <E> = {:.8} eV, RMSD = {:.3e}, max |<F>| = {:.3e}, {} of {} samples accepted",
            iteration,
            energy,
            test.rmsd,
            test.max_force.unwrap_or(0.0),
            accepted,
            environment.samples
        );
        coords = next;
        convergence = Some(test);
        if test.is_converged() {
            status = OptStatus::Converged;
            break;
        }
    }

    if status == OptStatus::Running {
        warn!(
            "Ensemble optimization stopped after {} iterations without converging",
            iteration
        );
        status = OptStatus::IterationLimitReached;
    } else {
        info!("Ensemble optimization converged in {} iterations", iteration);
    }

    Ok(OptReport {
        status,
        iterations: iteration,
        energy,
        energies,
        convergence,
        inverse_hessian: None,
    })
}
