//! Climbing-image nudged elastic band optimization of reaction paths.
//!
//! This module relaxes an ordered chain of beads (path images) between a
//! reactant and a product toward the minimum energy path, and drives the
//! highest-energy image to the saddle point between them.
//!
//! # Theoretical Background
//!
//! ## Nudged Elastic Band (NEB)
//!
//! Every interior image `i` feels two forces:
//!
//! 1. **True force, perpendicular part**: drives the image toward the minimum
//!    energy path without sliding along it
//! 2. **Spring force, tangential part**: keeps the images evenly spaced
//!
//! ```text
//! F_i = (F_i − (F_i·τ̂_i) τ̂_i) + k (|R_{i+1} − R_i| − |R_i − R_{i−1}|) τ̂_i
//! ```
//!
//! ## Climbing Image
//!
//! The highest-energy interior image is released from the springs and has
//! its tangential true force inverted, so it climbs along the path while
//! relaxing perpendicular to it:
//!
//! ```text
//! F_ts = F_ts − 2 (F_ts·τ̂_ts) τ̂_ts
//! ```
//!
//! The climbing image is re-selected after every force evaluation.
//!
//! ## Tangent Estimate
//!
//! The tangent at image `i` points toward the higher-energy neighbour. At a
//! local extremum both neighbour vectors are mixed with weights given by the
//! larger and smaller energy differences, which keeps the tangent continuous
//! where the path changes direction.
//!
//! # Convergence
//!
//! The path is converged when, for every moving image, the residual force
//! (perpendicular force of an interior image, full climbing force of the
//! transition-state image, true force of a free end) is below the max-force
//! and RMS-force tolerances, the spring force is below the RMS-force
//! tolerance, and no image moved more than the RMSD tolerance in the last
//! step. Running out of iterations returns the last path with
//! [`OptStatus::IterationLimitReached`].
//!
//! # Path Atoms
//!
//! `neb_atoms` restricts the tangents, spring lengths and displacement test
//! to a subset of the atoms, typically the reacting centre. The other
//! unfrozen atoms still move, but feel their plain true force. With
//! `align_rmsd` each image is superimposed on its previous geometry before
//! the displacement is measured.
//!
//! # References
//!
//! - Henkelman, G.; Jónsson, H. J. Chem. Phys. 2000, 113, 9978-9985.
//! - Henkelman, G.; Uberuaga, B. P.; Jónsson, H. J. Chem. Phys. 2000, 113, 9901-9904.

use crate::aggregator::Aggregator;
use crate::alignment::aligned_rms_displacement;
use crate::config::{SimulationConfig, Thresholds};
use crate::error::{QmmmError, Result};
use crate::geometry::System;
use crate::lst::validate_path;
use crate::optimizer::{clamp_step, force_norms, gather_forces, rms_displacement, OptStatus};
use log::{debug, info, warn};
use nalgebra::DVector;

/// Forces acting on one path image.
#[derive(Debug, Clone, PartialEq)]
pub struct NudgedForce {
    /// Force used to move the image
    pub effective: DVector<f64>,
    /// Force the convergence test looks at
    pub residual: DVector<f64>,
    /// Spring force along the tangent (zero for the climbing image and ends)
    pub spring: DVector<f64>,
}

impl NudgedForce {
    fn zeros(n: usize) -> Self {
        Self {
            effective: DVector::zeros(n),
            residual: DVector::zeros(n),
            spring: DVector::zeros(n),
        }
    }
}

/// Path-wide convergence measures of one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathConvergence {
    /// Largest per-image RMS displacement since the previous iteration (Å)
    pub rmsd: f64,
    /// Largest residual force component over all moving images (eV/Å)
    pub max_force: f64,
    /// Largest per-image RMS residual force (eV/Å)
    pub rms_force: f64,
    /// Largest per-image RMS spring force (eV/Å)
    pub rms_spring: f64,
    /// Every criterion met
    pub converged: bool,
}

/// Summary of a finished path optimization.
#[derive(Debug, Clone)]
pub struct NebReport {
    /// Terminal status
    pub status: OptStatus,
    /// Iterations performed
    pub iterations: usize,
    /// Final energy of every image (eV)
    pub energies: Vec<f64>,
    /// Final climbing image
    pub ts_bead: usize,
    /// Barrier from the first image to the climbing image (eV)
    pub barrier: f64,
    /// Last convergence test
    pub convergence: Option<PathConvergence>,
}

/// Unit tangent at an interior image from its neighbours and energies.
///
/// Returns a zero vector when the neighbours coincide with the image.
///
/// # Examples
///
/// ```
/// use nalgebra::DVector;
/// use qmmm::reaction_path::path_tangent;
///
/// let prev = DVector::from_vec(vec![0.0, 0.0, 0.0]);
/// let current = DVector::from_vec(vec![1.0, 0.0, 0.0]);
/// let next = DVector::from_vec(vec![1.0, 1.0, 0.0]);
///
/// // Uphill toward `next`: the tangent follows the forward segment
/// let tau = path_tangent(&prev, &current, &next, [0.0, 1.0, 2.0]);
/// assert!((tau[1] - 1.0).abs() < 1e-12);
/// ```
pub fn path_tangent(
    prev: &DVector<f64>,
    current: &DVector<f64>,
    next: &DVector<f64>,
    energies: [f64; 3],
) -> DVector<f64> {
    let [e_prev, e, e_next] = energies;
    let forward = next - current;
    let backward = current - prev;

    let tangent = if e_next > e && e > e_prev {
        forward
    } else if e_next < e && e < e_prev {
        backward
    } else {
        let dv_max = (e_next - e).abs().max((e_prev - e).abs());
        let dv_min = (e_next - e).abs().min((e_prev - e).abs());
        if e_next > e_prev {
            forward * dv_max + backward * dv_min
        } else {
            forward * dv_min + backward * dv_max
        }
    };

    let norm = tangent.norm();
    if norm > 0.0 {
        tangent / norm
    } else {
        tangent
    }
}

/// Index of the highest-energy interior image.
pub fn climbing_image(energies: &[f64]) -> Option<usize> {
    if energies.len() < 3 {
        return None;
    }
    (1..energies.len() - 1).max_by(|&a, &b| energies[a].total_cmp(&energies[b]))
}

/// NEB forces on every image.
///
/// `images` and `true_forces` are the flattened coordinates and forces of
/// the moving atoms, one entry per bead. End images feel their true force
/// unless `frozen_ends` is set, in which case their forces are zero.
pub fn nudged_forces(
    images: &[DVector<f64>],
    energies: &[f64],
    true_forces: &[DVector<f64>],
    ts_bead: usize,
    spring_constant: f64,
    frozen_ends: bool,
) -> Vec<NudgedForce> {
    let nbeads = images.len();
    let n = images.first().map_or(0, |x| x.len());

    (0..nbeads)
        .map(|k| {
            let force = &true_forces[k];
            if k == 0 || k == nbeads - 1 {
                return if frozen_ends {
                    NudgedForce::zeros(n)
                } else {
                    NudgedForce {
                        effective: force.clone(),
                        residual: force.clone(),
                        spring: DVector::zeros(n),
                    }
                };
            }

            let tau = path_tangent(
                &images[k - 1],
                &images[k],
                &images[k + 1],
                [energies[k - 1], energies[k], energies[k + 1]],
            );
            let along = force.dot(&tau);

            if k == ts_bead {
                let climbing = force - &tau * (2.0 * along);
                return NudgedForce {
                    effective: climbing.clone(),
                    residual: climbing,
                    spring: DVector::zeros(n),
                };
            }

            let perpendicular = force - &tau * along;
            let stretch = (&images[k + 1] - &images[k]).norm() - (&images[k] - &images[k - 1]).norm();
            let spring = &tau * (spring_constant * stretch);
            NudgedForce {
                effective: &perpendicular + &spring,
                residual: perpendicular,
                spring,
            }
        })
        .collect()
}

/// Positions in the flattened moving-atom vector that belong to path atoms.
///
/// `indices` are the moving atoms. Without a subset every slot counts.
pub fn path_slots(indices: &[usize], neb_atoms: Option<&[usize]>, natoms: usize) -> Result<Vec<usize>> {
    let Some(subset) = neb_atoms else {
        return Ok((0..indices.len() * 3).collect());
    };
    if let Some(&bad) = subset.iter().find(|&&i| i >= natoms) {
        return Err(QmmmError::InvalidData(format!(
            "neb_atoms names atom {} but the system has {} atoms",
            bad, natoms
        )));
    }
    let slots: Vec<usize> = indices
        .iter()
        .enumerate()
        .filter(|(_, i)| subset.contains(*i))
        .flat_map(|(p, _)| 3 * p..3 * p + 3)
        .collect();
    if slots.is_empty() {
        return Err(QmmmError::InvalidData(
            "none of the neb_atoms is free to move".to_string(),
        ));
    }
    Ok(slots)
}

fn select(x: &DVector<f64>, slots: &[usize]) -> DVector<f64> {
    DVector::from_iterator(slots.len(), slots.iter().map(|&s| x[s]))
}

/// Copy of `x` with every slot outside `slots` zeroed.
fn masked(x: &DVector<f64>, slots: &[usize]) -> DVector<f64> {
    let mut out = DVector::zeros(x.len());
    for &s in slots {
        out[s] = x[s];
    }
    out
}

fn path_convergence(
    previous: &[DVector<f64>],
    current: &[DVector<f64>],
    forces: &[NudgedForce],
    moving: &[usize],
    thresholds: &Thresholds,
    align: bool,
) -> PathConvergence {
    let mut rmsd: f64 = 0.0;
    let mut max_force: f64 = 0.0;
    let mut rms_force: f64 = 0.0;
    let mut rms_spring: f64 = 0.0;
    for &k in moving {
        let displacement = if align {
            aligned_rms_displacement(&previous[k], &current[k])
        } else {
            rms_displacement(&previous[k], &current[k])
        };
        rmsd = rmsd.max(displacement);
        let (max, rms) = force_norms(&forces[k].residual);
        max_force = max_force.max(max);
        rms_force = rms_force.max(rms);
        rms_spring = rms_spring.max(force_norms(&forces[k].spring).1);
    }
    PathConvergence {
        rmsd,
        max_force,
        rms_force,
        rms_spring,
        converged: rmsd < thresholds.rmsd
            && max_force < thresholds.max_force
            && rms_force < thresholds.rms_force
            && rms_spring < thresholds.rms_force,
    }
}

/// Climbing-image NEB over every bead of `system`.
///
/// Bead 0 is the reactant and the last bead the product. The interior beads
/// must already hold an initial guess (see [`crate::lst::interpolate_path`]);
/// coincident consecutive beads are rejected before the first force call.
///
/// # Algorithm Steps
///
/// 1. Evaluate energies and forces of all beads in parallel
/// 2. Select the climbing image and record it on the system
/// 3. Build tangents and nudged forces
/// 4. Test convergence against the previous iteration
/// 5. Move every moving image by `step_scale · F`, clamped per component
///    to `max_step`
///
/// # Errors
///
/// Fails with [`QmmmError::InvalidData`] for fewer than three beads, a
/// degenerate initial path or `neb_atoms` that name no moving atom, and
/// propagates engine and geometry errors.
pub fn climbing_image_neb(
    system: &mut System,
    aggregator: &Aggregator,
    config: &SimulationConfig,
) -> Result<NebReport> {
    let nbeads = system.nbeads();
    if nbeads < 3 {
        return Err(QmmmError::InvalidData(format!(
            "a reaction path needs at least 3 beads, got {}",
            nbeads
        )));
    }
    validate_path(system)?;

    let indices = system.unfrozen_atoms();
    let slots = path_slots(&indices, config.neb_atoms.as_deref(), system.natoms())?;
    let subset = slots.len() < indices.len() * 3;
    let thresholds = config.thresholds();
    let moving: Vec<usize> = if config.frozen_ends {
        (1..nbeads - 1).collect()
    } else {
        (0..nbeads).collect()
    };
    info!(
        "Climbing-image NEB: {} beads, k = {} eV/Å², {} moving atoms, ends {}",
        nbeads,
        config.spring_constant,
        indices.len(),
        if config.frozen_ends { "frozen" } else { "relaxed" }
    );
    if subset {
        info!("Path geometry restricted to {} atoms", slots.len() / 3);
    }

    let mut status = OptStatus::Running;
    let mut iteration = 0;
    let mut previous: Option<Vec<DVector<f64>>> = None;
    let mut convergence = None;

    let (energies, ts_bead) = loop {
        let results = aggregator.forces(system)?;
        let energies: Vec<f64> = results.iter().map(|r| r.energy).collect();
        let ts_bead = climbing_image(&energies).unwrap_or(1);
        if system.ts_bead() != Some(ts_bead) {
            debug!("Climbing image moved to bead {}", ts_bead);
        }
        system.set_ts_bead(ts_bead)?;

        let images = (0..nbeads)
            .map(|k| system.flatten_bead(k, &indices))
            .collect::<Result<Vec<_>>>()?;
        let true_forces: Vec<DVector<f64>> = results
            .iter()
            .map(|r| gather_forces(&r.forces, &indices))
            .collect();
        let path: Vec<DVector<f64>> = images.iter().map(|x| select(x, &slots)).collect();
        let tangent_images: Vec<DVector<f64>> = if subset {
            images.iter().map(|x| masked(x, &slots)).collect()
        } else {
            images.clone()
        };
        let forces = nudged_forces(
            &tangent_images,
            &energies,
            &true_forces,
            ts_bead,
            config.spring_constant,
            config.frozen_ends,
        );

        if let Some(prev) = &previous {
            let test = path_convergence(prev, &path, &forces, &moving, &thresholds, config.align_rmsd);
            info!(
                "NEB step {}: E_ts = {:.8} eV (bead {}), RMSD = {:.3e}, max |F| = {:.3e}, rms F = {:.3e}, rms F_spring = {:.3e}",
                iteration,
                energies[ts_bead],
                ts_bead,
                test.rmsd,
                test.max_force,
                test.rms_force,
                test.rms_spring
            );
            convergence = Some(test);
            if test.converged {
                status = OptStatus::Converged;
                break (energies, ts_bead);
            }
        }
        if iteration == config.max_iterations {
            break (energies, ts_bead);
        }

        for &k in &moving {
            let step = clamp_step(&(&forces[k].effective * config.step_scale), config.max_step);
            system.unflatten_bead(k, &indices, &(&images[k] + step))?;
        }
        previous = Some(path);
        iteration += 1;
    };

    if status == OptStatus::Running {
        warn!(
            "Reaction path stopped after {} iterations without converging",
            iteration
        );
        status = OptStatus::IterationLimitReached;
    } else {
        info!("Reaction path converged in {} iterations", iteration);
    }

    let barrier = energies[ts_bead] - energies[0];
    info!(
        "Transition state at bead {}, barrier {:.6} eV",
        ts_bead, barrier
    );
    Ok(NebReport {
        status,
        iterations: iteration,
        energies,
        ts_bead,
        barrier,
        convergence,
    })
}
