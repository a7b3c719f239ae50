//! Electron force field (eFF) energy model.
//!
//! Electrons are spherical Gaussian wavepackets with a position, a radius, a
//! spin and a type tag (see [`Electron`]). Their energy has three parts:
//!
//! - screened Coulomb interactions with atoms and with each other
//! - Pauli repulsion between electrons that share a type tag, built from the
//!   overlap `S` of the two wavepackets and their kinetic-energy mismatch `T`
//! - a confinement kinetic energy `∝ 1/radius²` per electron
//!
//! Every interaction is evaluated once per bead. Totals over beads are
//! averages: [`total_eff_energy`] divides the bead sum by the replica count.
//!
//! Reference: Su and Goddard, Phys. Rev. Lett. 99, 185003 (2007).

use crate::constants::{BOHR_RAD, C2EV, ELEC_MASS, HAR_TO_EV, HUGE_NUM, SQRT2};
use crate::error::Result;
use crate::geometry::{Atom, Electron, System};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Tunable eFF parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffParams {
    /// Valence-bond mixing between symmetric and antisymmetric spin orbitals
    pub rho: f64,
    /// Radius scaling in the Pauli term
    pub sbar: f64,
    /// Distance scaling in the Pauli term
    pub rbar: f64,
    /// Electrostatic cutoff (Å)
    pub cutoff: f64,
    /// Smallest allowed electron radius (Å)
    pub radius_min: f64,
    /// Largest allowed electron radius (Å)
    pub radius_max: f64,
    /// Divide the kinetic energy by `nbeads^scale_power`
    pub scale_kinetic: bool,
    /// Exponent of the kinetic scaling
    pub scale_power: f64,
}

impl Default for EffParams {
    fn default() -> Self {
        Self {
            rho: 1.0,
            sbar: 1.0,
            rbar: 1.0,
            cutoff: 15.0,
            radius_min: 0.01,
            radius_max: 25.0,
            scale_kinetic: false,
            scale_power: 0.5,
        }
    }
}

/// Converts `1/Å²` kinetic terms to eV.
const KINETIC_TO_EV: f64 = HAR_TO_EV * BOHR_RAD * BOHR_RAD;

/// Coulomb energy between a point charge and a Gaussian of the given
/// radius, or between two Gaussians with the combined radius
/// `sqrt(r1² + r2²)`. `dist2` is the squared separation.
fn screened_coulomb(qq: f64, dist2: f64, radius: f64) -> f64 {
    if dist2 == 0.0 {
        C2EV * qq * (8.0 / PI).sqrt() / radius
    } else {
        let r = dist2.sqrt();
        C2EV * qq / r * libm::erf(SQRT2 * r / radius)
    }
}

/// Energy between `atom`'s monopole and `electron` at `bead`.
///
/// Zero beyond the cutoff; finite (`∝ 1/radius`) at zero separation.
pub fn atom_electron_energy(
    atom: &Atom,
    electron: &Electron,
    bead: usize,
    params: &EffParams,
) -> Result<f64> {
    let nucleus = atom.bead(bead)?;
    let wave = electron.bead(bead)?;
    let dist2 = (nucleus.position - wave.position).norm_squared();
    if dist2 > params.cutoff * params.cutoff {
        return Ok(0.0);
    }
    Ok(screened_coulomb(
        nucleus.multipole.charge * electron.charge,
        dist2,
        wave.radius(),
    ))
}

/// Pauli repulsion between two electrons at `bead`.
///
/// Exactly zero when the type tags differ. Within one tag, same-spin pairs
/// use the symmetric valence-bond form and opposite-spin pairs the
/// antisymmetric one.
pub fn pauli_energy(e1: &Electron, e2: &Electron, bead: usize, params: &EffParams) -> Result<f64> {
    if e1.kind != e2.kind {
        return Ok(0.0);
    }
    let b1 = e1.bead(bead)?;
    let b2 = e2.bead(bead)?;
    let (r1, r2) = (b1.radius(), b2.radius());
    let dist2 = (b1.position - b2.position).norm_squared();
    let sum2 = r1 * r1 + r2 * r2;
    let sbar2 = params.sbar * params.sbar;
    let rbar2 = params.rbar * params.rbar;

    let s = (2.0 / (r1 / r2 + r2 / r1)).powf(1.5) * (-rbar2 * dist2 / (sum2 * sbar2)).exp();

    let mismatch = (6.0 * sbar2 * sum2 - 4.0 * rbar2 * dist2) / (sbar2 * sum2).powi(2);
    let t = (1.5 / sbar2 * (1.0 / (r1 * r1) + 1.0 / (r2 * r2)) - mismatch) * KINETIC_TO_EV;

    let s2 = s * s;
    let energy = if e1.spin == e2.spin {
        (s2 / (1.0 - s2) + (1.0 - params.rho) * s2 / (1.0 + s2)) * t
    } else {
        -params.rho * s2 * t / (1.0 + s2)
    };
    Ok(energy)
}

/// Coulomb plus Pauli energy between two electrons at `bead`.
///
/// Coincident electrons return [`HUGE_NUM`] so that any step or move
/// producing them is rejected. The result is symmetric in its arguments.
pub fn electron_electron_energy(
    e1: &Electron,
    e2: &Electron,
    bead: usize,
    params: &EffParams,
) -> Result<f64> {
    let b1 = e1.bead(bead)?;
    let b2 = e2.bead(bead)?;
    let dist2 = (b1.position - b2.position).norm_squared();
    if dist2 > params.cutoff * params.cutoff {
        return Ok(0.0);
    }
    if dist2 == 0.0 {
        // The finite self-energy limit exists but is not used here.
        return Ok(HUGE_NUM);
    }
    let combined = (b1.radius().powi(2) + b2.radius().powi(2)).sqrt();
    let coulomb = screened_coulomb(e1.charge * e2.charge, dist2, combined);
    Ok(coulomb + pauli_energy(e1, e2, bead, params)?)
}

/// Confinement kinetic energy summed over electrons and beads.
///
/// Each electron's share is left in its scratch accumulator. With
/// `scale_kinetic` every term is divided by `nbeads^scale_power`.
pub fn electron_kinetic_energy(electrons: &mut [Electron], params: &EffParams) -> f64 {
    electrons
        .par_iter_mut()
        .map(|electron| {
            let scale = if params.scale_kinetic {
                (electron.nbeads() as f64).powf(params.scale_power)
            } else {
                1.0
            };
            let mass_ratio = ELEC_MASS / electron.mass;
            electron.energy = electron
                .beads()
                .iter()
                .map(|b| 1.5 / (b.radius() * b.radius()) * mass_ratio * KINETIC_TO_EV / scale)
                .sum();
            electron.energy
        })
        .sum()
}

/// Total eFF interaction energy of the system, averaged over beads.
///
/// Atom-electron terms accumulate on the atom, and each unordered electron
/// pair accumulates once on its higher-index electron. The kinetic energy is
/// not included; see [`electron_kinetic_energy`].
pub fn total_eff_energy(system: &mut System, params: &EffParams) -> Result<f64> {
    let nbeads = system.nbeads();
    let System {
        atoms, electrons, ..
    } = system;

    let pair_sums = {
        let view: &[Electron] = electrons;
        atoms.par_iter_mut().try_for_each(|atom| -> Result<()> {
            let mut sum = 0.0;
            for electron in view {
                for k in 0..nbeads {
                    sum += atom_electron_energy(atom, electron, k, params)?;
                }
            }
            atom.energy = sum;
            Ok(())
        })?;

        (0..view.len())
            .into_par_iter()
            .map(|i| -> Result<f64> {
                let mut sum = 0.0;
                for k in 0..nbeads {
                    for j in 0..i {
                        sum += electron_electron_energy(&view[i], &view[j], k, params)?;
                    }
                }
                Ok(sum)
            })
            .collect::<Result<Vec<f64>>>()?
    };
    for (electron, sum) in electrons.iter_mut().zip(pair_sums) {
        electron.energy = sum;
    }

    let total: f64 =
        atoms.iter().map(|a| a.energy).sum::<f64>() + electrons.iter().map(|e| e.energy).sum::<f64>();
    debug!("eFF interaction energy: {:.6} eV over {} beads", total, nbeads);
    Ok(total / nbeads as f64)
}
