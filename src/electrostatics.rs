//! Classical Coulomb coupling between atomic multipoles.
//!
//! This is the adapter-free part of the QM/MM electrostatics: interactions
//! between classical charges that no external engine evaluates. Atoms are
//! represented either by their monopoles or by the six-charge grids of their
//! reduced multipoles.
//!
//! A pair `(i, j)` contributes unless both atoms are in the QM region, the
//! atoms are directly bonded, or another engine of the same
//! [`Aggregator`](crate::aggregator::Aggregator) already covers the pair's
//! class (see [`PairCoverage`]). Each unordered pair is counted once per bead.
//!
//! # Long-range cutoff
//!
//! With an [`Lrec`] cutoff every site-site Coulomb term is multiplied by
//!
//! ```text
//! s(r) = (1 − (r/R)ⁿ)ⁿ   for r < R,   0 otherwise
//! ```
//!
//! which takes the energy and its first derivative smoothly to zero at `R`.
//! A periodic box is only honoured together with a cutoff: pairs then use
//! the minimum image of the owning atoms, and `R` is capped at half the
//! shortest box edge.

use crate::constants::C2EV;
use crate::engine::{Engine, PairCoverage};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use crate::multipole::{expand_to_charges, reduce_multipole, OctCharges, OCT_GRID_SPACING};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Charge sites closer than this are coincident (Å).
pub const MIN_SITE_DISTANCE: f64 = 1e-6;
/// Smallest accepted cutoff radius (Å).
pub const LREC_MIN_CUTOFF: f64 = 0.1;
/// Smoothing exponent used when none is valid.
pub const LREC_DEFAULT_EXPONENT: u32 = 3;

/// Representation of each atom's charge distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChargeModel {
    /// One point charge at the nucleus
    #[default]
    Monopole,
    /// Six point charges reproducing the reduced multipole
    OctGrid,
}

/// Smoothed long-range electrostatic cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lrec {
    /// Cutoff radius `R` (Å)
    pub cutoff: f64,
    /// Smoothing exponent `n`
    pub exponent: u32,
}

impl Lrec {
    /// Cutoff checked against the box: at most half the shortest box edge,
    /// at least [`LREC_MIN_CUTOFF`]. An exponent of zero becomes
    /// [`LREC_DEFAULT_EXPONENT`].
    ///
    /// ```
    /// use qmmm::electrostatics::Lrec;
    ///
    /// let lrec = Lrec::new(12.0, 0, Some([20.0, 16.0, 30.0]));
    /// assert_eq!(lrec.cutoff, 8.0);
    /// assert_eq!(lrec.exponent, 3);
    /// ```
    pub fn new(cutoff: f64, exponent: u32, box_lengths: Option<[f64; 3]>) -> Self {
        let mut cutoff = cutoff;
        if let Some(lengths) = box_lengths {
            let half = 0.5 * lengths.iter().copied().fold(f64::INFINITY, f64::min);
            if cutoff > half {
                warn!(
                    "Reducing the electrostatic cutoff to {:.6} Å for the minimum image convention",
                    half
                );
                cutoff = half;
            }
        }
        if cutoff.is_nan() || cutoff <= LREC_MIN_CUTOFF {
            warn!(
                "Electrostatic cutoffs below {} Å are not allowed, using {} Å",
                LREC_MIN_CUTOFF, LREC_MIN_CUTOFF
            );
            cutoff = LREC_MIN_CUTOFF;
        }
        let exponent = if exponent == 0 {
            warn!("Invalid cutoff exponent, using {}", LREC_DEFAULT_EXPONENT);
            LREC_DEFAULT_EXPONENT
        } else {
            exponent
        };
        Self { cutoff, exponent }
    }

    /// Scale factor `s(r)`.
    pub fn scale(&self, r: f64) -> f64 {
        if r >= self.cutoff {
            return 0.0;
        }
        let n = self.exponent as i32;
        (1.0 - (r / self.cutoff).powi(n)).powi(n)
    }

    /// Derivative `ds/dr`.
    pub fn scale_derivative(&self, r: f64) -> f64 {
        if r >= self.cutoff {
            return 0.0;
        }
        let n = self.exponent as i32;
        let x = r / self.cutoff;
        let inner = 1.0 - x.powi(n);
        -(n * n) as f64 * inner.powi(n - 1) * x.powi(n - 1) / self.cutoff
    }
}

/// Point-charge Coulomb engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Electrostatics {
    /// Charge representation
    pub model: ChargeModel,
    /// Smoothed cutoff, if any
    pub lrec: Option<Lrec>,
    covered: PairCoverage,
}

impl Electrostatics {
    /// Engine using the given charge model, without a cutoff.
    pub fn new(model: ChargeModel) -> Self {
        Self {
            model,
            ..Default::default()
        }
    }

    /// Sets the smoothed cutoff.
    pub fn with_lrec(mut self, lrec: Option<Lrec>) -> Self {
        self.lrec = lrec;
        self
    }

    /// Pair classes left to other engines.
    pub fn covered(&self) -> PairCoverage {
        self.covered
    }

    /// True when the pair `(i, j)` belongs to this engine.
    pub fn pair_included(&self, system: &System, i: usize, j: usize) -> bool {
        let qi = system.atoms[i].region.is_quantum();
        let qj = system.atoms[j].region.is_quantum();
        i != j && !(qi && qj) && !system.bonded(i, j) && !self.covered.covers(qi, qj)
    }

    /// Displacement that brings atom `j` to its minimum image around atom `i`.
    fn image_shift(&self, system: &System, ri: &Coord, rj: &Coord) -> Coord {
        match (self.lrec, system.box_lengths) {
            (Some(_), Some(lengths)) => {
                let d = ri - rj;
                Coord::from_fn(|c, _| lengths[c] * (d[c] / lengths[c]).round())
            }
            _ => Coord::zeros(),
        }
    }

    /// Coulomb energy and the force on the sites of `i` from those of `j`.
    fn site_interaction(
        &self,
        (i, a): (usize, &[(f64, Coord)]),
        (j, b): (usize, &[(f64, Coord)]),
        shift: &Coord,
    ) -> Result<(f64, Coord)> {
        let mut energy = 0.0;
        let mut force = Coord::zeros();
        for (qa, ra) in a {
            for (qb, rb) in b {
                if qa * qb == 0.0 {
                    continue;
                }
                let d = ra - (rb + shift);
                let r = d.norm();
                if r.is_nan() || r < MIN_SITE_DISTANCE {
                    return Err(QmmmError::InvalidData(format!(
                        "charge sites of atoms {} and {} coincide (r = {:.3e} Å)",
                        i, j, r
                    )));
                }
                let coulomb = C2EV * qa * qb / r;
                let (e, f_r) = match &self.lrec {
                    None => (coulomb, coulomb / r),
                    Some(lrec) => (
                        coulomb * lrec.scale(r),
                        coulomb * (lrec.scale(r) / r - lrec.scale_derivative(r)),
                    ),
                };
                energy += e;
                force += d * (f_r / r);
            }
        }
        Ok((energy, force))
    }

    fn pair(
        &self,
        system: &System,
        sites: &[Vec<(f64, Coord)>],
        centers: &[Coord],
        i: usize,
        j: usize,
    ) -> Result<(f64, Coord)> {
        let shift = self.image_shift(system, &centers[i], &centers[j]);
        self.site_interaction((i, &sites[i]), (j, &sites[j]), &shift)
    }

    /// Classical electrostatic energy at `bead` (eV).
    pub fn coulomb_energy(&self, system: &System, bead: usize) -> Result<f64> {
        system.check_bead(bead)?;
        let sites = charge_sites(system, bead, self.model)?;
        let centers = system.bead_positions(bead)?;
        let per_atom = (0..system.natoms())
            .into_par_iter()
            .map(|i| -> Result<f64> {
                let mut energy = 0.0;
                for j in (0..i).filter(|&j| self.pair_included(system, i, j)) {
                    energy += self.pair(system, &sites, &centers, i, j)?.0;
                }
                Ok(energy)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(per_atom.iter().sum())
    }

    /// Classical electrostatic energy and per-atom forces at `bead`.
    ///
    /// Grid forces are applied to the owning atom; the torque from the frame
    /// dependence of the grid is not propagated to the reference atoms.
    pub fn coulomb_forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)> {
        system.check_bead(bead)?;
        let sites = charge_sites(system, bead, self.model)?;
        let centers = system.bead_positions(bead)?;
        let per_atom = (0..system.natoms())
            .into_par_iter()
            .map(|i| -> Result<(f64, Coord)> {
                let mut energy = 0.0;
                let mut force = Coord::zeros();
                for j in (0..system.natoms()).filter(|&j| self.pair_included(system, i, j)) {
                    let (e, f) = self.pair(system, &sites, &centers, i, j)?;
                    if j < i {
                        energy += e;
                    }
                    force += f;
                }
                Ok((energy, force))
            })
            .collect::<Result<Vec<_>>>()?;

        let energy = per_atom.iter().map(|(e, _)| e).sum();
        Ok((energy, per_atom.into_iter().map(|(_, f)| f).collect()))
    }
}

/// Charge sites `(charge, position)` of every atom at `bead`.
fn charge_sites(system: &System, bead: usize, model: ChargeModel) -> Result<Vec<Vec<(f64, Coord)>>> {
    (0..system.natoms())
        .into_par_iter()
        .map(|i| -> Result<Vec<(f64, Coord)>> {
            let atom = &system.atoms[i];
            let center = atom.position(bead)?;
            Ok(match model {
                ChargeModel::Monopole => vec![(atom.charge(bead)?, center)],
                ChargeModel::OctGrid => {
                    let reduced = reduce_multipole(&system.atoms, i, bead)?;
                    let OctCharges { charges, positions } =
                        expand_to_charges(&reduced, &center, OCT_GRID_SPACING);
                    charges.into_iter().zip(positions).collect()
                }
            })
        })
        .collect()
}

/// Bare electrostatic energy at `bead` (eV): no cutoff, no other engines.
pub fn coulomb_energy(system: &System, bead: usize, model: ChargeModel) -> Result<f64> {
    Electrostatics::new(model).coulomb_energy(system, bead)
}

/// Bare electrostatic energy and per-atom forces at `bead`.
pub fn coulomb_forces(system: &System, bead: usize, model: ChargeModel) -> Result<(f64, Vec<Coord>)> {
    Electrostatics::new(model).coulomb_forces(system, bead)
}

impl Engine for Electrostatics {
    fn name(&self) -> &str {
        "electrostatics"
    }

    fn energy(&self, system: &System, bead: usize) -> Result<f64> {
        self.coulomb_energy(system, bead)
    }

    fn forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)> {
        self.coulomb_forces(system, bead)
    }

    fn exclude_coulomb_pairs(&mut self, covered: PairCoverage) {
        if covered != self.covered {
            debug!("Electrostatics leaves {:?} to other engines", covered);
        }
        self.covered = covered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Atom, Region};
    use approx::assert_relative_eq;

    fn ion_pair(r: f64) -> System {
        System::new(
            vec![
                Atom::new("Na", 22.99, Coord::zeros()).with_charge(1.0),
                Atom::new("Cl", 35.45, Coord::new(r, 0.0, 0.0)).with_charge(-1.0),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn ion_pair_matches_coulomb_law() {
        let system = ion_pair(2.0);
        let e = coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap();
        assert_relative_eq!(e, -C2EV / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn forces_are_attractive_and_balanced() {
        let system = ion_pair(2.0);
        let (e, f) = coulomb_forces(&system, 0, ChargeModel::Monopole).unwrap();
        assert_relative_eq!(e, -C2EV / 2.0, epsilon = 1e-12);
        assert_relative_eq!(f[0].x, C2EV / 4.0, epsilon = 1e-12);
        assert_relative_eq!(f[0] + f[1], Coord::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn grid_of_bare_charges_matches_monopoles_far_away() {
        let system = ion_pair(50.0);
        let mono = coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap();
        let grid = coulomb_energy(&system, 0, ChargeModel::OctGrid).unwrap();
        assert_relative_eq!(mono, grid, max_relative = 1e-4);
    }

    #[test]
    fn quantum_and_bonded_pairs_are_skipped() {
        let mut system = ion_pair(2.0);
        system.atoms[0].region = Region::Qm;
        system.atoms[1].region = Region::PseudoBond;
        assert_eq!(coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap(), 0.0);

        let mut system = ion_pair(2.0);
        system.atoms[0].bonds = vec![1];
        system.atoms[1].bonds = vec![0];
        assert_eq!(coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap(), 0.0);
    }

    #[test]
    fn covered_classes_are_left_out() {
        let mut system = ion_pair(2.0);
        system.atoms[0].region = Region::Qm;
        let mut engine = Electrostatics::default();
        assert_relative_eq!(engine.energy(&system, 0).unwrap(), -C2EV / 2.0, epsilon = 1e-12);

        engine.exclude_coulomb_pairs(PairCoverage {
            quantum_classical: true,
            classical_classical: false,
        });
        assert_eq!(engine.energy(&system, 0).unwrap(), 0.0);
        let (_, forces) = engine.forces(&system, 0).unwrap();
        assert_eq!(forces, vec![Coord::zeros(); 2]);

        // Two classical atoms are still this engine's business
        system.atoms[0].region = Region::Mm;
        assert_relative_eq!(engine.energy(&system, 0).unwrap(), -C2EV / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn coincident_sites_name_the_pair() {
        let system = ion_pair(0.0);
        let err = coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap_err();
        assert!(err.to_string().contains("atoms 1 and 0"));
        assert!(coulomb_forces(&system, 0, ChargeModel::Monopole).is_err());

        // A neutral atom may sit anywhere
        let mut system = ion_pair(0.0);
        system.atoms[1].bead_mut(0).unwrap().multipole.charge = 0.0;
        assert_eq!(coulomb_energy(&system, 0, ChargeModel::Monopole).unwrap(), 0.0);
    }

    #[test]
    fn cutoff_smoothly_removes_distant_pairs() {
        let lrec = Lrec::new(5.0, 3, None);
        assert_eq!(lrec.scale(5.0), 0.0);
        assert_eq!(lrec.scale(7.0), 0.0);
        assert_relative_eq!(lrec.scale(0.0), 1.0);
        assert_relative_eq!(lrec.scale_derivative(4.999_999), 0.0, epsilon = 1e-9);

        let engine = Electrostatics::default().with_lrec(Some(lrec));
        assert_eq!(engine.energy(&ion_pair(6.0), 0).unwrap(), 0.0);
        let inside = engine.energy(&ion_pair(2.5), 0).unwrap();
        assert_relative_eq!(inside, -C2EV / 2.5 * lrec.scale(2.5), epsilon = 1e-12);
    }

    #[test]
    fn cutoff_forces_match_energy_derivative() {
        let engine = Electrostatics::default().with_lrec(Some(Lrec::new(4.0, 2, None)));
        let r = 2.2;
        let h = 1e-6;
        let (_, forces) = engine.forces(&ion_pair(r), 0).unwrap();
        let numeric = -(engine.energy(&ion_pair(r + h), 0).unwrap()
            - engine.energy(&ion_pair(r - h), 0).unwrap())
            / (2.0 * h);
        // Atom 1 sits at +r along x
        assert_relative_eq!(forces[1].x, numeric, max_relative = 1e-6);
        assert_relative_eq!(forces[0] + forces[1], Coord::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn cutoff_is_capped_and_bounded() {
        assert_eq!(Lrec::new(9.0, 4, Some([10.0, 12.0, 14.0])).cutoff, 5.0);
        assert_eq!(Lrec::new(0.05, 4, None).cutoff, LREC_MIN_CUTOFF);
        assert_eq!(Lrec::new(3.0, 0, None).exponent, LREC_DEFAULT_EXPONENT);
    }

    #[test]
    fn periodic_pairs_use_the_minimum_image() {
        let mut system = ion_pair(9.0);
        system.box_lengths = Some([10.0, 10.0, 10.0]);
        let lrec = Lrec::new(5.0, 3, system.box_lengths);
        let engine = Electrostatics::default().with_lrec(Some(lrec));
        // The image of Cl at −1 Å is the nearest one
        let e = engine.energy(&system, 0).unwrap();
        assert_relative_eq!(e, -C2EV * lrec.scale(1.0), epsilon = 1e-12);
        let (_, forces) = engine.forces(&system, 0).unwrap();
        assert!(forces[0].x < 0.0);

        // Without a cutoff the box is ignored
        assert_relative_eq!(
            Electrostatics::default().energy(&system, 0).unwrap(),
            -C2EV / 9.0,
            epsilon = 1e-12
        );
    }
}
