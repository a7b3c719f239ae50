//! Linear synchronous transit seeding of reaction paths.
//!
//! A reaction path needs a starting guess for its interior beads. Without a
//! bead restart file, the interior beads are placed on straight lines between
//! the reactant (first bead) and the product (last bead), evenly spaced.

use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use log::info;

/// Places the product geometry on the last bead, then interpolates.
pub fn seed_path(system: &mut System, product: &[Coord]) -> Result<()> {
    let last = system.nbeads().saturating_sub(1);
    system.set_bead_positions(last, product)?;
    interpolate_path(system)
}

/// Linear interpolation of every interior bead between the first and last
/// beads. Frozen atoms are interpolated too; they simply never move later.
pub fn interpolate_path(system: &mut System) -> Result<()> {
    let nbeads = system.nbeads();
    if nbeads < 3 {
        return Ok(());
    }
    let first = system.bead_positions(0)?;
    let last = system.bead_positions(nbeads - 1)?;

    for k in 1..nbeads - 1 {
        let t = k as f64 / (nbeads - 1) as f64;
        let positions: Vec<Coord> = first
            .iter()
            .zip(&last)
            .map(|(a, b)| a * (1.0 - t) + b * t)
            .collect();
        system.set_bead_positions(k, &positions)?;
    }

    info!(
        "Interpolated {} interior beads, path length {:.4} Å",
        nbeads - 2,
        path_length(system)?
    );
    Ok(())
}

/// Sum of the distances between consecutive beads (Å).
pub fn path_length(system: &System) -> Result<f64> {
    let mut total = 0.0;
    let mut previous = system.bead_positions(0)?;
    for k in 1..system.nbeads() {
        let current = system.bead_positions(k)?;
        let segment: f64 = previous
            .iter()
            .zip(&current)
            .map(|(a, b)| (a - b).norm_squared())
            .sum();
        total += segment.sqrt();
        previous = current;
    }
    Ok(total)
}

/// Fails when consecutive beads coincide, which leaves the path tangent
/// undefined.
pub fn validate_path(system: &System) -> Result<()> {
    for k in 1..system.nbeads() {
        let a = system.bead_positions(k - 1)?;
        let b = system.bead_positions(k)?;
        let gap: f64 = a.iter().zip(&b).map(|(p, q)| (p - q).norm_squared()).sum();
        if gap < 1e-16 {
            return Err(QmmmError::InvalidData(format!(
                "beads {} and {} of the reaction path coincide",
                k - 1,
                k
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Atom, ReplicaKind};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn path(nbeads: usize) -> System {
        let mut system = System::new(vec![Atom::new("H", 1.008, Coord::zeros())], vec![]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        system
            .init_replicas(nbeads, ReplicaKind::ReactionPath, &mut rng)
            .unwrap();
        system
    }

    #[test]
    fn interior_beads_are_evenly_spaced() {
        let mut system = path(5);
        seed_path(&mut system, &[Coord::new(4.0, 0.0, 0.0)]).unwrap();
        for k in 0..5 {
            assert_relative_eq!(system.atoms[0].position(k).unwrap().x, k as f64);
        }
        assert_relative_eq!(path_length(&system).unwrap(), 4.0);
        assert!(validate_path(&system).is_ok());
    }

    #[test]
    fn coincident_beads_are_rejected() {
        let system = path(3);
        assert!(validate_path(&system).is_err());
    }
}
