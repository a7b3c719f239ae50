// Analytic model engines shared by the integration tests
#![allow(dead_code)]

use qmmm::engine::Engine;
use qmmm::error::Result;
use qmmm::geometry::{Atom, Coord, System};

/// `Σ ½·k_d·(r_d − c_d)²` per atom, with per-axis stiffness.
pub struct Harmonic {
    pub center: Coord,
    pub stiffness: Coord,
}

impl Harmonic {
    pub fn isotropic(k: f64) -> Self {
        Self {
            center: Coord::zeros(),
            stiffness: Coord::new(k, k, k),
        }
    }
}

impl Engine for Harmonic {
    fn name(&self) -> &str {
        "harmonic"
    }

    fn energy(&self, system: &System, bead: usize) -> Result<f64> {
        Ok(self.forces(system, bead)?.0)
    }

    fn forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)> {
        let positions = system.bead_positions(bead)?;
        let mut energy = 0.0;
        let mut forces = Vec::with_capacity(positions.len());
        for p in &positions {
            let d = p - self.center;
            energy += 0.5 * d.component_mul(&d).dot(&self.stiffness);
            forces.push(-d.component_mul(&self.stiffness));
        }
        Ok((energy, forces))
    }
}

/// Double well `(x² − 1)² + 5y² + 5z²` along x for every atom, with minima
/// at x = ±1 and a saddle at the origin.
pub struct DoubleWell;

impl Engine for DoubleWell {
    fn name(&self) -> &str {
        "double-well"
    }

    fn energy(&self, system: &System, bead: usize) -> Result<f64> {
        Ok(self.forces(system, bead)?.0)
    }

    fn forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)> {
        let positions = system.bead_positions(bead)?;
        let mut energy = 0.0;
        let mut forces = Vec::with_capacity(positions.len());
        for p in &positions {
            let w = p.x * p.x - 1.0;
            energy += w * w + 5.0 * (p.y * p.y + p.z * p.z);
            forces.push(Coord::new(-4.0 * p.x * w, -10.0 * p.y, -10.0 * p.z));
        }
        Ok((energy, forces))
    }
}

pub fn single_atom(mass: f64, position: Coord) -> System {
    System::new(vec![Atom::new("X", mass, position)], vec![]).unwrap()
}
