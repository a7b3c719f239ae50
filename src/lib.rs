#![warn(missing_docs)]

//! qmmm - QM/MM Coupling and Replica Optimization Core
//!
//! `qmmm` couples external electronic-structure and force-field engines
//! through one shared atom/electron data model, and implements the physics
//! those engines do not provide itself.
//!
//! # Overview
//!
//! Every atom and explicit electron carries one record per replica (bead).
//! Beads are either path-integral imaginary-time slices or the images of a
//! reaction path. On top of that store the crate provides:
//!
//! - **Multipole electrostatics**: local-frame reduction of Cartesian
//!   multipoles and their expansion into six point charges
//! - **eFF**: electrons as Gaussian wavepackets with screened Coulomb,
//!   Pauli and kinetic terms
//! - **Optimizers**: steepest descent, DFP and ensemble-averaged steepest
//!   descent for a single bead
//! - **Reaction paths**: climbing-image nudged elastic band
//! - **Sampling**: path-integral and force-bias path Monte Carlo
//! - **Dynamics**: velocity Verlet with a Berendsen thermostat
//!
//! # Units
//!
//! | Quantity | Unit |
//! |----------|------|
//! | Length | Å |
//! | Energy | eV |
//! | Force | eV/Å |
//! | Mass | amu |
//! | Time | fs |
//! | Charge | e |
//!
//! # Quick Start
//!
//! ```
//! use qmmm::aggregator::Aggregator;
//! use qmmm::electrostatics::Electrostatics;
//! use qmmm::geometry::{Atom, Coord, System};
//!
//! fn main() -> qmmm::error::Result<()> {
//!     let system = System::new(
//!         vec![
//!             Atom::new("Na", 22.99, Coord::zeros()).with_charge(1.0),
//!             Atom::new("Cl", 35.45, Coord::new(2.8, 0.0, 0.0)).with_charge(-1.0),
//!         ],
//!         vec![],
//!     )?;
//!     let aggregator = Aggregator::new().with_engine(Electrostatics::default());
//!     let energy = aggregator.bead_energy(&system, 0)?;
//!     assert!(energy < 0.0);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`geometry`] - Atoms, electrons, beads and replica management
//! - [`multipole`] - Local frames, reduced multipoles, six-charge grids
//! - [`electrostatics`] - Classical point-charge Coulomb engine
//! - [`eff`] - Electron force field
//! - [`engine`] - Engine capability trait and external engine wrapper
//! - [`aggregator`] - Energy/force summation over engines and beads
//! - [`optimizer`] - Steepest descent, DFP and ensemble steepest descent
//! - [`alignment`] - Kabsch superposition for displacement tests
//! - [`reaction_path`] - Climbing-image NEB
//! - [`montecarlo`] - PIMC and force-bias path sampling
//! - [`dynamics`] - Velocity-Verlet integration
//! - [`io`] / [`checkpoint`] - Trajectories, restart files, checkpoints
//!
//! # References
//!
//! - Su, J. T.; Goddard, W. A. *Phys. Rev. Lett.* **2007**, 99, 185003.
//! - Henkelman, G.; Uberuaga, B. P.; Jónsson, H. *J. Chem. Phys.* **2000**, 113, 9901.
//! - Stone, A. J. *The Theory of Intermolecular Forces*, 2nd ed.; OUP, 2013.

pub mod aggregator;
pub mod alignment;
/// Restart functionality
pub mod checkpoint;
pub mod config;
/// Physical constants and unit conversions
pub mod constants;
pub mod dynamics;
pub mod eff;
pub mod electrostatics;
pub mod engine;
pub mod error;
pub mod geometry;
/// DFP inverse Hessian updates
pub mod hessian_update;
pub mod io;
/// Linear synchronous transit interpolation
pub mod lst;
pub mod montecarlo;
pub mod multipole;
pub mod optimizer;
/// Climbing-image NEB
pub mod reaction_path;
/// Ambient settings management
pub mod settings;

pub use aggregator::Aggregator;
pub use config::{Method, SimulationConfig};
pub use error::{QmmmError, Result};
pub use geometry::{Atom, Coord, Electron, Region, System};
