//! Energy and force providers.
//!
//! Every provider implements [`Engine`]: energies in eV and forces in eV/Å
//! for one bead of a [`System`]. The aggregator holds a list of engines and
//! evaluates beads in parallel, so engines must be `Send + Sync`.
//!
//! External QM and MM packages are reached through [`ExternalEngine`]. The
//! core writes a JSON request holding the atoms of the engine's region and
//! the point charges it should see, runs the configured wrapper command, and
//! reads back a JSON result. Package-specific input formats and output
//! parsing belong to the wrapper.
//!
//! # Request and result files
//!
//! ```text
//! <work_dir>/<engine>_<bead>.json      request written by the core
//! <work_dir>/<engine>_<bead>.out.json  result written by the wrapper
//! ```
//!
//! The result carries `energy` (eV), optional `forces` (eV/Å, one triple per
//! requested atom) and, for optimization requests, optional `positions`.
//!
//! # Electrostatic bookkeeping
//!
//! A QM package sees the MM multipoles as embedded point charges, so its
//! energy already holds the QM-MM Coulomb terms; an MM package evaluates
//! every classical pair itself. Engines advertise those pair classes through
//! [`Engine::coulomb_coverage`], and the aggregator hands the union to every
//! engine through [`Engine::exclude_coulomb_pairs`] so that the in-core
//! electrostatics only sums what nobody else does.

use crate::config::{MmEngineKind, QmEngineKind};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, Region, System};
use crate::multipole::{expand_to_charges, reduce_multipole, OCT_GRID_SPACING};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Classes of Coulomb pairs, split by whether each atom is quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairCoverage {
    /// One quantum and one classical atom
    pub quantum_classical: bool,
    /// Two classical atoms
    pub classical_classical: bool,
}

impl PairCoverage {
    /// Classes covered by either side.
    pub fn union(self, other: Self) -> Self {
        Self {
            quantum_classical: self.quantum_classical || other.quantum_classical,
            classical_classical: self.classical_classical || other.classical_classical,
        }
    }

    /// True when a pair of atoms with the given quantum flags is covered.
    /// Quantum-quantum pairs never are; they belong to the QM engine alone.
    ///
    /// ```
    /// use qmmm::engine::PairCoverage;
    ///
    /// let qm = PairCoverage { quantum_classical: true, classical_classical: false };
    /// assert!(qm.covers(true, false));
    /// assert!(qm.covers(false, true));
    /// assert!(!qm.covers(false, false));
    /// ```
    pub fn covers(&self, quantum_a: bool, quantum_b: bool) -> bool {
        match (quantum_a, quantum_b) {
            (true, true) => false,
            (false, false) => self.classical_classical,
            _ => self.quantum_classical,
        }
    }
}

/// Capability interface shared by all energy providers.
pub trait Engine: Send + Sync {
    /// Short name used in logs and file names.
    fn name(&self) -> &str;

    /// Energy of `bead` (eV).
    fn energy(&self, system: &System, bead: usize) -> Result<f64>;

    /// Energy and per-atom forces of `bead`. The force vector has one entry
    /// per atom in the system; atoms outside the engine's region get zero.
    fn forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)>;

    /// Coulomb pair classes already contained in this engine's energy.
    fn coulomb_coverage(&self) -> PairCoverage {
        PairCoverage::default()
    }

    /// Receives the pair classes covered by the engines it is combined
    /// with. Engines that sum Coulomb pairs themselves must skip them.
    fn exclude_coulomb_pairs(&mut self, _covered: PairCoverage) {}

    /// Relaxes `bead` with the engine's own optimizer and returns the final
    /// energy. Engines without one report an error.
    fn optimize(&self, _system: &mut System, _bead: usize) -> Result<f64> {
        Err(QmmmError::Engine(format!(
            "{} does not provide a native optimizer",
            self.name()
        )))
    }
}

/// How to launch an external package wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEngineConfig {
    /// Wrapper executable
    pub command: String,
    /// Arguments placed before the request path
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory for request and result files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Which atoms an external engine treats explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineScope {
    /// QM and pseudo-bond atoms, embedded in the point charges of the rest
    Quantum,
    /// Every atom, with region tags so the package can zero QM terms
    Classical,
}

#[derive(Debug, Serialize)]
struct RequestAtom<'a> {
    index: usize,
    element: &'a str,
    mm_type: &'a str,
    region: Region,
    charge: f64,
    position: [f64; 3],
}

#[derive(Debug, Serialize)]
struct PointCharge {
    charge: f64,
    position: [f64; 3],
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    engine: &'a str,
    bead: usize,
    task: Task,
    atoms: Vec<RequestAtom<'a>>,
    point_charges: Vec<PointCharge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Task {
    Energy,
    Forces,
    Optimize,
}

#[derive(Debug, Deserialize)]
struct EngineResult {
    energy: f64,
    #[serde(default)]
    forces: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    positions: Option<Vec<[f64; 3]>>,
}

/// An external package driven through a wrapper command.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    name: String,
    scope: EngineScope,
    config: ExternalEngineConfig,
}

impl ExternalEngine {
    /// Engine for the selected QM package; `None` when no QM engine is active.
    pub fn qm(kind: QmEngineKind, config: ExternalEngineConfig) -> Option<Self> {
        let name = match kind {
            QmEngineKind::Gaussian => "gaussian",
            QmEngineKind::Psi4 => "psi4",
            QmEngineKind::NwChem => "nwchem",
            QmEngineKind::None => return None,
        };
        Some(Self::new(name, EngineScope::Quantum, config))
    }

    /// Engine for the selected MM package; `None` when no MM engine is active.
    pub fn mm(kind: MmEngineKind, config: ExternalEngineConfig) -> Option<Self> {
        let name = match kind {
            MmEngineKind::Tinker => "tinker",
            MmEngineKind::Lammps => "lammps",
            MmEngineKind::None => return None,
        };
        Some(Self::new(name, EngineScope::Classical, config))
    }

    /// Engine with an explicit name and scope.
    pub fn new(name: impl Into<String>, scope: EngineScope, config: ExternalEngineConfig) -> Self {
        Self {
            name: name.into(),
            scope,
            config,
        }
    }

    /// Atoms handed to the package at `bead`.
    fn selected_atoms(&self, system: &System) -> Vec<usize> {
        system
            .atoms
            .iter()
            .enumerate()
            .filter(|(_, a)| self.scope == EngineScope::Classical || a.region.is_quantum())
            .map(|(i, _)| i)
            .collect()
    }

    fn request_path(&self, bead: usize) -> PathBuf {
        self.config.work_dir.join(format!("{}_{}.json", self.name, bead))
    }

    fn result_path(&self, bead: usize) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{}_{}.out.json", self.name, bead))
    }

    fn write_request(&self, system: &System, bead: usize, task: Task, path: &Path) -> Result<()> {
        system.check_bead(bead)?;
        let mut atoms = Vec::new();
        for i in self.selected_atoms(system) {
            let atom = &system.atoms[i];
            atoms.push(RequestAtom {
                index: i,
                element: &atom.element,
                mm_type: &atom.mm_type,
                region: atom.region,
                charge: atom.charge(bead)?,
                position: atom.position(bead)?.into(),
            });
        }

        // The QM region sees every classical multipole as a six-charge grid;
        // boundary atoms are left out.
        let mut point_charges = Vec::new();
        if self.scope == EngineScope::Quantum {
            for (i, atom) in system.atoms.iter().enumerate() {
                if atom.region != Region::Mm {
                    continue;
                }
                let reduced = reduce_multipole(&system.atoms, i, bead)?;
                let grid = expand_to_charges(&reduced, &atom.position(bead)?, OCT_GRID_SPACING);
                for (q, p) in grid.charges.iter().zip(grid.positions.iter()) {
                    point_charges.push(PointCharge {
                        charge: *q,
                        position: (*p).into(),
                    });
                }
            }
        }

        let request = Request {
            engine: &self.name,
            bead,
            task,
            atoms,
            point_charges,
        };
        fs::write(path, serde_json::to_string_pretty(&request)?)?;
        Ok(())
    }

    fn run(&self, request: &Path) -> Result<()> {
        debug!("Running {} on {}", self.config.command, request.display());
        let output = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(request)
            .output()?;
        if !output.status.success() {
            return Err(QmmmError::Engine(format!(
                "{} failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn call(&self, system: &System, bead: usize, task: Task) -> Result<EngineResult> {
        let request = self.request_path(bead);
        self.write_request(system, bead, task, &request)?;
        self.run(&request)?;

        let result_path = self.result_path(bead);
        let content = fs::read_to_string(&result_path).map_err(|e| {
            QmmmError::Engine(format!(
                "{} result {} unreadable: {}",
                self.name,
                result_path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Scatters per-request triples back onto system atom indices.
    fn scatter(&self, system: &System, values: &[[f64; 3]], what: &str) -> Result<Vec<(usize, Coord)>> {
        let selected = self.selected_atoms(system);
        if values.len() != selected.len() {
            return Err(QmmmError::Engine(format!(
                "{} returned {} {}, expected {}",
                self.name,
                values.len(),
                what,
                selected.len()
            )));
        }
        Ok(selected
            .into_iter()
            .zip(values.iter().map(|v| Coord::from(*v)))
            .collect())
    }
}

impl Engine for ExternalEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn energy(&self, system: &System, bead: usize) -> Result<f64> {
        Ok(self.call(system, bead, Task::Energy)?.energy)
    }

    fn coulomb_coverage(&self) -> PairCoverage {
        match self.scope {
            EngineScope::Quantum => PairCoverage {
                quantum_classical: true,
                classical_classical: false,
            },
            EngineScope::Classical => PairCoverage {
                quantum_classical: false,
                classical_classical: true,
            },
        }
    }

    fn forces(&self, system: &System, bead: usize) -> Result<(f64, Vec<Coord>)> {
        let result = self.call(system, bead, Task::Forces)?;
        let raw = result
            .forces
            .ok_or_else(|| QmmmError::Engine(format!("{} returned no forces", self.name)))?;
        let mut forces = vec![Coord::zeros(); system.natoms()];
        for (i, f) in self.scatter(system, &raw, "forces")? {
            forces[i] = f;
        }
        Ok((result.energy, forces))
    }

    fn optimize(&self, system: &mut System, bead: usize) -> Result<f64> {
        let result = self.call(system, bead, Task::Optimize)?;
        let raw = result
            .positions
            .ok_or_else(|| QmmmError::Engine(format!("{} returned no positions", self.name)))?;
        for (i, p) in self.scatter(system, &raw, "positions")? {
            if !system.atoms[i].frozen {
                system.atoms[i].set_position(bead, p)?;
            }
        }
        Ok(result.energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Atom;

    fn embedded_pair() -> System {
        let qm = Atom::new("O", 15.999, Coord::zeros()).with_region(Region::Qm);
        let mm = Atom::new("Na", 22.99, Coord::new(3.0, 0.0, 0.0)).with_charge(1.0);
        let edge = Atom::new("C", 12.011, Coord::new(0.0, 3.0, 0.0))
            .with_region(Region::Boundary)
            .with_charge(0.2);
        System::new(vec![qm, mm, edge], vec![]).unwrap()
    }

    fn config(dir: &Path) -> ExternalEngineConfig {
        ExternalEngineConfig {
            command: "true".to_string(),
            args: vec![],
            work_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn no_engine_kind_builds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExternalEngine::qm(QmEngineKind::None, config(dir.path())).is_none());
        assert!(ExternalEngine::mm(MmEngineKind::None, config(dir.path())).is_none());
    }

    #[test]
    fn quantum_request_embeds_mm_grids_only() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExternalEngine::qm(QmEngineKind::Psi4, config(dir.path())).unwrap();
        let system = embedded_pair();
        let path = dir.path().join("req.json");
        engine.write_request(&system, 0, Task::Forces, &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["task"], "forces");
        assert_eq!(value["atoms"].as_array().unwrap().len(), 1);
        let charges = value["point_charges"].as_array().unwrap();
        assert_eq!(charges.len(), 6);
        let total: f64 = charges.iter().map(|c| c["charge"].as_f64().unwrap()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn packages_report_the_pairs_they_sum() {
        let dir = tempfile::tempdir().unwrap();
        let qm = ExternalEngine::qm(QmEngineKind::NwChem, config(dir.path())).unwrap();
        let mm = ExternalEngine::mm(MmEngineKind::Tinker, config(dir.path())).unwrap();
        assert!(qm.coulomb_coverage().quantum_classical);
        assert!(!qm.coulomb_coverage().classical_classical);
        assert!(mm.coulomb_coverage().classical_classical);

        let both = qm.coulomb_coverage().union(mm.coulomb_coverage());
        assert!(both.covers(true, false) && both.covers(false, false));
        assert!(!both.covers(true, true));
    }

    #[test]
    fn forces_scatter_onto_selected_atoms() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ExternalEngine::qm(QmEngineKind::Gaussian, config(dir.path())).unwrap();
        let system = embedded_pair();
        fs::write(
            engine.result_path(0),
            r#"{"energy": -2.5, "forces": [[0.1, 0.0, -0.1]]}"#,
        )
        .unwrap();

        let (energy, forces) = engine.forces(&system, 0).unwrap();
        assert_eq!(energy, -2.5);
        assert_eq!(forces.len(), 3);
        assert_eq!(forces[0], Coord::new(0.1, 0.0, -0.1));
        assert_eq!(forces[1], Coord::zeros());
    }
}
