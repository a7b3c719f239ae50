//! Core geometry and replica data structures.
//!
//! This module owns every per-replica array in a simulation:
//!
//! - [`Atom`]: mass, region, connectivity and one [`Bead`] per replica
//! - [`Electron`]: an eFF Gaussian wavepacket with one [`ElectronBead`] per replica
//! - [`System`]: all atoms and electrons plus the shared replica count
//!
//! Each bead bundles the position, multipole and point-charge grid of one
//! replica, so the three always stay aligned. The bead vectors are private;
//! only [`System::init_replicas`] changes their length. Everything else reads
//! or writes individual beads through bounds-checked accessors.
//!
//! All positions are in Angstrom and masses in amu.

use crate::constants::ELEC_MASS;
use crate::error::{QmmmError, Result};
use crate::multipole::{Multipole, OctCharges};
use nalgebra::{DVector, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Cartesian position or displacement (Å).
pub type Coord = Vector3<f64>;

/// Region classification of an atom. Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Region {
    /// Treated by the QM engine
    Qm,
    /// Treated by the MM engine
    #[default]
    Mm,
    /// QM/MM link atom (capped in the QM calculation)
    PseudoBond,
    /// MM atom next to the QM region whose charge is excluded from QM
    Boundary,
}

impl Region {
    /// True for atoms that appear in the QM calculation.
    pub fn is_quantum(&self) -> bool {
        matches!(self, Region::Qm | Region::PseudoBond)
    }
}

/// One replica of an atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Bead {
    /// Position (Å)
    pub position: Coord,
    /// Multipole record
    #[serde(default)]
    pub multipole: Multipole,
    /// Point-charge grid built from the multipole
    #[serde(default)]
    pub charges: OctCharges,
}

/// An atom with all of its replicas.
///
/// # Examples
///
/// ```
/// use qmmm::geometry::{Atom, Region};
/// use nalgebra::Vector3;
///
/// let atom = Atom::new("O", 15.999, Vector3::new(0.0, 0.0, 0.0))
///     .with_region(Region::Qm)
///     .with_charge(-0.8);
/// assert_eq!(atom.nbeads(), 1);
/// assert_eq!(atom.charge(0).unwrap(), -0.8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Element symbol
    pub element: String,
    /// Force-field atom type
    #[serde(default)]
    pub mm_type: String,
    /// Numeric force-field class
    #[serde(default)]
    pub type_id: usize,
    /// Mass (amu)
    pub mass: f64,
    /// Region classification
    #[serde(default)]
    pub region: Region,
    /// Held fixed by every driver
    #[serde(default)]
    pub frozen: bool,
    /// Bonded partners (indices into the system)
    #[serde(default)]
    pub bonds: Vec<usize>,
    beads: Vec<Bead>,
    /// Scratch energy accumulator (eV)
    #[serde(skip)]
    pub energy: f64,
}

impl Atom {
    /// Creates an unfrozen MM atom with a single bead at `position`.
    pub fn new(element: impl Into<String>, mass: f64, position: Coord) -> Self {
        Self {
            element: element.into(),
            mm_type: String::new(),
            type_id: 0,
            mass,
            region: Region::default(),
            frozen: false,
            bonds: Vec::new(),
            beads: vec![Bead {
                position,
                ..Default::default()
            }],
            energy: 0.0,
        }
    }

    /// Sets the region.
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    /// Sets the monopole of every bead.
    pub fn with_charge(mut self, charge: f64) -> Self {
        for bead in &mut self.beads {
            bead.multipole.charge = charge;
        }
        self
    }

    /// Sets the multipole of every bead.
    pub fn with_multipole(mut self, multipole: Multipole) -> Self {
        for bead in &mut self.beads {
            bead.multipole = multipole.clone();
        }
        self
    }

    /// Marks the atom as frozen.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Number of replicas.
    pub fn nbeads(&self) -> usize {
        self.beads.len()
    }

    /// All replicas, read only.
    pub fn beads(&self) -> &[Bead] {
        &self.beads
    }

    /// All replicas, mutable but not resizable.
    pub fn beads_mut(&mut self) -> &mut [Bead] {
        &mut self.beads
    }

    /// Replica `k`.
    pub fn bead(&self, k: usize) -> Result<&Bead> {
        let nbeads = self.beads.len();
        self.beads
            .get(k)
            .ok_or(QmmmError::BeadIndexOutOfRange { bead: k, nbeads })
    }

    /// Replica `k`, mutable.
    pub fn bead_mut(&mut self, k: usize) -> Result<&mut Bead> {
        let nbeads = self.beads.len();
        self.beads
            .get_mut(k)
            .ok_or(QmmmError::BeadIndexOutOfRange { bead: k, nbeads })
    }

    /// Position of replica `k`.
    pub fn position(&self, k: usize) -> Result<Coord> {
        self.bead(k).map(|b| b.position)
    }

    /// Moves replica `k`.
    pub fn set_position(&mut self, k: usize, position: Coord) -> Result<()> {
        self.bead_mut(k)?.position = position;
        Ok(())
    }

    /// Monopole charge at replica `k`.
    pub fn charge(&self, k: usize) -> Result<f64> {
        self.bead(k).map(|b| b.multipole.charge)
    }

    /// Mean position over all replicas.
    pub fn centroid(&self) -> Coord {
        let sum: Coord = self.beads.iter().map(|b| b.position).sum();
        sum / self.beads.len().max(1) as f64
    }

    fn resize_beads(&mut self, nbeads: usize) {
        let template = self.beads.first().cloned().unwrap_or_default();
        self.beads.truncate(nbeads);
        self.beads.resize(nbeads, template);
    }
}

/// One replica of an electron.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectronBead {
    /// Centre of the Gaussian (Å)
    pub position: Coord,
    radius: f64,
}

impl ElectronBead {
    /// Creates a replica; the radius is taken as given.
    pub fn new(position: Coord, radius: f64) -> Self {
        Self { position, radius }
    }

    /// Gaussian radius (Å).
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Sets the radius, clamped to `[min, max]`.
    pub fn set_radius(&mut self, radius: f64, min: f64, max: f64) {
        self.radius = radius.clamp(min, max);
    }
}

/// An explicit eFF electron.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Electron {
    /// Spin-channel type tag; Pauli repulsion only acts within one tag
    pub kind: String,
    /// Mass (amu)
    #[serde(default = "default_electron_mass")]
    pub mass: f64,
    /// Charge (e)
    #[serde(default = "default_electron_charge")]
    pub charge: f64,
    /// Spin (+1 or -1)
    pub spin: i32,
    beads: Vec<ElectronBead>,
    /// Scratch energy accumulator (eV)
    #[serde(skip)]
    pub energy: f64,
}

fn default_electron_mass() -> f64 {
    ELEC_MASS
}

fn default_electron_charge() -> f64 {
    -1.0
}

impl Electron {
    /// Creates an electron with a single bead.
    pub fn new(kind: impl Into<String>, spin: i32, position: Coord, radius: f64) -> Self {
        Self {
            kind: kind.into(),
            mass: ELEC_MASS,
            charge: -1.0,
            spin,
            beads: vec![ElectronBead::new(position, radius)],
            energy: 0.0,
        }
    }

    /// Number of replicas.
    pub fn nbeads(&self) -> usize {
        self.beads.len()
    }

    /// All replicas, read only.
    pub fn beads(&self) -> &[ElectronBead] {
        &self.beads
    }

    /// All replicas, mutable but not resizable.
    pub fn beads_mut(&mut self) -> &mut [ElectronBead] {
        &mut self.beads
    }

    /// Replica `k`.
    pub fn bead(&self, k: usize) -> Result<&ElectronBead> {
        let nbeads = self.beads.len();
        self.beads
            .get(k)
            .ok_or(QmmmError::BeadIndexOutOfRange { bead: k, nbeads })
    }

    /// Replica `k`, mutable.
    pub fn bead_mut(&mut self, k: usize) -> Result<&mut ElectronBead> {
        let nbeads = self.beads.len();
        self.beads
            .get_mut(k)
            .ok_or(QmmmError::BeadIndexOutOfRange { bead: k, nbeads })
    }

    /// Mean position over all replicas.
    pub fn centroid(&self) -> Coord {
        let sum: Coord = self.beads.iter().map(|b| b.position).sum();
        sum / self.beads.len().max(1) as f64
    }

    fn resize_beads(&mut self, nbeads: usize) {
        let template = self
            .beads
            .first()
            .copied()
            .unwrap_or_else(|| ElectronBead::new(Coord::zeros(), 1.0));
        self.beads.truncate(nbeads);
        self.beads.resize(nbeads, template);
    }
}

/// How fresh replicas are seeded by [`System::init_replicas`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplicaKind {
    /// Exact copies of bead 0
    Copies,
    /// Reaction-path images; also selects the transition-state bead
    ReactionPath,
    /// Path-integral slices displaced around bead 0. Each component of every
    /// bead after the first moves uniformly within `±amplitude·sqrt(12/m)`.
    PathIntegral {
        /// Displacement amplitude for a mass-12 atom (Å)
        amplitude: f64,
    },
}

/// The complete replicated system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SystemRecord")]
pub struct System {
    /// Atoms in input order
    pub atoms: Vec<Atom>,
    /// Explicit eFF electrons
    pub electrons: Vec<Electron>,
    nbeads: usize,
    /// Orthorhombic box lengths (Å)
    pub box_lengths: Option<[f64; 3]>,
    ts_bead: Option<usize>,
}

#[derive(Deserialize)]
struct SystemRecord {
    atoms: Vec<Atom>,
    #[serde(default)]
    electrons: Vec<Electron>,
    #[serde(default)]
    box_lengths: Option<[f64; 3]>,
    #[serde(default)]
    ts_bead: Option<usize>,
}

impl TryFrom<SystemRecord> for System {
    type Error = QmmmError;

    fn try_from(record: SystemRecord) -> Result<Self> {
        let mut system = System::new(record.atoms, record.electrons)?;
        system.box_lengths = record.box_lengths;
        if let Some(ts) = record.ts_bead {
            system.set_ts_bead(ts)?;
        }
        Ok(system)
    }
}

impl System {
    /// Builds a system and checks that every atom and electron carries the
    /// same, non-zero number of replicas and that bonds are in range and
    /// symmetric.
    pub fn new(atoms: Vec<Atom>, electrons: Vec<Electron>) -> Result<Self> {
        let nbeads = atoms
            .first()
            .map(Atom::nbeads)
            .or_else(|| electrons.first().map(Electron::nbeads))
            .unwrap_or(1);
        let system = Self {
            atoms,
            electrons,
            nbeads,
            box_lengths: None,
            ts_bead: None,
        };
        system.validate()?;
        Ok(system)
    }

    /// Number of atoms.
    pub fn natoms(&self) -> usize {
        self.atoms.len()
    }

    /// Number of replicas shared by every atom and electron.
    pub fn nbeads(&self) -> usize {
        self.nbeads
    }

    /// Climbing-image bead of a reaction path.
    pub fn ts_bead(&self) -> Option<usize> {
        self.ts_bead
    }

    /// Moves the climbing image.
    pub fn set_ts_bead(&mut self, bead: usize) -> Result<()> {
        self.check_bead(bead)?;
        self.ts_bead = Some(bead);
        Ok(())
    }

    /// Sizes every replica array to `nbeads`, seeding new replicas from
    /// bead 0. This is the only operation that changes replica counts.
    pub fn init_replicas<R: Rng + ?Sized>(
        &mut self,
        nbeads: usize,
        kind: ReplicaKind,
        rng: &mut R,
    ) -> Result<()> {
        if nbeads == 0 {
            return Err(QmmmError::InvalidData(
                "replica count must be at least 1".to_string(),
            ));
        }
        for atom in &mut self.atoms {
            atom.resize_beads(nbeads);
        }
        for electron in &mut self.electrons {
            electron.resize_beads(nbeads);
        }
        self.nbeads = nbeads;
        self.ts_bead = None;

        match kind {
            ReplicaKind::Copies => {}
            ReplicaKind::ReactionPath => {
                let ts = if nbeads % 2 == 0 {
                    nbeads / 2
                } else {
                    (nbeads - 1) / 2
                };
                self.ts_bead = Some(ts);
            }
            ReplicaKind::PathIntegral { amplitude } => {
                for atom in self.atoms.iter_mut().filter(|a| !a.frozen) {
                    let scale = amplitude * (12.0 / atom.mass).sqrt();
                    for bead in atom.beads.iter_mut().skip(1) {
                        bead.position += Coord::from_fn(|_, _| rng.gen_range(-scale..=scale));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fails unless `bead` is a valid replica index.
    pub fn check_bead(&self, bead: usize) -> Result<()> {
        if bead < self.nbeads {
            Ok(())
        } else {
            Err(QmmmError::BeadIndexOutOfRange {
                bead,
                nbeads: self.nbeads,
            })
        }
    }

    /// Fails unless `index` is a valid atom index.
    pub fn check_atom(&self, index: usize, bead: usize) -> Result<()> {
        if index < self.atoms.len() {
            Ok(())
        } else {
            Err(QmmmError::AtomIndexOutOfRange {
                index,
                natoms: self.atoms.len(),
                bead,
            })
        }
    }

    /// Re-checks the structural invariants, including strictly positive,
    /// finite electron radii.
    pub fn validate(&self) -> Result<()> {
        if self.nbeads == 0 {
            return Err(QmmmError::InvalidData("atom without beads".to_string()));
        }
        for (i, atom) in self.atoms.iter().enumerate() {
            if atom.nbeads() != self.nbeads {
                return Err(QmmmError::InvalidData(format!(
                    "atom {} has {} beads, expected {}",
                    i,
                    atom.nbeads(),
                    self.nbeads
                )));
            }
            for &j in &atom.bonds {
                self.check_atom(j, 0)?;
                if !self.atoms[j].bonds.contains(&i) {
                    return Err(QmmmError::InvalidData(format!(
                        "bond {}-{} is not listed on atom {}",
                        i, j, j
                    )));
                }
            }
        }
        for (i, electron) in self.electrons.iter().enumerate() {
            if electron.nbeads() != self.nbeads {
                return Err(QmmmError::InvalidData(format!(
                    "electron {} has {} beads, expected {}",
                    i,
                    electron.nbeads(),
                    self.nbeads
                )));
            }
            if let Some((k, bead)) = electron
                .beads
                .iter()
                .enumerate()
                .find(|(_, b)| !(b.radius.is_finite() && b.radius > 0.0))
            {
                return Err(QmmmError::InvalidData(format!(
                    "electron {} bead {} has radius {}, expected a positive finite value",
                    i, k, bead.radius
                )));
            }
        }
        Ok(())
    }

    /// Clamps every electron radius to `[min, max]`.
    pub fn clamp_electron_radii(&mut self, min: f64, max: f64) {
        for bead in self.electrons.iter_mut().flat_map(|e| e.beads.iter_mut()) {
            bead.set_radius(bead.radius, min, max);
        }
    }

    /// Positions of every atom at `bead`.
    pub fn bead_positions(&self, bead: usize) -> Result<Vec<Coord>> {
        self.check_bead(bead)?;
        Ok(self.atoms.iter().map(|a| a.beads[bead].position).collect())
    }

    /// Overwrites the positions of every atom at `bead`.
    pub fn set_bead_positions(&mut self, bead: usize, positions: &[Coord]) -> Result<()> {
        self.check_bead(bead)?;
        if positions.len() != self.atoms.len() {
            return Err(QmmmError::InvalidData(format!(
                "expected {} positions, got {}",
                self.atoms.len(),
                positions.len()
            )));
        }
        for (atom, &p) in self.atoms.iter_mut().zip(positions) {
            atom.beads[bead].position = p;
        }
        Ok(())
    }

    /// Indices of atoms the drivers may move.
    pub fn unfrozen_atoms(&self) -> Vec<usize> {
        self.atoms
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.frozen)
            .map(|(i, _)| i)
            .collect()
    }

    /// Flat `[x1, y1, z1, x2, ...]` vector of the selected atoms at `bead`.
    pub fn flatten_bead(&self, bead: usize, indices: &[usize]) -> Result<DVector<f64>> {
        self.check_bead(bead)?;
        let mut flat = DVector::zeros(indices.len() * 3);
        for (slot, &i) in indices.iter().enumerate() {
            self.check_atom(i, bead)?;
            flat.fixed_rows_mut::<3>(slot * 3)
                .copy_from(&self.atoms[i].beads[bead].position);
        }
        Ok(flat)
    }

    /// Inverse of [`System::flatten_bead`].
    pub fn unflatten_bead(&mut self, bead: usize, indices: &[usize], flat: &DVector<f64>) -> Result<()> {
        self.check_bead(bead)?;
        if flat.len() != indices.len() * 3 {
            return Err(QmmmError::InvalidData(format!(
                "expected {} coordinates, got {}",
                indices.len() * 3,
                flat.len()
            )));
        }
        for (slot, &i) in indices.iter().enumerate() {
            self.check_atom(i, bead)?;
            self.atoms[i].beads[bead].position = flat.fixed_rows::<3>(slot * 3).into_owned();
        }
        Ok(())
    }

    /// Box volume (Å³), if periodic.
    pub fn volume(&self) -> Option<f64> {
        self.box_lengths.map(|[x, y, z]| x * y * z)
    }

    /// True when `i` and `j` are directly bonded.
    pub fn bonded(&self, i: usize, j: usize) -> bool {
        self.atoms.get(i).is_some_and(|a| a.bonds.contains(&j))
    }
}
