//! File I/O for geometries, trajectories and bead restart files.
//!
//! All files are plain XYZ text. A bead restart file stores every replica of
//! every atom in one block of `natoms · nbeads` entries, atom-major:
//!
//! ```text
//! 6
//!
//! O   0.00000000  0.00000000  0.00000000    <- atom 0, bead 0
//! O   0.01000000  0.00000000  0.00000000    <- atom 0, bead 1
//! H   ...                                   <- atom 1, bead 0
//! ```

use crate::error::{QmmmError, Result};
use crate::geometry::System;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Default bead restart file name.
pub const BEAD_RESTART_FILE: &str = "BeadStartStruct.xyz";

/// Receives the current geometry at the print cadence of a driver.
pub trait TrajectorySink {
    /// Records one frame.
    fn write_frame(&mut self, system: &System, comment: &str) -> Result<()>;
}

/// Appends every bead of every atom and electron as one XYZ frame.
pub struct XyzTrajectory<W: Write> {
    writer: W,
    frames: usize,
}

impl XyzTrajectory<BufWriter<File>> {
    /// Creates (truncating) a trajectory file.
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> XyzTrajectory<W> {
    /// Trajectory over any writer.
    pub fn new(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    /// Frames written so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Flushes and returns the writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> TrajectorySink for XyzTrajectory<W> {
    fn write_frame(&mut self, system: &System, comment: &str) -> Result<()> {
        let nbeads = system.nbeads();
        let count = (system.natoms() + system.electrons.len()) * nbeads;
        writeln!(self.writer, "{}", count)?;
        writeln!(self.writer, "{}", comment)?;
        for atom in &system.atoms {
            for bead in atom.beads() {
                let p = bead.position;
                writeln!(self.writer, "{}  {:.8}  {:.8}  {:.8}", atom.element, p.x, p.y, p.z)?;
            }
        }
        for electron in &system.electrons {
            for bead in electron.beads() {
                let p = bead.position;
                writeln!(self.writer, "{}  {:.8}  {:.8}  {:.8}", electron.kind, p.x, p.y, p.z)?;
            }
        }
        self.frames += 1;
        Ok(())
    }
}

/// Writes one bead of `system` as an XYZ file.
pub fn write_xyz(system: &System, bead: usize, path: &Path) -> Result<()> {
    let positions = system.bead_positions(bead)?;
    let mut content = format!("{}\nbead {}\n", system.natoms(), bead);
    for (atom, p) in system.atoms.iter().zip(&positions) {
        let _ = writeln!(content, "{}  {:.8}  {:.8}  {:.8}", atom.element, p.x, p.y, p.z);
    }
    fs::write(path, content)?;
    Ok(())
}

/// Writes every bead of every atom in restart order.
pub fn write_bead_restart(system: &System, path: &Path) -> Result<()> {
    let mut content = format!("{}\n\n", system.natoms() * system.nbeads());
    for atom in &system.atoms {
        for bead in atom.beads() {
            let p = bead.position;
            let _ = writeln!(content, "{}  {:.8}  {:.8}  {:.8}", atom.element, p.x, p.y, p.z);
        }
    }
    fs::write(path, content)?;
    Ok(())
}

/// Overwrites every bead position of `system` from a restart file.
///
/// The replica count must already be set; an entry count other than
/// `natoms · nbeads` is an error and leaves `system` untouched.
pub fn read_bead_restart(system: &mut System, path: &Path) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines();
    let expected = system.natoms() * system.nbeads();

    let header = lines
        .next()
        .ok_or_else(|| QmmmError::InvalidData("empty restart file".to_string()))?;
    let count: usize = header.trim().parse().map_err(|_| {
        QmmmError::InvalidData(format!("bad entry count in restart file: {:?}", header))
    })?;
    if count != expected {
        return Err(QmmmError::InvalidData(format!(
            "restart file has {} entries, expected {} ({} atoms x {} beads)",
            count,
            expected,
            system.natoms(),
            system.nbeads()
        )));
    }
    // Comment line
    lines.next();

    let mut positions = Vec::with_capacity(expected);
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(QmmmError::InvalidData(format!("bad restart line: {:?}", line)));
        }
        let mut xyz = [0.0; 3];
        for (slot, field) in xyz.iter_mut().zip(&fields[1..4]) {
            *slot = field
                .parse()
                .map_err(|_| QmmmError::InvalidData(format!("bad coordinate {:?}", field)))?;
        }
        positions.push(xyz);
    }
    if positions.len() != expected {
        return Err(QmmmError::InvalidData(format!(
            "restart file lists {} positions, expected {}",
            positions.len(),
            expected
        )));
    }

    let nbeads = system.nbeads();
    for (i, atom) in system.atoms.iter_mut().enumerate() {
        for (k, bead) in atom.beads_mut().iter_mut().enumerate() {
            let [x, y, z] = positions[i * nbeads + k];
            bead.position = crate::geometry::Coord::new(x, y, z);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Atom, Coord, ReplicaKind};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn dimer(nbeads: usize) -> System {
        let mut system = System::new(
            vec![
                Atom::new("O", 15.999, Coord::zeros()),
                Atom::new("H", 1.008, Coord::new(0.96, 0.0, 0.0)),
            ],
            vec![],
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        system
            .init_replicas(nbeads, ReplicaKind::PathIntegral { amplitude: 0.05 }, &mut rng)
            .unwrap();
        system
    }

    #[test]
    fn restart_round_trip_is_atom_major() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(BEAD_RESTART_FILE);
        let original = dimer(3);
        write_bead_restart(&original, &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let first_entries: Vec<&str> = text
            .lines()
            .skip(2)
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(first_entries, vec!["O", "O", "O", "H", "H", "H"]);

        let mut restored = dimer(3);
        for atom in &mut restored.atoms {
            for bead in atom.beads_mut() {
                bead.position = Coord::zeros();
            }
        }
        read_bead_restart(&mut restored, &path).unwrap();
        for (a, b) in original.atoms.iter().zip(&restored.atoms) {
            for k in 0..3 {
                assert_relative_eq!(a.position(k).unwrap(), b.position(k).unwrap(), epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn wrong_entry_count_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.xyz");
        write_bead_restart(&dimer(2), &path).unwrap();

        let mut system = dimer(3);
        let before = system.clone();
        assert!(read_bead_restart(&mut system, &path).is_err());
        assert_eq!(system, before);
    }

    #[test]
    fn trajectory_frames_hold_every_bead() {
        let system = dimer(2);
        let mut sink = XyzTrajectory::new(Vec::new());
        sink.write_frame(&system, "step 0").unwrap();
        sink.write_frame(&system, "step 1").unwrap();
        assert_eq!(sink.frames(), 2);

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 2 * (2 + 4));
        assert!(text.starts_with("4\nstep 0\n"));
    }
}
