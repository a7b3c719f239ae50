//! Error type shared by the library.
//!
//! Only unrecoverable conditions are errors. Coincident electron pairs get a
//! sentinel energy in [`crate::eff`] instead, and optimizer non-convergence is
//! reported through [`crate::optimizer::OptStatus`].

use crate::multipole::FrameKind;
use thiserror::Error;

/// The primary error type for fallible operations in the `qmmm` library.
#[derive(Error, Debug)]
pub enum QmmmError {
    /// The reference atoms of a local multipole frame do not span the
    /// required axes (coincident or collinear positions).
    #[error("Degenerate {kind:?} multipole frame on atom {atom}, bead {bead}")]
    DegenerateFrame {
        /// Atom owning the multipole.
        atom: usize,
        /// Bead being evaluated.
        bead: usize,
        /// Frame definition that failed.
        kind: FrameKind,
    },

    /// An atom index (frame reference, bond partner, ...) points outside the system.
    #[error("Atom index {index} out of range ({natoms} atoms) at bead {bead}")]
    AtomIndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of atoms in the system.
        natoms: usize,
        /// Bead being evaluated.
        bead: usize,
    },

    /// A bead index outside `[0, nbeads)`.
    #[error("Bead index {bead} out of range ({nbeads} beads)")]
    BeadIndexOutOfRange {
        /// The offending bead.
        bead: usize,
        /// Number of replicas.
        nbeads: usize,
    },

    /// An energy/force provider failed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Input, restart or checkpoint data is malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// File system failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QmmmError>;
