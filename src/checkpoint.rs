//! Checkpoints for restarting optimizations and path runs.
//!
//! A checkpoint is a JSON snapshot holding:
//!
//! - **Iteration**: iterations completed when the snapshot was taken
//! - **Bead geometries**: every atom position of every bead
//! - **Climbing image**: the transition-state bead of a reaction path
//! - **Inverse Hessian**: the DFP approximation, when one exists
//! - **Configuration**: the complete [`SimulationConfig`]
//!
//! # Serialization Strategy
//!
//! Positions are stored as plain `[x, y, z]` triples and the inverse Hessian
//! as a list of rows so that the file stays readable and independent of the
//! linear algebra types.
//!
//! # Usage
//!
//! ```no_run
//! use qmmm::checkpoint::Checkpoint;
//! use std::path::Path;
//! # fn demo(system: &mut qmmm::geometry::System, config: &qmmm::config::SimulationConfig) -> qmmm::error::Result<()> {
//! Checkpoint::new(12, system, None, config)?.save(Path::new("qmmm.chk"))?;
//!
//! let loaded = Checkpoint::load(Path::new("qmmm.chk"))?;
//! let seed = loaded.resume(system, config)?;
//! assert!(seed.is_none());
//! # Ok(())
//! # }
//! ```

use crate::config::{Method, SimulationConfig};
use crate::error::{QmmmError, Result};
use crate::geometry::{Coord, System};
use log::{info, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default checkpoint file name.
pub const CHECKPOINT_FILE: &str = "qmmm.chk";

/// On-disk checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Iterations completed
    pub iteration: usize,
    /// Positions indexed `[bead][atom]`
    pub beads: Vec<Vec<[f64; 3]>>,
    /// Climbing image of a reaction path
    pub ts_bead: Option<usize>,
    /// DFP inverse Hessian, row by row
    pub inverse_hessian: Option<Vec<Vec<f64>>>,
    /// Configuration of the run
    pub config: SimulationConfig,
}

/// Checkpoint contents converted back to runtime types.
#[derive(Debug, Clone)]
pub struct CheckpointLoad {
    /// Iterations completed
    pub iteration: usize,
    /// Positions indexed `[bead][atom]`
    pub beads: Vec<Vec<Coord>>,
    /// Climbing image of a reaction path
    pub ts_bead: Option<usize>,
    /// DFP inverse Hessian
    pub inverse_hessian: Option<DMatrix<f64>>,
    /// Configuration of the run
    pub config: SimulationConfig,
}

impl Checkpoint {
    /// Snapshot of `system` after `iteration` iterations.
    pub fn new(
        iteration: usize,
        system: &System,
        inverse_hessian: Option<&DMatrix<f64>>,
        config: &SimulationConfig,
    ) -> Result<Self> {
        let beads = (0..system.nbeads())
            .map(|k| {
                system
                    .bead_positions(k)
                    .map(|ps| ps.iter().map(|p| [p.x, p.y, p.z]).collect())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            iteration,
            beads,
            ts_bead: system.ts_bead(),
            inverse_hessian: inverse_hessian
                .map(|h| h.row_iter().map(|row| row.iter().cloned().collect()).collect()),
            config: config.clone(),
        })
    }

    /// Saves the checkpoint as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads a checkpoint file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed, or when the stored
    /// inverse Hessian is not square.
    pub fn load(path: &Path) -> Result<CheckpointLoad> {
        let content = fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;

        let inverse_hessian = match checkpoint.inverse_hessian {
            None => None,
            Some(rows) => {
                let n = rows.len();
                if rows.iter().any(|row| row.len() != n) {
                    return Err(QmmmError::InvalidData(
                        "checkpoint inverse Hessian is not square".to_string(),
                    ));
                }
                let flat: Vec<f64> = rows.into_iter().flatten().collect();
                Some(DMatrix::from_row_slice(n, n, &flat))
            }
        };

        Ok(CheckpointLoad {
            iteration: checkpoint.iteration,
            beads: checkpoint
                .beads
                .into_iter()
                .map(|bead| bead.into_iter().map(|[x, y, z]| Coord::new(x, y, z)).collect())
                .collect(),
            ts_bead: checkpoint.ts_bead,
            inverse_hessian,
            config: checkpoint.config,
        })
    }
}

impl CheckpointLoad {
    /// Writes the stored positions and climbing image into `system`, which
    /// must carry the same number of beads and atoms.
    pub fn restore(&self, system: &mut System) -> Result<()> {
        if self.beads.len() != system.nbeads() {
            return Err(QmmmError::InvalidData(format!(
                "checkpoint holds {} beads, system has {}",
                self.beads.len(),
                system.nbeads()
            )));
        }
        for (k, positions) in self.beads.iter().enumerate() {
            system.set_bead_positions(k, positions)?;
        }
        if let Some(ts) = self.ts_bead {
            system.set_ts_bead(ts)?;
        }
        Ok(())
    }

    /// Restores `system` for a new run of `config` and returns the stored
    /// inverse Hessian when it can seed a DFP restart.
    ///
    /// The Hessian belongs to the last bead optimized and is kept only when
    /// both runs use DFP and its size matches the unfrozen atoms.
    pub fn resume(self, system: &mut System, config: &SimulationConfig) -> Result<Option<DMatrix<f64>>> {
        self.restore(system)?;
        info!(
            "Resumed from checkpoint after {} iterations ({:?} run)",
            self.iteration, self.config.method
        );
        if self.config.method != config.method {
            warn!(
                "Checkpoint was written by a {:?} run, continuing as {:?}",
                self.config.method, config.method
            );
        }

        let Some(h) = self.inverse_hessian else {
            return Ok(None);
        };
        let n = system.unfrozen_atoms().len() * 3;
        if config.method != Method::Dfp || self.config.method != Method::Dfp {
            return Ok(None);
        }
        if h.nrows() != n {
            warn!(
                "Checkpoint inverse Hessian is {}x{}, expected {}x{}; starting from a fresh one",
                h.nrows(),
                h.ncols(),
                n,
                n
            );
            return Ok(None);
        }
        Ok(Some(h))
    }
}
