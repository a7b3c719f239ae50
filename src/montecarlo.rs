//! Metropolis Monte Carlo over replicated systems.
//!
//! Two samplers share one loop:
//!
//! - **Path-integral Monte Carlo** ([`Method::Pimc`]): the beads are
//!   imaginary-time slices. The sampled energy is the full
//!   [`EnergyBreakdown`](crate::aggregator::EnergyBreakdown) total, springs
//!   and eFF terms included.
//! - **Force-bias path sampling** ([`Method::ForceBiasNeb`]): the beads are
//!   independent path images. The sampled energy is the sum of the image
//!   energies, with no springs, and only single-image moves are proposed.
//!
//! Each step draws one move kind from a [`MoveSampler`], applies it, and
//! accepts or undoes it with the Metropolis rule. During equilibration the
//! step size follows the target acceptance ratio, checked every
//! `acceptance_window` steps.

use crate::aggregator::Aggregator;
use crate::config::{Ensemble, Method, SimulationConfig};
use crate::constants::ATM_TO_EV;
use crate::eff::EffParams;
use crate::error::{QmmmError, Result};
use crate::geometry::{Atom, Coord, Electron, System};
use crate::io::TrajectorySink;
use log::{debug, info};
use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Trial move kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveKind {
    /// Displace one bead of one atom
    Bead,
    /// Displace every bead of one atom together
    Centroid,
    /// Isotropic box scaling
    Volume,
    /// Displace one bead of one electron
    ElectronBead,
    /// Displace every bead of one electron together
    ElectronCentroid,
    /// Change the radius of every bead of one electron
    Radius,
    /// Exchange the spins of two opposite-spin electrons
    SpinSwap,
    /// Invert the spin of one electron
    SpinFlip,
}

impl MoveKind {
    /// Every kind, in sampler order.
    pub const ALL: [MoveKind; 8] = [
        MoveKind::Bead,
        MoveKind::Centroid,
        MoveKind::Volume,
        MoveKind::ElectronBead,
        MoveKind::ElectronCentroid,
        MoveKind::Radius,
        MoveKind::SpinSwap,
        MoveKind::SpinFlip,
    ];

    /// True for moves that act on electrons.
    pub fn is_electronic(&self) -> bool {
        matches!(
            self,
            MoveKind::ElectronBead
                | MoveKind::ElectronCentroid
                | MoveKind::Radius
                | MoveKind::SpinSwap
                | MoveKind::SpinFlip
        )
    }
}

/// Relative move-kind weights. They need not sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveWeights {
    /// Single atom bead
    pub bead: f64,
    /// Atom centroid
    pub centroid: f64,
    /// Box volume (NPT only)
    pub volume: f64,
    /// Single electron bead
    pub electron_bead: f64,
    /// Electron centroid
    pub electron_centroid: f64,
    /// Electron radius
    pub radius: f64,
    /// Spin exchange
    pub spin_swap: f64,
    /// Spin inversion
    pub spin_flip: f64,
}

impl Default for MoveWeights {
    fn default() -> Self {
        Self {
            bead: 0.55,
            centroid: 0.55,
            volume: 0.10,
            electron_bead: 0.25,
            electron_centroid: 0.25,
            radius: 0.0,
            spin_swap: 0.05,
            spin_flip: 0.05,
        }
    }
}

impl MoveWeights {
    /// Weight of one kind.
    pub fn weight(&self, kind: MoveKind) -> f64 {
        match kind {
            MoveKind::Bead => self.bead,
            MoveKind::Centroid => self.centroid,
            MoveKind::Volume => self.volume,
            MoveKind::ElectronBead => self.electron_bead,
            MoveKind::ElectronCentroid => self.electron_centroid,
            MoveKind::Radius => self.radius,
            MoveKind::SpinSwap => self.spin_swap,
            MoveKind::SpinFlip => self.spin_flip,
        }
    }
}

/// Step-size limits and adaptation window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepControl {
    /// Smallest step (Å); also the initial step
    pub step_min: f64,
    /// Largest step (Å)
    pub step_max: f64,
    /// Centroid moves use `step · centroid_ratio`
    pub centroid_ratio: f64,
    /// Equilibration steps between acceptance checks
    pub acceptance_window: usize,
}

impl Default for StepControl {
    fn default() -> Self {
        Self {
            step_min: 0.01,
            step_max: 1.0,
            centroid_ratio: 5.0,
            acceptance_window: 2000,
        }
    }
}

/// Adapted step: ×0.9 below the target ratio, ×1.1 otherwise, clamped to
/// the control limits.
pub fn adapt_step(step: f64, ratio: f64, target: f64, control: &StepControl) -> f64 {
    let scaled = if ratio < target { step * 0.9 } else { step * 1.1 };
    scaled.clamp(control.step_min, control.step_max)
}

/// Metropolis rule for an energy change `delta_e` at inverse temperature
/// `beta`, given a uniform deviate `u` in `[0, 1)`.
///
/// ```
/// use qmmm::montecarlo::metropolis_accept;
///
/// assert!(metropolis_accept(-1.0, 40.0, 0.999));
/// assert!(!metropolis_accept(1.0, 40.0, 1e-6));
/// ```
pub fn metropolis_accept(delta_e: f64, beta: f64, u: f64) -> bool {
    delta_e <= 0.0 || u < (-beta * delta_e).exp()
}

/// Dimensionless exponent of the isobaric acceptance test,
/// `β(ΔE + P·ΔV) − N·ln(V_new/V_old)`, with `P` in atm and volumes in Å³.
pub fn npt_exponent(
    delta_e: f64,
    beta: f64,
    pressure: f64,
    v_old: f64,
    v_new: f64,
    nparticles: usize,
) -> f64 {
    beta * (delta_e + pressure * ATM_TO_EV * (v_new - v_old))
        - nparticles as f64 * (v_new / v_old).ln()
}

/// Discrete sampler over the move kinds with a positive weight.
#[derive(Debug, Clone)]
pub struct MoveSampler {
    kinds: Vec<MoveKind>,
    index: WeightedIndex<f64>,
}

impl MoveSampler {
    /// Sampler over the given kinds. Kinds with a zero weight are dropped.
    pub fn new(weights: &MoveWeights, kinds: &[MoveKind]) -> Result<Self> {
        let kinds: Vec<MoveKind> = kinds
            .iter()
            .copied()
            .filter(|&k| weights.weight(k) > 0.0)
            .collect();
        let index = WeightedIndex::new(kinds.iter().map(|&k| weights.weight(k)))
            .map_err(|e| QmmmError::InvalidData(format!("no Monte Carlo move available: {}", e)))?;
        Ok(Self { kinds, index })
    }

    /// Kinds this sampler can return.
    pub fn kinds(&self) -> &[MoveKind] {
        &self.kinds
    }

    /// Draws one kind.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> MoveKind {
        self.kinds[self.index.sample(rng)]
    }
}

/// Move kinds that apply to `system` under `config`.
pub fn available_moves(config: &SimulationConfig, system: &System) -> Vec<MoveKind> {
    if config.method == Method::ForceBiasNeb {
        return vec![MoveKind::Bead];
    }
    MoveKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            MoveKind::Volume => config.ensemble == Ensemble::Npt,
            k if k.is_electronic() => !system.electrons.is_empty(),
            _ => true,
        })
        .collect()
}

/// Sampling statistics of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct McReport {
    /// Production moves attempted
    pub attempted: usize,
    /// Production moves accepted
    pub accepted: usize,
    /// `accepted / attempted`
    pub acceptance: f64,
    /// Mean sampled energy over production (eV)
    pub average_energy: f64,
    /// Sampled energy of the final state (eV)
    pub final_energy: f64,
    /// Step size at the end of equilibration (Å)
    pub step: f64,
}

enum Undo {
    Atom(usize, Atom),
    Electron(usize, Electron),
    Spins(Vec<(usize, i32)>),
    Everything {
        atoms: Vec<Atom>,
        electrons: Vec<Electron>,
        box_lengths: Option<[f64; 3]>,
    },
}

impl Undo {
    fn restore(self, system: &mut System) {
        match self {
            Undo::Atom(i, atom) => system.atoms[i] = atom,
            Undo::Electron(i, electron) => system.electrons[i] = electron,
            Undo::Spins(spins) => {
                for (i, spin) in spins {
                    system.electrons[i].spin = spin;
                }
            }
            Undo::Everything {
                atoms,
                electrons,
                box_lengths,
            } => {
                system.atoms = atoms;
                system.electrons = electrons;
                system.box_lengths = box_lengths;
            }
        }
    }
}

struct Proposal {
    undo: Undo,
    volumes: Option<(f64, f64)>,
}

impl Proposal {
    fn local(undo: Undo) -> Option<Self> {
        Some(Self {
            undo,
            volumes: None,
        })
    }
}

/// Monte Carlo driver for PIMC and force-bias path runs.
pub struct MonteCarlo<'a> {
    aggregator: &'a Aggregator,
    config: &'a SimulationConfig,
    weights: MoveWeights,
    control: StepControl,
    eff: EffParams,
}

impl<'a> MonteCarlo<'a> {
    /// Driver with default move weights and step control.
    pub fn new(aggregator: &'a Aggregator, config: &'a SimulationConfig) -> Self {
        Self {
            aggregator,
            config,
            weights: MoveWeights::default(),
            control: StepControl::default(),
            eff: aggregator.eff_params().copied().unwrap_or_default(),
        }
    }

    /// Replaces the move weights.
    pub fn with_weights(mut self, weights: MoveWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Replaces the step control.
    pub fn with_step_control(mut self, control: StepControl) -> Self {
        self.control = control;
        self
    }

    fn independent_images(&self) -> bool {
        self.config.method == Method::ForceBiasNeb
    }

    /// Energy the acceptance test is applied to.
    pub fn sampled_energy(&self, system: &mut System) -> Result<f64> {
        if self.independent_images() {
            Ok(self.aggregator.energies(system)?.iter().sum())
        } else {
            Ok(self.aggregator.total_energy(system, self.config.beta())?.total())
        }
    }

    fn movable_beads(&self, system: &System) -> Vec<usize> {
        let n = system.nbeads();
        if self.independent_images() && self.config.frozen_ends && n > 2 {
            (1..n - 1).collect()
        } else {
            (0..n).collect()
        }
    }

    fn propose<R: Rng + ?Sized>(
        &self,
        system: &mut System,
        kind: MoveKind,
        step: f64,
        rng: &mut R,
    ) -> Result<Option<Proposal>> {
        let unit = Uniform::new_inclusive(-1.0, 1.0);
        let displacement =
            |rng: &mut R, size: f64| Coord::from_fn(|_, _| unit.sample(rng) * size);
        let centroid_step = step * self.control.centroid_ratio;

        let proposal = match kind {
            MoveKind::Bead | MoveKind::Centroid => {
                let unfrozen = system.unfrozen_atoms();
                if unfrozen.is_empty() {
                    return Ok(None);
                }
                let i = unfrozen[rng.gen_range(0..unfrozen.len())];
                let saved = system.atoms[i].clone();
                if kind == MoveKind::Bead {
                    let beads = self.movable_beads(system);
                    let k = beads[rng.gen_range(0..beads.len())];
                    let shift = displacement(rng, step);
                    system.atoms[i].bead_mut(k)?.position += shift;
                } else {
                    let shift = displacement(rng, centroid_step);
                    for bead in system.atoms[i].beads_mut() {
                        bead.position += shift;
                    }
                }
                Proposal::local(Undo::Atom(i, saved))
            }
            MoveKind::ElectronBead | MoveKind::ElectronCentroid | MoveKind::Radius => {
                if system.electrons.is_empty() {
                    return Ok(None);
                }
                let i = rng.gen_range(0..system.electrons.len());
                let saved = system.electrons[i].clone();
                let electron = &mut system.electrons[i];
                match kind {
                    MoveKind::ElectronBead => {
                        let k = rng.gen_range(0..electron.nbeads());
                        let shift = displacement(rng, step);
                        electron.bead_mut(k)?.position += shift;
                    }
                    MoveKind::ElectronCentroid => {
                        let shift = displacement(rng, centroid_step);
                        for bead in electron.beads_mut() {
                            bead.position += shift;
                        }
                    }
                    _ => {
                        let change = unit.sample(rng) * step;
                        for bead in electron.beads_mut() {
                            let radius = bead.radius() + change;
                            bead.set_radius(radius, self.eff.radius_min, self.eff.radius_max);
                        }
                    }
                }
                Proposal::local(Undo::Electron(i, saved))
            }
            MoveKind::SpinFlip => {
                if system.electrons.is_empty() {
                    return Ok(None);
                }
                let i = rng.gen_range(0..system.electrons.len());
                let old = system.electrons[i].spin;
                system.electrons[i].spin = -old;
                Proposal::local(Undo::Spins(vec![(i, old)]))
            }
            MoveKind::SpinSwap => {
                let up: Vec<usize> = (0..system.electrons.len())
                    .filter(|&i| system.electrons[i].spin > 0)
                    .collect();
                let down: Vec<usize> = (0..system.electrons.len())
                    .filter(|&i| system.electrons[i].spin < 0)
                    .collect();
                if up.is_empty() || down.is_empty() {
                    return Ok(None);
                }
                let a = up[rng.gen_range(0..up.len())];
                let b = down[rng.gen_range(0..down.len())];
                let (sa, sb) = (system.electrons[a].spin, system.electrons[b].spin);
                system.electrons[a].spin = sb;
                system.electrons[b].spin = sa;
                Proposal::local(Undo::Spins(vec![(a, sa), (b, sb)]))
            }
            MoveKind::Volume => {
                let Some(v_old) = system.volume() else {
                    return Ok(None);
                };
                let edge = v_old.cbrt();
                let scale = (edge + unit.sample(rng) * step) / edge;
                if scale <= 0.0 {
                    return Ok(None);
                }
                let undo = Undo::Everything {
                    atoms: system.atoms.clone(),
                    electrons: system.electrons.clone(),
                    box_lengths: system.box_lengths,
                };
                scale_system(system, scale);
                let v_new = system.volume().unwrap_or(v_old);
                Some(Proposal {
                    undo,
                    volumes: Some((v_old, v_new)),
                })
            }
        };
        Ok(proposal)
    }

    /// Runs equilibration then production on `system`.
    ///
    /// Production states are written to `sink`, when given, every
    /// `print_every` steps.
    pub fn run<R: Rng + ?Sized>(
        &self,
        system: &mut System,
        rng: &mut R,
        mut sink: Option<&mut dyn TrajectorySink>,
    ) -> Result<McReport> {
        let moves = available_moves(self.config, system);
        let sampler = MoveSampler::new(&self.weights, &moves)?;
        if sampler.kinds().contains(&MoveKind::Volume) && system.volume().is_none() {
            return Err(QmmmError::InvalidData(
                "volume moves need a periodic box".to_string(),
            ));
        }
        let beta = self.config.beta();
        let nparticles = system.natoms() + system.electrons.len();
        let window = self.control.acceptance_window.max(1);
        let print_every = self.config.print_every.max(1);

        info!(
            "Monte Carlo: {} beads, T = {} K, moves {:?}",
            system.nbeads(),
            self.config.temperature,
            sampler.kinds()
        );

        let mut energy = self.sampled_energy(system)?;
        let mut step = self.control.step_min;
        let mut report = McReport::default();
        let mut window_attempts = 0;
        let mut window_accepted = 0;
        let mut energy_sum = 0.0;

        for n in 0..self.config.eq_steps + self.config.prod_steps {
            let production = n >= self.config.eq_steps;
            if n == self.config.eq_steps {
                info!("Equilibration done, step size {:.4} Å", step);
            }

            let kind = sampler.sample(rng);
            let accepted = match self.propose(system, kind, step, rng)? {
                None => false,
                Some(proposal) => {
                    let trial = self.sampled_energy(system)?;
                    let u: f64 = rng.gen();
                    let accept = match proposal.volumes {
                        Some((v_old, v_new)) => {
                            let exponent = npt_exponent(
                                trial - energy,
                                beta,
                                self.config.pressure,
                                v_old,
                                v_new,
                                nparticles,
                            );
                            metropolis_accept(exponent, 1.0, u)
                        }
                        None => metropolis_accept(trial - energy, beta, u),
                    };
                    if accept {
                        energy = trial;
                    } else {
                        proposal.undo.restore(system);
                    }
                    accept
                }
            };

            if production {
                report.attempted += 1;
                report.accepted += usize::from(accepted);
                energy_sum += energy;
                let done = n - self.config.eq_steps + 1;
                if done % print_every == 0 {
                    info!(
                        "MC step {}: E = {:.8} eV, acceptance {:.3}",
                        done,
                        energy,
                        report.accepted as f64 / report.attempted as f64
                    );
                    if let Some(sink) = sink.as_deref_mut() {
                        sink.write_frame(system, &format!("MC step {} E = {:.8} eV", done, energy))?;
                    }
                }
            } else {
                window_attempts += 1;
                window_accepted += usize::from(accepted);
                if window_attempts == window {
                    let ratio = window_accepted as f64 / window_attempts as f64;
                    step = adapt_step(step, ratio, self.config.acceptance_ratio, &self.control);
                    debug!("Acceptance {:.3}, step now {:.4} Å", ratio, step);
                    window_attempts = 0;
                    window_accepted = 0;
                }
            }
        }

        report.step = step;
        report.final_energy = energy;
        if report.attempted > 0 {
            report.acceptance = report.accepted as f64 / report.attempted as f64;
            report.average_energy = energy_sum / report.attempted as f64;
        }
        info!(
            "Monte Carlo complete: acceptance {:.3}, average energy {:.8} eV",
            report.acceptance, report.average_energy
        );
        Ok(report)
    }
}

/// Scales the box and every unfrozen atom and electron centroid by `scale`,
/// preserving bead offsets from the centroid.
pub fn scale_system(system: &mut System, scale: f64) {
    if let Some(lengths) = system.box_lengths.as_mut() {
        for l in lengths.iter_mut() {
            *l *= scale;
        }
    }
    for atom in system.atoms.iter_mut().filter(|a| !a.frozen) {
        let shift = atom.centroid() * (scale - 1.0);
        for bead in atom.beads_mut() {
            bead.position += shift;
        }
    }
    for electron in &mut system.electrons {
        let shift = electron.centroid() * (scale - 1.0);
        for bead in electron.beads_mut() {
            bead.position += shift;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn downhill_is_always_accepted() {
        for u in [0.0, 0.5, 0.999_999] {
            assert!(metropolis_accept(-1e-9, 1e3, u));
            assert!(metropolis_accept(0.0, 1e3, u));
        }
        assert!(!metropolis_accept(f64::NAN, 1.0, 0.0));
    }

    #[test]
    fn step_adaptation_is_clamped() {
        let control = StepControl::default();
        assert_relative_eq!(adapt_step(0.5, 0.2, 0.5, &control), 0.45);
        assert_relative_eq!(adapt_step(0.5, 0.8, 0.5, &control), 0.55);
        assert_relative_eq!(adapt_step(0.01, 0.0, 0.5, &control), 0.01);
        assert_relative_eq!(adapt_step(0.95, 1.0, 0.5, &control), 1.0);
    }

    #[test]
    fn npt_exponent_without_volume_change_is_plain_metropolis() {
        assert_relative_eq!(npt_exponent(0.2, 10.0, 1.0, 100.0, 100.0, 5), 2.0);
        // Expansion against zero pressure is favoured by the entropy term.
        assert!(npt_exponent(0.0, 10.0, 0.0, 100.0, 110.0, 5) < 0.0);
    }

    #[test]
    fn sampler_drops_zero_weights() {
        let weights = MoveWeights {
            radius: 0.0,
            ..Default::default()
        };
        let sampler = MoveSampler::new(&weights, &MoveKind::ALL).unwrap();
        assert!(!sampler.kinds().contains(&MoveKind::Radius));

        let mut rng = StdRng::seed_from_u64(11);
        let n = 20_000;
        let beads = (0..n)
            .filter(|_| sampler.sample(&mut rng) == MoveKind::Bead)
            .count();
        let total: f64 = sampler.kinds().iter().map(|&k| weights.weight(k)).sum();
        assert_relative_eq!(beads as f64 / n as f64, 0.55 / total, epsilon = 0.02);
    }

    #[test]
    fn all_zero_weights_fail() {
        let weights = MoveWeights {
            bead: 0.0,
            ..Default::default()
        };
        assert!(MoveSampler::new(&weights, &[MoveKind::Bead]).is_err());
    }

    #[test]
    fn volume_only_under_npt() {
        let system = System::new(vec![Atom::new("Ar", 39.95, Coord::zeros())], vec![]).unwrap();
        let mut config = SimulationConfig {
            method: Method::Pimc,
            ..Default::default()
        };
        let moves = available_moves(&config, &system);
        assert!(!moves.contains(&MoveKind::Volume));
        assert!(!moves.iter().any(MoveKind::is_electronic));

        config.ensemble = Ensemble::Npt;
        assert!(available_moves(&config, &system).contains(&MoveKind::Volume));

        config.method = Method::ForceBiasNeb;
        assert_eq!(available_moves(&config, &system), vec![MoveKind::Bead]);
    }

    #[test]
    fn scaling_keeps_bead_offsets() {
        let mut system = System::new(vec![Atom::new("Ar", 39.95, Coord::new(1.0, 0.0, 0.0))], vec![]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        system
            .init_replicas(2, crate::geometry::ReplicaKind::Copies, &mut rng)
            .unwrap();
        system.atoms[0].set_position(1, Coord::new(1.2, 0.0, 0.0)).unwrap();
        system.box_lengths = Some([10.0, 10.0, 10.0]);

        scale_system(&mut system, 2.0);
        assert_relative_eq!(system.volume().unwrap(), 8000.0);
        assert_relative_eq!(system.atoms[0].centroid().x, 2.2, epsilon = 1e-12);
        let offset = system.atoms[0].position(1).unwrap() - system.atoms[0].position(0).unwrap();
        assert_relative_eq!(offset.x, 0.2, epsilon = 1e-12);
    }
}
