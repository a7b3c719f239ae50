//! qmmm Command-Line Interface
//!
//! Entry point of the `qmmm` program: loads the ambient settings, reads a
//! JSON run file, builds the energy providers and dispatches to the driver
//! selected by the run's method.
//!
//! # Usage
//!
//! ```bash
//! # Run a simulation
//! qmmm run.json
//!
//! # Write a commented settings template to ./qmmm.cfg
//! qmmm template
//! ```
//!
//! # Run File
//!
//! ```json
//! {
//!   "config": { "method": "Neb", "nbeads": 7, "spring_constant": 2.0 },
//!   "system": { "atoms": [ ... ] },
//!   "product": [[1.0, 0.0, 0.0]],
//!   "qm": { "command": "gaussian_wrapper.sh", "work_dir": "scratch" }
//! }
//! ```
//!
//! Optimizations and reaction paths resume from `qmmm.chk` when it exists
//! (or from the `"checkpoint"` file named in the run file). A checkpoint
//! takes precedence over the bead restart file.

use log::{error, info, warn};
use nalgebra::DMatrix;
use qmmm::aggregator::{Aggregator, ThreadPolicy};
use qmmm::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use qmmm::config::{Method, SimulationConfig};
use qmmm::dynamics::VelocityVerlet;
use qmmm::electrostatics::{ChargeModel, Electrostatics, Lrec};
use qmmm::engine::{Engine, ExternalEngine, ExternalEngineConfig};
use qmmm::geometry::{Coord, ReplicaKind, System};
use qmmm::io::{self, TrajectorySink, XyzTrajectory, BEAD_RESTART_FILE};
use qmmm::montecarlo::MonteCarlo;
use qmmm::multipole::refresh_point_charges;
use qmmm::settings::{Settings, SettingsManager, SETTINGS_FILE};
use qmmm::{lst, optimizer, reaction_path};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

/// Contents of a run file.
#[derive(Deserialize)]
struct RunInput {
    config: SimulationConfig,
    system: System,
    /// Product geometry of a reaction path (one position per atom)
    #[serde(default)]
    product: Option<Vec<[f64; 3]>>,
    /// Bead restart file; defaults to `BeadStartStruct.xyz` when present
    #[serde(default)]
    restart: Option<PathBuf>,
    /// Checkpoint to resume from; defaults to `qmmm.chk` when present
    #[serde(default)]
    checkpoint: Option<PathBuf>,
    /// Trajectory output for sampling and dynamics runs
    #[serde(default)]
    trajectory: Option<PathBuf>,
    /// Let the last external engine relax each bead itself
    #[serde(default)]
    engine_optimizer: bool,
    #[serde(default)]
    charge_model: ChargeModel,
    #[serde(default)]
    qm: Option<ExternalEngineConfig>,
    #[serde(default)]
    mm: Option<ExternalEngineConfig>,
}

fn main() {
    let manager = SettingsManager::load();
    let level = manager
        .as_ref()
        .map(|m| m.settings().logging.level_filter())
        .unwrap_or(log::LevelFilter::Info);

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();

    let settings = match manager {
        Ok(manager) => {
            info!("Settings source: {}", manager.config_source());
            manager.into_settings()
        }
        Err(e) => {
            warn!("Falling back to default settings: {}", e);
            Settings::default()
        }
    };

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(1);
    }

    let outcome = match args[1].as_str() {
        "template" => SettingsManager::create_template(Path::new(SETTINGS_FILE))
            .map_err(Box::<dyn std::error::Error>::from),
        input => run(Path::new(input), &settings),
    };
    if let Err(e) = outcome {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn print_usage(program_name: &str) {
    eprintln!("qmmm - QM/MM coupling, eFF and replica optimization");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} <run.json>", program_name);
    eprintln!("                    Run the simulation described by the run file");
    eprintln!();
    eprintln!("  {} template", program_name);
    eprintln!("                    Write a settings template to ./{}", SETTINGS_FILE);
}

fn replica_kind(config: &SimulationConfig, settings: &Settings) -> ReplicaKind {
    if config.is_path_integral() {
        ReplicaKind::PathIntegral {
            amplitude: 2.0 * settings.steps.step_min * settings.steps.centroid_ratio,
        }
    } else if config.is_reaction_path() {
        ReplicaKind::ReactionPath
    } else {
        ReplicaKind::Copies
    }
}

fn build_aggregator(input: &RunInput, settings: &Settings) -> Result<Aggregator, Box<dyn std::error::Error>> {
    let config = &input.config;
    let lrec = config
        .lrec_cutoff
        .map(|cutoff| Lrec::new(cutoff, config.lrec_exponent, input.system.box_lengths));
    let mut aggregator =
        Aggregator::new().with_engine(Electrostatics::new(input.charge_model).with_lrec(lrec));

    if let Some(engine) = input.qm.clone().and_then(|cfg| ExternalEngine::qm(config.qm_engine, cfg)) {
        aggregator = aggregator.with_engine(engine);
    } else if config.qm_engine != qmmm::config::QmEngineKind::None {
        return Err(format!("QM engine {:?} selected without a \"qm\" command", config.qm_engine).into());
    }
    if let Some(engine) = input.mm.clone().and_then(|cfg| ExternalEngine::mm(config.mm_engine, cfg)) {
        aggregator = aggregator.with_engine(engine);
    } else if config.mm_engine != qmmm::config::MmEngineKind::None {
        return Err(format!("MM engine {:?} selected without an \"mm\" command", config.mm_engine).into());
    }

    if !input.system.electrons.is_empty() {
        aggregator = aggregator.with_eff(settings.eff);
    }
    Ok(aggregator)
}

fn resumable(method: Method) -> bool {
    matches!(
        method,
        Method::SteepestDescent | Method::Dfp | Method::EnsembleSd | Method::Neb
    )
}

/// Builds the replicas and their starting geometry. Returns the inverse
/// Hessian of a resumed DFP run.
fn prepare_replicas(
    input: &mut RunInput,
    settings: &Settings,
    rng: &mut StdRng,
) -> Result<Option<DMatrix<f64>>, Box<dyn std::error::Error>> {
    let kind = replica_kind(&input.config, settings);
    input.system.init_replicas(input.config.nbeads, kind, rng)?;

    let checkpoint = input
        .checkpoint
        .clone()
        .or_else(|| Some(PathBuf::from(CHECKPOINT_FILE)).filter(|p| p.exists()))
        .filter(|_| resumable(input.config.method));
    let restart = input
        .restart
        .clone()
        .or_else(|| Some(PathBuf::from(BEAD_RESTART_FILE)).filter(|p| p.exists()));
    let mut stored_hessian = None;
    match (checkpoint, restart) {
        (Some(path), _) => {
            info!("Reading checkpoint {}", path.display());
            stored_hessian = Checkpoint::load(&path)?.resume(&mut input.system, &input.config)?;
        }
        (None, Some(path)) => {
            info!("Reading bead restart file {}", path.display());
            io::read_bead_restart(&mut input.system, &path)?;
        }
        (None, None) if input.config.method == Method::Neb => {
            let product = input
                .product
                .as_ref()
                .ok_or("a reaction path needs a bead restart file or a product geometry")?;
            let product: Vec<Coord> = product.iter().map(|&[x, y, z]| Coord::new(x, y, z)).collect();
            lst::seed_path(&mut input.system, &product)?;
        }
        (None, None) => {}
    }

    input
        .system
        .clamp_electron_radii(settings.eff.radius_min, settings.eff.radius_max);
    for k in 0..input.system.nbeads() {
        refresh_point_charges(&mut input.system.atoms, k)?;
    }
    Ok(stored_hessian)
}

fn run(input_path: &Path, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    info!("qmmm {}", env!("CARGO_PKG_VERSION"));
    let content = fs::read_to_string(input_path)?;
    let mut input: RunInput = serde_json::from_str(&content)?;
    if input.system.box_lengths.is_none() {
        input.system.box_lengths = input.config.box_lengths;
    }

    let available = match settings.general.threads {
        0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
        n => n,
    };
    let policy = ThreadPolicy::new(&input.config, available);
    info!(
        "Threads: {} ({} CPUs per engine call)",
        policy.threads, policy.engine_cpus
    );
    if let Err(e) = policy.install() {
        warn!("Could not size the thread pool: {}", e);
    }

    let mut rng = match settings.general.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut stored_hessian = prepare_replicas(&mut input, settings, &mut rng)?;
    let aggregator = build_aggregator(&input, settings)?;
    let config = input.config.clone();
    let system = &mut input.system;
    info!(
        "{:?} run: {} atoms, {} electrons, {} beads",
        config.method,
        system.natoms(),
        system.electrons.len(),
        system.nbeads()
    );

    let mut trajectory = match &input.trajectory {
        Some(path) => Some(XyzTrajectory::create(path)?),
        None => None,
    };
    let sink = trajectory.as_mut().map(|t| t as &mut dyn TrajectorySink);

    match config.method {
        Method::SinglePoint => {
            let energies = aggregator.energies(system)?;
            for (k, e) in energies.iter().enumerate() {
                info!("Bead {}: E = {:.8} eV", k, e);
            }
            if config.is_replicated() || !system.electrons.is_empty() {
                let breakdown = aggregator.total_energy(system, config.beta())?;
                info!("{:?}, total {:.8} eV", breakdown, breakdown.total());
            }
        }
        Method::SteepestDescent | Method::Dfp if input.engine_optimizer => {
            let engine = aggregator
                .engines()
                .last()
                .filter(|_| input.qm.is_some() || input.mm.is_some())
                .ok_or("engine_optimizer needs an external engine")?;
            for k in 0..system.nbeads() {
                let energy = engine.optimize(system, k)?;
                info!("Bead {} relaxed by {}: E = {:.8} eV", k, engine.name(), energy);
            }
        }
        Method::SteepestDescent | Method::Dfp | Method::EnsembleSd => {
            let last_bead = system.nbeads().saturating_sub(1);
            for k in 0..system.nbeads() {
                let report = match config.method {
                    // The stored Hessian belongs to the last bead
                    Method::Dfp if k == last_bead => match stored_hessian.take() {
                        Some(h) => optimizer::dfp_from(system, k, &aggregator, &config, h)?,
                        None => optimizer::dfp(system, k, &aggregator, &config)?,
                    },
                    Method::Dfp => optimizer::dfp(system, k, &aggregator, &config)?,
                    Method::EnsembleSd => {
                        optimizer::ensemble_steepest_descent(system, k, &aggregator, &config, &mut rng)?
                    }
                    _ => optimizer::steepest_descent(system, k, &aggregator, &config)?,
                };
                info!(
                    "Bead {}: {:?} after {} iterations, E = {:.8} eV",
                    k, report.status, report.iterations, report.energy
                );
                Checkpoint::new(report.iterations, system, report.inverse_hessian.as_ref(), &config)?
                    .save(Path::new(CHECKPOINT_FILE))?;
            }
        }
        Method::Neb => {
            let report = reaction_path::climbing_image_neb(system, &aggregator, &config)?;
            info!(
                "Path {:?}: transition state at bead {}, barrier {:.6} eV",
                report.status, report.ts_bead, report.barrier
            );
            Checkpoint::new(report.iterations, system, None, &config)?.save(Path::new(CHECKPOINT_FILE))?;
        }
        Method::Pimc | Method::ForceBiasNeb => {
            let report = MonteCarlo::new(&aggregator, &config)
                .with_weights(settings.moves)
                .with_step_control(settings.steps)
                .run(system, &mut rng, sink)?;
            info!(
                "Acceptance {:.3}, average energy {:.8} eV",
                report.acceptance, report.average_energy
            );
        }
        Method::Dynamics => {
            let (_, production) = VelocityVerlet::new(&aggregator, &config, 0).run(system, &mut rng, sink)?;
            info!(
                "Average energy {:.8} eV, average temperature {:.2} K",
                production.average_energy, production.average_temperature
            );
        }
    }

    for k in 0..system.nbeads() {
        refresh_point_charges(&mut system.atoms, k)?;
    }
    io::write_bead_restart(system, Path::new(BEAD_RESTART_FILE))?;
    if let Some(trajectory) = trajectory {
        let frames = trajectory.frames();
        trajectory.into_inner()?;
        info!("Wrote {} trajectory frames", frames);
    }
    info!("Run complete");
    Ok(())
}
