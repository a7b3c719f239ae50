// Metropolis sampling of path-integral and path-image systems
mod common;

use approx::assert_relative_eq;
use common::{single_atom, DoubleWell, Harmonic};
use qmmm::aggregator::Aggregator;
use qmmm::config::{Ensemble, Method, SimulationConfig};
use qmmm::geometry::{Coord, ReplicaKind, System};
use qmmm::io::XyzTrajectory;
use qmmm::lst;
use qmmm::montecarlo::{metropolis_accept, MonteCarlo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn pimc_config() -> SimulationConfig {
    SimulationConfig {
        method: Method::Pimc,
        nbeads: 4,
        temperature: 300.0,
        eq_steps: 200,
        prod_steps: 300,
        print_every: 50,
        ..SimulationConfig::default()
    }
}

fn ring_polymer(rng: &mut StdRng) -> System {
    let mut system = single_atom(1.008, Coord::new(0.1, 0.0, 0.0));
    system
        .init_replicas(4, ReplicaKind::PathIntegral { amplitude: 0.02 }, rng)
        .unwrap();
    system
}

#[test]
fn test_acceptance_frequency_matches_boltzmann_factor() {
    let mut rng = StdRng::seed_from_u64(17);
    let (delta_e, beta) = (0.03, 40.0);
    let n = 50_000;
    let accepted = (0..n)
        .filter(|_| metropolis_accept(delta_e, beta, rng.gen()))
        .count();
    assert_relative_eq!(
        accepted as f64 / n as f64,
        (-beta * delta_e).exp(),
        epsilon = 0.01
    );
}

#[test]
fn test_pimc_run_reports_consistent_energy() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut system = ring_polymer(&mut rng);
    let aggregator = Aggregator::new().with_engine(Harmonic::isotropic(2.0));
    let config = pimc_config();
    let mc = MonteCarlo::new(&aggregator, &config);

    let report = mc.run(&mut system, &mut rng, None).unwrap();
    assert_eq!(report.attempted, 300);
    assert!(report.acceptance > 0.0 && report.acceptance <= 1.0);
    assert!(report.accepted <= report.attempted);

    let recomputed = mc.sampled_energy(&mut system).unwrap();
    assert_relative_eq!(report.final_energy, recomputed, max_relative = 1e-10);
}

#[test]
fn test_production_frames_follow_print_cadence() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut system = ring_polymer(&mut rng);
    let aggregator = Aggregator::new().with_engine(Harmonic::isotropic(2.0));
    let config = pimc_config();
    let mut trajectory = XyzTrajectory::new(Vec::new());

    MonteCarlo::new(&aggregator, &config)
        .run(&mut system, &mut rng, Some(&mut trajectory))
        .unwrap();
    assert_eq!(trajectory.frames(), 300 / 50);
}

#[test]
fn test_npt_without_box_is_rejected() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut system = ring_polymer(&mut rng);
    let aggregator = Aggregator::new().with_engine(Harmonic::isotropic(2.0));
    let config = SimulationConfig {
        ensemble: Ensemble::Npt,
        ..pimc_config()
    };
    assert!(MonteCarlo::new(&aggregator, &config)
        .run(&mut system, &mut rng, None)
        .is_err());
}

#[test]
fn test_path_sampling_keeps_end_images() {
    let mut rng = StdRng::seed_from_u64(12);
    let mut system = single_atom(12.0, Coord::new(-1.0, 0.0, 0.0));
    system
        .init_replicas(5, ReplicaKind::ReactionPath, &mut rng)
        .unwrap();
    lst::seed_path(&mut system, &[Coord::new(1.0, 0.0, 0.0)]).unwrap();

    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let config = SimulationConfig {
        method: Method::ForceBiasNeb,
        nbeads: 5,
        eq_steps: 100,
        prod_steps: 200,
        ..SimulationConfig::default()
    };
    let mc = MonteCarlo::new(&aggregator, &config);
    let report = mc.run(&mut system, &mut rng, None).unwrap();

    assert_eq!(system.atoms[0].position(0).unwrap(), Coord::new(-1.0, 0.0, 0.0));
    assert_eq!(system.atoms[0].position(4).unwrap(), Coord::new(1.0, 0.0, 0.0));
    let image_sum: f64 = aggregator.energies(&system).unwrap().iter().sum();
    assert_relative_eq!(report.final_energy, image_sum, max_relative = 1e-10);
    assert_relative_eq!(mc.sampled_energy(&mut system).unwrap(), image_sum, max_relative = 1e-10);
}
