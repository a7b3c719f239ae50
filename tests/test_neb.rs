// Climbing-image NEB on an analytic double well
mod common;

use approx::assert_relative_eq;
use common::{single_atom, DoubleWell};
use qmmm::aggregator::Aggregator;
use qmmm::config::{Method, SimulationConfig};
use qmmm::geometry::{Atom, Coord, ReplicaKind, System};
use qmmm::lst;
use qmmm::optimizer::OptStatus;
use qmmm::reaction_path::climbing_image_neb;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn perturbed_path() -> System {
    let mut system = single_atom(1.0, Coord::new(-1.0, 0.0, 0.0));
    let mut rng = StdRng::seed_from_u64(3);
    system
        .init_replicas(7, ReplicaKind::ReactionPath, &mut rng)
        .unwrap();
    lst::seed_path(&mut system, &[Coord::new(1.0, 0.0, 0.0)]).unwrap();

    let offsets = [0.1, -0.1, 0.05, 0.1, -0.05];
    for (k, dy) in (1..6).zip(offsets) {
        let mut p = system.atoms[0].position(k).unwrap();
        p.y += dy;
        system.atoms[0].set_position(k, p).unwrap();
    }
    let mut middle = system.atoms[0].position(3).unwrap();
    middle.x = 0.1;
    system.atoms[0].set_position(3, middle).unwrap();
    system
}

fn neb_config() -> SimulationConfig {
    SimulationConfig {
        method: Method::Neb,
        nbeads: 7,
        spring_constant: 5.0,
        step_scale: 0.02,
        max_iterations: 1000,
        ..SimulationConfig::default()
    }
}

#[test]
fn test_climbing_image_finds_saddle() {
    let mut system = perturbed_path();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let report = climbing_image_neb(&mut system, &aggregator, &neb_config()).unwrap();

    assert_eq!(report.status, OptStatus::Converged);
    assert_eq!(report.ts_bead, 3);
    assert_eq!(system.ts_bead(), Some(3));

    let saddle = system.atoms[0].position(3).unwrap();
    assert_relative_eq!(saddle.x, 0.0, epsilon = 1e-2);
    assert_relative_eq!(saddle.y, 0.0, epsilon = 1e-2);
    assert_relative_eq!(report.barrier, 1.0, epsilon = 1e-3);
}

#[test]
fn test_frozen_ends_never_move() {
    let mut system = perturbed_path();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    climbing_image_neb(&mut system, &aggregator, &neb_config()).unwrap();

    assert_eq!(system.atoms[0].position(0).unwrap(), Coord::new(-1.0, 0.0, 0.0));
    assert_eq!(system.atoms[0].position(6).unwrap(), Coord::new(1.0, 0.0, 0.0));
}

#[test]
fn test_converged_path_relaxes_onto_valley() {
    let mut system = perturbed_path();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let report = climbing_image_neb(&mut system, &aggregator, &neb_config()).unwrap();
    assert_eq!(report.status, OptStatus::Converged);

    for k in 1..6 {
        let p = system.atoms[0].position(k).unwrap();
        assert!(p.y.abs() < 1e-2, "bead {} is off the valley: {}", k, p.y);
    }
    // Energies rise monotonically towards the climbing image
    assert!(report.energies[1] < report.energies[2]);
    assert!(report.energies[2] < report.energies[3]);
    assert!(report.energies[5] < report.energies[4]);
}

#[test]
fn test_two_bead_path_is_rejected() {
    let mut system = single_atom(1.0, Coord::new(-1.0, 0.0, 0.0));
    let mut rng = StdRng::seed_from_u64(0);
    system
        .init_replicas(2, ReplicaKind::ReactionPath, &mut rng)
        .unwrap();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let config = SimulationConfig {
        nbeads: 2,
        ..neb_config()
    };
    assert!(climbing_image_neb(&mut system, &aggregator, &config).is_err());
}

#[test]
fn test_iteration_cap_is_reported() {
    let mut system = perturbed_path();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let config = SimulationConfig {
        max_iterations: 3,
        ..neb_config()
    };
    let report = climbing_image_neb(&mut system, &aggregator, &config).unwrap();
    assert_eq!(report.status, OptStatus::IterationLimitReached);
    assert_eq!(report.iterations, 3);
}

#[test]
fn test_path_atoms_drive_the_tangent() {
    // Atom 1 only has to relax into its own well
    let mut system = System::new(
        vec![
            Atom::new("X", 1.0, Coord::new(-1.0, 0.0, 0.0)),
            Atom::new("Y", 1.0, Coord::new(1.0, 0.0, 0.0)),
        ],
        vec![],
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    system
        .init_replicas(7, ReplicaKind::ReactionPath, &mut rng)
        .unwrap();
    lst::seed_path(&mut system, &[Coord::new(1.0, 0.0, 0.0), Coord::new(1.0, 0.0, 0.0)]).unwrap();
    for k in 1..6 {
        let mut p = system.atoms[1].position(k).unwrap();
        p.y = 0.2;
        system.atoms[1].set_position(k, p).unwrap();
    }
    let mut middle = system.atoms[0].position(3).unwrap();
    middle.x = 0.1;
    system.atoms[0].set_position(3, middle).unwrap();

    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let config = SimulationConfig {
        neb_atoms: Some(vec![0]),
        ..neb_config()
    };
    let report = climbing_image_neb(&mut system, &aggregator, &config).unwrap();

    assert_eq!(report.status, OptStatus::Converged);
    assert_eq!(report.ts_bead, 3);
    assert_relative_eq!(system.atoms[0].position(3).unwrap().x, 0.0, epsilon = 1e-2);
    for k in 1..6 {
        let spectator = system.atoms[1].position(k).unwrap();
        assert!(spectator.y.abs() < 1e-2, "bead {} spectator at {}", k, spectator);
    }
    assert_relative_eq!(report.barrier, 1.0, epsilon = 1e-3);
}

#[test]
fn test_unknown_path_atom_is_rejected() {
    let mut system = perturbed_path();
    let aggregator = Aggregator::new().with_engine(DoubleWell);
    let config = SimulationConfig {
        neb_atoms: Some(vec![4]),
        ..neb_config()
    };
    assert!(climbing_image_neb(&mut system, &aggregator, &config).is_err());
}
