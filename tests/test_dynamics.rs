// Velocity-Verlet integration and Berendsen coupling
mod common;

use approx::assert_relative_eq;
use common::{single_atom, Harmonic};
use qmmm::aggregator::Aggregator;
use qmmm::config::{Method, SimulationConfig};
use qmmm::dynamics::{kinetic_energy, maxwell_boltzmann, temperature, VelocityVerlet};
use qmmm::geometry::{Atom, Coord, System};
use qmmm::io::XyzTrajectory;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn md_config() -> SimulationConfig {
    SimulationConfig {
        method: Method::Dynamics,
        time_step: 0.5,
        tau_temp: 1e12,
        temperature: 0.0,
        print_every: 100,
        ..SimulationConfig::default()
    }
}

#[test]
fn test_harmonic_oscillator_conserves_energy() {
    let mut system = single_atom(12.0, Coord::new(0.2, 0.0, 0.0));
    let aggregator = Aggregator::new().with_engine(Harmonic::isotropic(1.0));
    let config = md_config();
    let md = VelocityVerlet::new(&aggregator, &config, 0);

    let initial = aggregator.bead_energy(&system, 0).unwrap();
    let mut velocities = vec![Coord::new(0.0, 0.001, 0.0)];
    let initial = initial + kinetic_energy(&system, &velocities);

    let summary = md
        .run_phase(&mut system, &mut velocities, 2000, false, None)
        .unwrap();
    assert_eq!(summary.steps, 2000);
    assert_eq!(summary.samples, 1 + 2000 / 100);

    let total = aggregator.bead_energy(&system, 0).unwrap() + kinetic_energy(&system, &velocities);
    assert_relative_eq!(total, initial, max_relative = 1e-3);
}

#[test]
fn test_fast_thermostat_pins_temperature() {
    let atoms = (0..50)
        .map(|i| Atom::new("Ar", 39.95, Coord::new(4.0 * i as f64, 0.0, 0.0)))
        .collect();
    let mut system = System::new(atoms, vec![]).unwrap();
    let aggregator = Aggregator::new();
    let config = SimulationConfig {
        temperature: 100.0,
        tau_temp: 0.5,
        ..md_config()
    };
    let mut rng = StdRng::seed_from_u64(6);
    let mut velocities = maxwell_boltzmann(&system, 400.0, &mut rng).unwrap();

    let summary = VelocityVerlet::new(&aggregator, &config, 0)
        .run_phase(&mut system, &mut velocities, 10, false, None)
        .unwrap();
    assert_relative_eq!(summary.final_temperature, 100.0, max_relative = 1e-9);
    assert_relative_eq!(temperature(&system, &velocities), 100.0, max_relative = 1e-9);
}

#[test]
fn test_production_writes_frames() {
    let mut system = single_atom(12.0, Coord::new(0.2, 0.0, 0.0));
    let aggregator = Aggregator::new().with_engine(Harmonic::isotropic(1.0));
    let config = SimulationConfig {
        eq_steps: 50,
        prod_steps: 300,
        temperature: 300.0,
        ..md_config()
    };
    let mut rng = StdRng::seed_from_u64(2);
    let mut trajectory = XyzTrajectory::new(Vec::new());
    let (equilibration, production) = VelocityVerlet::new(&aggregator, &config, 0)
        .run(&mut system, &mut rng, Some(&mut trajectory))
        .unwrap();

    assert_eq!(equilibration.steps, 50);
    assert_eq!(production.steps, 300);
    assert_eq!(trajectory.frames(), production.samples);
    assert_eq!(production.samples, 1 + 300 / 100);
}

#[test]
fn test_velocity_count_must_match() {
    let mut system = single_atom(12.0, Coord::zeros());
    let aggregator = Aggregator::new();
    let config = md_config();
    let mut velocities = vec![Coord::zeros(); 2];
    assert!(VelocityVerlet::new(&aggregator, &config, 0)
        .run_phase(&mut system, &mut velocities, 1, false, None)
        .is_err());
}
