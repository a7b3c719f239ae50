// Multipole reduction and six-charge expansion on a small molecule
use approx::assert_relative_eq;
use nalgebra::{Matrix3, Vector3};
use qmmm::geometry::{Atom, Coord};
use qmmm::multipole::{
    expand_to_charges, global_moments, reduce_multipole, refresh_point_charges, FrameKind,
    LocalFrame, Multipole, Quadrupole, OCT_GRID_SPACING,
};

fn water() -> Vec<Atom> {
    let oxygen = Multipole {
        frame: Some(LocalFrame {
            kind: FrameKind::Bisector,
            z_atom: 1,
            x_atom: Some(2),
            y_atom: None,
            chiral_flip: false,
        }),
        charge: -0.5,
        dipole: Vector3::new(0.0, 0.0, 0.08),
        induced_dipole: Vector3::zeros(),
        quadrupole: Quadrupole {
            xx: 0.12,
            yy: -0.05,
            zz: -0.07,
            ..Default::default()
        },
    };
    let hydrogen = |z_atom: usize, x_atom: usize| Multipole {
        frame: Some(LocalFrame {
            kind: FrameKind::ZThenX,
            z_atom,
            x_atom: Some(x_atom),
            y_atom: None,
            chiral_flip: false,
        }),
        charge: 0.25,
        dipole: Vector3::new(0.01, 0.0, -0.03),
        ..Default::default()
    };
    vec![
        Atom::new("O", 15.999, Coord::zeros()).with_multipole(oxygen),
        Atom::new("H", 1.008, Coord::new(0.757, 0.586, 0.0)).with_multipole(hydrogen(0, 2)),
        Atom::new("H", 1.008, Coord::new(-0.757, 0.586, 0.0)).with_multipole(hydrogen(0, 1)),
    ]
}

#[test]
fn test_grid_reproduces_global_moments() {
    let atoms = water();
    for i in 0..atoms.len() {
        let (q, d, quad) = global_moments(&atoms, i, 0).unwrap();
        let origin = atoms[i].position(0).unwrap();
        let reduced = reduce_multipole(&atoms, i, 0).unwrap();
        let grid = expand_to_charges(&reduced, &origin, OCT_GRID_SPACING);

        let (gq, gd, gquad) = grid.moments(&origin);
        assert_relative_eq!(gq, q, epsilon = 1e-12);
        assert_relative_eq!(gd, d, epsilon = 1e-10);
        assert_relative_eq!(gquad, quad, epsilon = 1e-10);
    }
}

#[test]
fn test_bisector_frame_follows_molecule() {
    let atoms = water();
    let (_, dipole, _) = global_moments(&atoms, 0, 0).unwrap();
    // Local z bisects the two O-H bonds, which lie along +y
    assert_relative_eq!(dipole, Vector3::new(0.0, 0.08, 0.0), epsilon = 1e-12);
}

#[test]
fn test_principal_axes_are_orthonormal() {
    let atoms = water();
    let reduced = reduce_multipole(&atoms, 0, 0).unwrap();
    let axes = Matrix3::from_columns(&[reduced.vec_x, reduced.vec_y, reduced.vec_z]);
    assert_relative_eq!(axes.transpose() * axes, Matrix3::identity(), epsilon = 1e-10);
}

#[test]
fn test_refresh_stores_grids() {
    let mut atoms = water();
    refresh_point_charges(&mut atoms, 0).unwrap();
    for atom in &atoms {
        let bead = atom.bead(0).unwrap();
        assert_relative_eq!(bead.charges.total_charge(), bead.multipole.charge, epsilon = 1e-12);
        for p in &bead.charges.positions {
            assert_relative_eq!((p - bead.position).norm(), OCT_GRID_SPACING, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_degenerate_frame_leaves_grids_untouched() {
    let mut atoms = water();
    // Put the second hydrogen on top of the first: the oxygen bisector and
    // the hydrogen frames collapse.
    atoms[2].set_position(0, Coord::new(0.757, 0.586, 0.0)).unwrap();
    let before = atoms.clone();
    assert!(refresh_point_charges(&mut atoms, 0).is_err());
    assert_eq!(atoms, before);
}
