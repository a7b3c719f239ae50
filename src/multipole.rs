//! Multipole reduction for QM/MM electrostatics.
//!
//! Every atom carries, per bead, a Cartesian multipole (charge, dipole and
//! quadrupole) expressed in a local frame built from the positions of
//! neighbouring atoms. Before the multipoles can be handed to a QM engine they
//! are brought into the global frame and reduced:
//!
//! 1. [`reduce_multipole`] builds the local frame, rotates the dipole and
//!    quadrupole into the global frame and diagonalizes the quadrupole. The
//!    result, [`ReducedMultipole`], holds spherical-harmonic components in the
//!    quadrupole's principal frame.
//! 2. [`expand_to_charges`] replaces a reduced multipole by six point charges
//!    on the principal axes ([`OctCharges`]).
//!
//! # Conventions
//!
//! Quadrupoles are traceless Cartesian tensors in the Buckingham convention,
//! `Θ = ½ Σ q (3 r rᵀ − r² I)`, in e·Å². The spherical components are
//! `Q20 = Θzz` and `Q22c = (Θxx − Θyy)/√3` in the principal frame, with the
//! dipole split into `Q11c` (x), `Q11s` (y) and `Q10` (z).
//!
//! The six-charge grid reproduces the monopole, dipole and traceless
//! quadrupole exactly; higher moments and the second radial moment are not
//! matched.

use crate::error::{QmmmError, Result};
use crate::geometry::{Atom, Coord};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Distance of each grid charge from the multipole origin (Å).
pub const OCT_GRID_SPACING: f64 = 0.25;

/// Norm below which a frame axis is considered degenerate.
const FRAME_EPS: f64 = 1e-8;

/// How the local axes are derived from the reference atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FrameKind {
    /// z bisects the bonds to the z and x atoms, x lies in their plane
    Bisector,
    /// z points at the z atom, x toward the x atom orthogonalized against z
    #[default]
    ZThenX,
    /// z points at the z atom, x is any perpendicular direction
    ZOnly,
    /// z is the average of the three bond directions, x toward the x atom
    ThreeFold,
    /// z points at the z atom, x bisects the bonds to the x and y atoms
    ZBisect,
}

/// Local frame definition of a multipole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFrame {
    /// Frame construction rule
    pub kind: FrameKind,
    /// Atom that defines the z axis
    pub z_atom: usize,
    /// Atom that defines the x axis
    pub x_atom: Option<usize>,
    /// Third reference atom (three-fold, z-bisect)
    pub y_atom: Option<usize>,
    /// Negate the y axis
    pub chiral_flip: bool,
}

/// Symmetric Cartesian quadrupole; only the upper triangle is stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Quadrupole {
    /// xx component
    pub xx: f64,
    /// xy (= yx) component
    pub xy: f64,
    /// xz (= zx) component
    pub xz: f64,
    /// yy component
    pub yy: f64,
    /// yz (= zy) component
    pub yz: f64,
    /// zz component
    pub zz: f64,
}

impl Quadrupole {
    /// Full symmetric tensor.
    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.xx, self.xy, self.xz, //
            self.xy, self.yy, self.yz, //
            self.xz, self.yz, self.zz,
        )
    }

    /// Upper triangle of `m`, symmetrized.
    pub fn from_matrix(m: &Matrix3<f64>) -> Self {
        Self {
            xx: m[(0, 0)],
            xy: 0.5 * (m[(0, 1)] + m[(1, 0)]),
            xz: 0.5 * (m[(0, 2)] + m[(2, 0)]),
            yy: m[(1, 1)],
            yz: 0.5 * (m[(1, 2)] + m[(2, 1)]),
            zz: m[(2, 2)],
        }
    }
}

/// Cartesian multipole of one atom at one bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Multipole {
    /// Local frame; `None` means the moments are already global
    pub frame: Option<LocalFrame>,
    /// Monopole (e)
    pub charge: f64,
    /// Permanent dipole in the local frame (e·Å)
    pub dipole: Vector3<f64>,
    /// Induced dipole in the global frame (e·Å)
    pub induced_dipole: Vector3<f64>,
    /// Traceless quadrupole in the local frame (e·Å²)
    pub quadrupole: Quadrupole,
}

impl Multipole {
    /// A bare point charge.
    pub fn point_charge(charge: f64) -> Self {
        Self {
            charge,
            ..Default::default()
        }
    }
}

/// Multipole in the principal frame of its quadrupole.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReducedMultipole {
    /// Monopole
    pub q00: f64,
    /// Dipole along `vec_z`
    pub q10: f64,
    /// Dipole along `vec_x`
    pub q11c: f64,
    /// Dipole along `vec_y`
    pub q11s: f64,
    /// `Θzz` in the principal frame
    pub q20: f64,
    /// `(Θxx − Θyy)/√3` in the principal frame
    pub q22c: f64,
    /// Principal x axis (global frame)
    pub vec_x: Vector3<f64>,
    /// Principal y axis (global frame)
    pub vec_y: Vector3<f64>,
    /// Principal z axis (global frame)
    pub vec_z: Vector3<f64>,
}

impl ReducedMultipole {
    /// Global-frame charge, dipole and traceless quadrupole.
    pub fn to_cartesian(&self) -> (f64, Vector3<f64>, Matrix3<f64>) {
        let dipole = self.vec_x * self.q11c + self.vec_y * self.q11s + self.vec_z * self.q10;
        let s3 = 3f64.sqrt();
        let diag = Vector3::new(
            0.5 * (-self.q20 + s3 * self.q22c),
            0.5 * (-self.q20 - s3 * self.q22c),
            self.q20,
        );
        let v = Matrix3::from_columns(&[self.vec_x, self.vec_y, self.vec_z]);
        let quad = v * Matrix3::from_diagonal(&diag) * v.transpose();
        (self.q00, dipole, quad)
    }
}

/// Six point charges replacing one multipole.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct OctCharges {
    /// Charges at +x, +y, +z, −x, −y, −z of the principal frame
    pub charges: [f64; 6],
    /// Global positions of the charges
    pub positions: [Vector3<f64>; 6],
}

impl OctCharges {
    /// Sum of the six charges.
    pub fn total_charge(&self) -> f64 {
        self.charges.iter().sum()
    }

    /// Charge, dipole and traceless quadrupole of the grid about `origin`.
    pub fn moments(&self, origin: &Coord) -> (f64, Vector3<f64>, Matrix3<f64>) {
        let mut q = 0.0;
        let mut dipole = Vector3::zeros();
        let mut quad = Matrix3::zeros();
        for (charge, pos) in self.charges.iter().zip(self.positions.iter()) {
            let r = pos - origin;
            q += charge;
            dipole += r * *charge;
            quad += (r * r.transpose() * 3.0 - Matrix3::identity() * r.norm_squared()) * (0.5 * charge);
        }
        (q, dipole, quad)
    }
}

/// Builds the local frame of a multipole. Columns of the result are the x, y
/// and z axes in global coordinates. `None` means the reference atoms do not
/// span the axes the frame kind needs.
pub fn build_local_frame(
    kind: FrameKind,
    center: &Coord,
    z_ref: &Coord,
    x_ref: Option<&Coord>,
    y_ref: Option<&Coord>,
    chiral_flip: bool,
) -> Option<Matrix3<f64>> {
    let unit = |v: Vector3<f64>| {
        let n = v.norm();
        (n > FRAME_EPS).then(|| v / n)
    };
    let bond = |r: &Coord| unit(r - center);

    let u_z = bond(z_ref)?;
    let (z, x_hint) = match kind {
        FrameKind::ZThenX => (u_z, bond(x_ref?)?),
        FrameKind::Bisector => {
            let u_x = bond(x_ref?)?;
            (unit(u_z + u_x)?, u_x)
        }
        FrameKind::ZOnly => {
            let axis = if u_z.x.abs() < 0.866 {
                Vector3::x()
            } else {
                Vector3::y()
            };
            (u_z, axis)
        }
        FrameKind::ThreeFold => {
            let u_x = bond(x_ref?)?;
            let u_y = bond(y_ref?)?;
            (unit(u_z + u_x + u_y)?, u_x)
        }
        FrameKind::ZBisect => {
            let u_x = bond(x_ref?)?;
            let u_y = bond(y_ref?)?;
            (u_z, unit(u_x + u_y)?)
        }
    };

    let x = unit(x_hint - z * x_hint.dot(&z))?;
    let mut y = z.cross(&x);
    if chiral_flip {
        y = -y;
    }
    Some(Matrix3::from_columns(&[x, y, z]))
}

/// Reduces a global-frame multipole to its principal-frame components.
pub fn reduce_global(charge: f64, dipole: &Vector3<f64>, quadrupole: &Matrix3<f64>) -> ReducedMultipole {
    let eigen = SymmetricEigen::new(*quadrupole);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let vec_x: Vector3<f64> = eigen.eigenvectors.column(order[0]).into_owned();
    let vec_y: Vector3<f64> = eigen.eigenvectors.column(order[1]).into_owned();
    let vec_z = vec_x.cross(&vec_y);
    let lx = eigen.eigenvalues[order[0]];
    let ly = eigen.eigenvalues[order[1]];
    let lz = eigen.eigenvalues[order[2]];

    ReducedMultipole {
        q00: charge,
        q10: dipole.dot(&vec_z),
        q11c: dipole.dot(&vec_x),
        q11s: dipole.dot(&vec_y),
        q20: lz,
        q22c: (lx - ly) / 3f64.sqrt(),
        vec_x,
        vec_y,
        vec_z,
    }
}

/// Rotation from the local frame of `atom`'s multipole at `bead` into the
/// global frame. Multipoles without a frame use the identity.
pub fn local_frame_rotation(atoms: &[Atom], atom: usize, bead: usize) -> Result<Matrix3<f64>> {
    let natoms = atoms.len();
    let owner = atoms.get(atom).ok_or(QmmmError::AtomIndexOutOfRange {
        index: atom,
        natoms,
        bead,
    })?;
    let pole = &owner.bead(bead)?.multipole;
    let Some(frame) = pole.frame else {
        return Ok(Matrix3::identity());
    };

    let position_of = |index: usize| -> Result<Coord> {
        atoms
            .get(index)
            .ok_or(QmmmError::AtomIndexOutOfRange { index, natoms, bead })
            .and_then(|a| a.position(bead))
    };
    let center = owner.position(bead)?;
    let z_ref = position_of(frame.z_atom)?;
    let x_ref = frame.x_atom.map(position_of).transpose()?;
    let y_ref = frame.y_atom.map(position_of).transpose()?;

    build_local_frame(
        frame.kind,
        &center,
        &z_ref,
        x_ref.as_ref(),
        y_ref.as_ref(),
        frame.chiral_flip,
    )
    .ok_or(QmmmError::DegenerateFrame {
        atom,
        bead,
        kind: frame.kind,
    })
}

/// Global-frame charge, dipole (permanent + induced) and quadrupole of one
/// atom's multipole at one bead.
pub fn global_moments(
    atoms: &[Atom],
    atom: usize,
    bead: usize,
) -> Result<(f64, Vector3<f64>, Matrix3<f64>)> {
    let rotation = local_frame_rotation(atoms, atom, bead)?;
    let pole = &atoms[atom].bead(bead)?.multipole;
    let dipole = rotation * pole.dipole + pole.induced_dipole;
    let quad = rotation * pole.quadrupole.to_matrix() * rotation.transpose();
    Ok((pole.charge, dipole, quad))
}

/// Reduces the multipole of `atom` at `bead` to principal-frame spherical
/// harmonic components.
///
/// # Errors
///
/// [`QmmmError::DegenerateFrame`] when the frame reference atoms are
/// coincident or collinear where a plane is required, and
/// [`QmmmError::AtomIndexOutOfRange`] when a reference index is invalid.
pub fn reduce_multipole(atoms: &[Atom], atom: usize, bead: usize) -> Result<ReducedMultipole> {
    let (charge, dipole, quad) = global_moments(atoms, atom, bead)?;
    Ok(reduce_global(charge, &dipole, &quad))
}

/// Places six charges at `±spacing` along the principal axes around `origin`
/// so that the grid reproduces the monopole, dipole and traceless quadrupole.
pub fn expand_to_charges(reduced: &ReducedMultipole, origin: &Coord, spacing: f64) -> OctCharges {
    let d2 = spacing * spacing;
    let total = reduced.q00;

    // Pair sums along each axis from the monopole and quadrupole, then split
    // each pair by the dipole component.
    let s_z = (total + 2.0 * reduced.q20 / d2) / 3.0;
    let split = 2.0 * reduced.q22c / (3f64.sqrt() * d2);
    let s_x = 0.5 * (total - s_z + split);
    let s_y = 0.5 * (total - s_z - split);

    let half = |sum: f64, mu: f64| (0.5 * sum + 0.5 * mu / spacing, 0.5 * sum - 0.5 * mu / spacing);
    let (px, mx) = half(s_x, reduced.q11c);
    let (py, my) = half(s_y, reduced.q11s);
    let (pz, mz) = half(s_z, reduced.q10);

    let (ex, ey, ez) = (reduced.vec_x * spacing, reduced.vec_y * spacing, reduced.vec_z * spacing);
    OctCharges {
        charges: [px, py, pz, mx, my, mz],
        positions: [
            origin + ex,
            origin + ey,
            origin + ez,
            origin - ex,
            origin - ey,
            origin - ez,
        ],
    }
}

/// Recomputes the point-charge grid of every atom at `bead`.
///
/// All grids are computed before any is stored, so a degenerate frame leaves
/// the bead untouched.
pub fn refresh_point_charges(atoms: &mut [Atom], bead: usize) -> Result<()> {
    let grids = {
        let view: &[Atom] = atoms;
        (0..view.len())
            .into_par_iter()
            .map(|i| {
                let reduced = reduce_multipole(view, i, bead)?;
                Ok(expand_to_charges(&reduced, &view[i].position(bead)?, OCT_GRID_SPACING))
            })
            .collect::<Result<Vec<_>>>()?
    };
    for (atom, grid) in atoms.iter_mut().zip(grids) {
        atom.bead_mut(bead)?.charges = grid;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn traceless(xx: f64, yy: f64, xy: f64, xz: f64, yz: f64) -> Matrix3<f64> {
        Matrix3::new(xx, xy, xz, xy, yy, yz, xz, yz, -(xx + yy))
    }

    #[test]
    fn z_then_x_frame_is_orthonormal_and_right_handed() {
        let center = Vector3::new(0.0, 0.0, 0.0);
        let z_ref = Vector3::new(0.0, 0.0, 1.2);
        let x_ref = Vector3::new(1.0, 0.3, 0.4);
        let r = build_local_frame(FrameKind::ZThenX, &center, &z_ref, Some(&x_ref), None, false)
            .unwrap();
        assert_relative_eq!((r.transpose() * r), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.column(2).into_owned(), Vector3::z(), epsilon = 1e-12);
    }

    #[test]
    fn chiral_flip_negates_y() {
        let center = Vector3::zeros();
        let z_ref = Vector3::new(0.0, 0.0, 1.0);
        let x_ref = Vector3::new(1.0, 0.0, 0.5);
        let plain = build_local_frame(FrameKind::ZThenX, &center, &z_ref, Some(&x_ref), None, false)
            .unwrap();
        let flipped = build_local_frame(FrameKind::ZThenX, &center, &z_ref, Some(&x_ref), None, true)
            .unwrap();
        assert_relative_eq!(flipped.column(1).into_owned(), -plain.column(1).into_owned());
        assert_relative_eq!(flipped.determinant(), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn collinear_references_are_degenerate() {
        let center = Vector3::zeros();
        let z_ref = Vector3::new(0.0, 0.0, 1.0);
        let x_ref = Vector3::new(0.0, 0.0, -2.0);
        for kind in [FrameKind::ZThenX, FrameKind::Bisector] {
            assert!(build_local_frame(kind, &center, &z_ref, Some(&x_ref), None, false).is_none());
        }
    }

    #[test]
    fn z_only_synthesizes_perpendicular_axis() {
        let center = Vector3::zeros();
        let z_ref = Vector3::new(1.0, 0.0, 0.0);
        let r = build_local_frame(FrameKind::ZOnly, &center, &z_ref, None, None, false).unwrap();
        assert_relative_eq!(r.column(0).dot(&r.column(2)), 0.0, epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn reduction_round_trips_global_moments() {
        let dipole = Vector3::new(0.1, -0.25, 0.4);
        let quad = traceless(0.3, -0.1, 0.05, -0.12, 0.2);
        let reduced = reduce_global(-0.7, &dipole, &quad);
        let (q, d, qq) = reduced.to_cartesian();
        assert_eq!(q, -0.7);
        assert_relative_eq!(d, dipole, epsilon = 1e-10);
        assert_relative_eq!(qq, quad, epsilon = 1e-10);
    }

    #[test]
    fn octahedral_grid_reproduces_moments() {
        let dipole = Vector3::new(0.05, 0.02, -0.08);
        let quad = traceless(0.02, 0.01, -0.004, 0.003, 0.006);
        let reduced = reduce_global(0.35, &dipole, &quad);
        let origin = Vector3::new(1.0, -2.0, 0.5);
        let grid = expand_to_charges(&reduced, &origin, OCT_GRID_SPACING);

        let (q, d, qq) = grid.moments(&origin);
        assert_relative_eq!(q, 0.35, epsilon = 1e-12);
        assert_relative_eq!(d, dipole, epsilon = 1e-10);
        assert_relative_eq!(qq, quad, epsilon = 1e-10);
    }

    #[test]
    fn bare_charge_spreads_evenly() {
        let reduced = reduce_global(1.2, &Vector3::zeros(), &Matrix3::zeros());
        let grid = expand_to_charges(&reduced, &Vector3::zeros(), OCT_GRID_SPACING);
        for q in grid.charges {
            assert_relative_eq!(q, 0.2, epsilon = 1e-12);
        }
    }
}
