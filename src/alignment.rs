//! Kabsch superposition of flattened geometries.
//!
//! Geometries are flattened `[x1, y1, z1, x2, ...]` vectors as produced by
//! [`System::flatten_bead`](crate::geometry::System::flatten_bead). The
//! optimal rotation is found from the SVD of the 3×3 covariance of the two
//! centred point sets, with the handedness fixed so that reflections are
//! never returned.
//!
//! # References
//!
//! - Kabsch, W. Acta Cryst. A 1976, 32, 922-923.

use nalgebra::{DVector, Matrix3, Vector3};

fn points(x: &DVector<f64>) -> Vec<Vector3<f64>> {
    x.as_slice()
        .chunks_exact(3)
        .map(|c| Vector3::new(c[0], c[1], c[2]))
        .collect()
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len().max(1) as f64
}

/// Proper rotation `R` minimizing `Σ |R·(mobile_i − c_m) − (reference_i − c_r)|²`.
pub fn kabsch_rotation(reference: &DVector<f64>, mobile: &DVector<f64>) -> Matrix3<f64> {
    let p = points(mobile);
    let q = points(reference);
    let (cp, cq) = (centroid(&p), centroid(&q));
    let covariance: Matrix3<f64> = p
        .iter()
        .zip(&q)
        .map(|(pi, qi)| (pi - cp) * (qi - cq).transpose())
        .sum();

    let svd = covariance.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    v * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d)) * u.transpose()
}

/// Displacement of `mobile` from `reference` after optimal superposition,
/// flattened like the inputs.
///
/// # Examples
///
/// ```
/// use nalgebra::DVector;
/// use qmmm::alignment::kabsch_displacement;
///
/// let reference = DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
/// // Same pair, turned by 90° and shifted
/// let mobile = DVector::from_vec(vec![5.0, 5.0, 0.0, 5.0, 6.0, 0.0]);
/// assert!(kabsch_displacement(&reference, &mobile).norm() < 1e-12);
/// ```
pub fn kabsch_displacement(reference: &DVector<f64>, mobile: &DVector<f64>) -> DVector<f64> {
    let rotation = kabsch_rotation(reference, mobile);
    let p = points(mobile);
    let q = points(reference);
    let (cp, cq) = (centroid(&p), centroid(&q));
    DVector::from_iterator(
        p.len() * 3,
        p.iter().zip(&q).flat_map(|(pi, qi)| {
            let d = rotation * (pi - cp) + cq - qi;
            [d.x, d.y, d.z]
        }),
    )
}

/// RMS displacement per atom after optimal superposition.
pub fn aligned_rms_displacement(reference: &DVector<f64>, mobile: &DVector<f64>) -> f64 {
    let natoms = reference.len() / 3;
    if natoms == 0 {
        return 0.0;
    }
    (kabsch_displacement(reference, mobile).norm_squared() / natoms as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn water() -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.0, 0.1, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0])
    }

    fn moved(x: &DVector<f64>, rotation: &Rotation3<f64>, shift: Vector3<f64>) -> DVector<f64> {
        let flat: Vec<f64> = points(x)
            .iter()
            .flat_map(|p| {
                let r = rotation * p + shift;
                [r.x, r.y, r.z]
            })
            .collect();
        DVector::from_vec(flat)
    }

    #[test]
    fn rigid_motion_leaves_no_displacement() {
        let x = water();
        let rotation = Rotation3::from_euler_angles(0.3, -0.7, 1.1);
        let y = moved(&x, &rotation, Vector3::new(1.0, -2.0, 0.5));
        assert!(crate::optimizer::rms_displacement(&x, &y) > 0.5);
        assert_relative_eq!(aligned_rms_displacement(&x, &y), 0.0, epsilon = 1e-10);

        let r = kabsch_rotation(&x, &y);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-10);
        assert_relative_eq!(r, rotation.inverse().into_inner(), epsilon = 1e-10);
    }

    #[test]
    fn internal_change_survives_alignment() {
        let x = water();
        let mut y = x.clone();
        // Stretch one O-H bond
        y[3] += 0.1;
        let aligned = aligned_rms_displacement(&x, &y);
        assert!(aligned > 0.0);
        assert!(aligned <= crate::optimizer::rms_displacement(&x, &y) + 1e-12);
    }

    #[test]
    fn single_atom_aligns_by_translation() {
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let y = DVector::from_vec(vec![-4.0, 0.0, 9.0]);
        assert_relative_eq!(aligned_rms_displacement(&x, &y), 0.0, epsilon = 1e-12);
    }
}
