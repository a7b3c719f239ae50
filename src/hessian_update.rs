//! Inverse Hessian updates for quasi-Newton optimization.
//!
//! The DFP optimizer keeps an approximate inverse Hessian `H` over the
//! flattened coordinates of the unfrozen atoms and refines it after every
//! step from the displacement `s = x_new − x_old` and the gradient change
//! `y = g_new − g_old`:
//!
//! ```text
//! H_new = H + (s·sᵀ)/(sᵀ·y) − (H·y)(H·y)ᵀ/(yᵀ·H·y)
//! ```
//!
//! # References
//!
//! - Fletcher, R.; Powell, M. J. D. Comput. J. 1963, 6, 163-168.

use nalgebra::{DMatrix, DVector};

/// Denominators below this value make the secant update degenerate.
pub const SECANT_EPS: f64 = 1e-12;

/// Initial inverse Hessian: `scale · I`.
pub fn initial_inverse_hessian(n: usize, scale: f64) -> DMatrix<f64> {
    DMatrix::identity(n, n) * scale
}

/// Davidon-Fletcher-Powell inverse Hessian update.
///
/// Returns `None` when either denominator `sᵀ·y` or `yᵀ·H·y` is not safely
/// positive (displacement and gradient change nearly orthogonal, a vanishing
/// gradient change, or negative curvature along the step) or when any input
/// is not finite. The caller then resets the approximation and falls back to
/// a steepest-descent step. Accepting only `sᵀ·y > 0` keeps a positive
/// definite `H` positive definite.
///
/// # Examples
///
/// ```
/// use nalgebra::{DMatrix, DVector};
/// use qmmm::hessian_update::update_inverse_hessian_dfp;
///
/// // Quadratic with Hessian 2·I: one exact secant pair along x
/// let h = DMatrix::identity(2, 2);
/// let s = DVector::from_vec(vec![1.0, 0.0]);
/// let y = DVector::from_vec(vec![2.0, 0.0]);
/// let h_new = update_inverse_hessian_dfp(&h, &s, &y).unwrap();
/// assert!((h_new[(0, 0)] - 0.5).abs() < 1e-12);
/// assert!((h_new[(1, 1)] - 1.0).abs() < 1e-12);
/// ```
pub fn update_inverse_hessian_dfp(
    h_inv: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> Option<DMatrix<f64>> {
    let finite = |v: &f64| v.is_finite();
    if !delta_x.iter().all(finite) || !delta_g.iter().all(finite) || !h_inv.iter().all(finite) {
        return None;
    }

    let s_y = delta_x.dot(delta_g);
    let h_y = h_inv * delta_g;
    let y_h_y = delta_g.dot(&h_y);
    if s_y <= SECANT_EPS || y_h_y <= SECANT_EPS {
        return None;
    }

    let mut h_new = h_inv + (delta_x * delta_x.transpose()) / s_y - (&h_y * h_y.transpose()) / y_h_y;

    // Symmetrize
    h_new = 0.5 * (&h_new + h_new.transpose());
    h_new.iter().all(finite).then_some(h_new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_secant_condition_holds() {
        let h = initial_inverse_hessian(3, 0.7);
        let s = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let y = DVector::from_vec(vec![0.15, 0.25, 0.35]);

        let h_new = update_inverse_hessian_dfp(&h, &s, &y).unwrap();

        // H_new · y = s
        assert!(approx_eq((&h_new * &y - &s).norm(), 0.0, 1e-12));
        assert!(approx_eq((h_new.clone() - h_new.transpose()).norm(), 0.0, 1e-12));
    }

    #[test]
    fn test_orthogonal_pair_is_degenerate() {
        let h = initial_inverse_hessian(2, 1.0);
        let s = DVector::from_vec(vec![1.0, 0.0]);
        let y = DVector::from_vec(vec![0.0, 1.0]);
        assert!(update_inverse_hessian_dfp(&h, &s, &y).is_none());
    }

    #[test]
    fn test_negative_curvature_is_rejected() {
        // Concave along x: the gradient change opposes the step
        let h = initial_inverse_hessian(2, 0.5);
        let s = DVector::from_vec(vec![0.1, 0.0]);
        let y = DVector::from_vec(vec![-0.4, 0.0]);
        assert!(update_inverse_hessian_dfp(&h, &s, &y).is_none());

        let y = DVector::from_vec(vec![0.4, 0.0]);
        let h_new = update_inverse_hessian_dfp(&h, &s, &y).unwrap();
        assert!(h_new.symmetric_eigenvalues().iter().all(|&l| l > 0.0));
    }

    #[test]
    fn test_zero_gradient_change_is_degenerate() {
        let h = initial_inverse_hessian(3, 1.0);
        let s = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let y = DVector::zeros(3);
        assert!(update_inverse_hessian_dfp(&h, &s, &y).is_none());
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let h = initial_inverse_hessian(2, 1.0);
        let s = DVector::from_vec(vec![f64::NAN, 0.0]);
        let y = DVector::from_vec(vec![1.0, 0.0]);
        assert!(update_inverse_hessian_dfp(&h, &s, &y).is_none());
    }
}
