//! # Covariance Matrix Calculations
//!
//! Covariance, correlation and standard errors from the Jacobian at a fitted
//! solution.

use log::warn;
use ndarray::{Array1, Array2};

use crate::error::{Result, XrfError};
use crate::utils::{nalgebra_to_ndarray, ndarray_to_nalgebra};

/// Calculate covariance matrix from Jacobian matrix.
///
/// For nonlinear least-squares problems, the covariance matrix is estimated as:
///   covar = redchi * inv(J^T * J)
/// where:
///   - J is the Jacobian matrix
///   - redchi is the reduced chi-square (chi^2 / dof)
///
/// A singular `J^T J` falls back to the Moore-Penrose pseudo-inverse.
pub fn calculate_covariance(jacobian: &Array2<f64>, redchi: f64) -> Result<Array2<f64>> {
    let jtj = ndarray_to_nalgebra(&jacobian.t().dot(jacobian));

    let inverse = match jtj.clone().try_inverse() {
        Some(inv) if inv.iter().all(|v| v.is_finite()) => inv,
        _ => {
            warn!("J^T J is singular; using the pseudo-inverse for the covariance");
            jtj.pseudo_inverse(1e-14)
                .map_err(|e| XrfError::SingularMatrix(e.to_string()))?
        }
    };

    Ok(nalgebra_to_ndarray(&inverse).mapv(|v| v * redchi))
}

/// Calculate correlation matrix from covariance matrix.
///
/// The correlation matrix is calculated as:
///   correl[i,j] = covar[i,j] / sqrt(covar[i,i] * covar[j,j])
pub fn calculate_correlation(covar: &Array2<f64>) -> Array2<f64> {
    let n = covar.nrows();
    Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j {
            return 1.0;
        }
        let denom = (covar[[i, i]] * covar[[j, j]]).sqrt();
        if denom > 0.0 {
            covar[[i, j]] / denom
        } else {
            0.0
        }
    })
}

/// Extract standard errors from the covariance matrix.
///
/// Standard errors are the square roots of the diagonal elements
/// of the covariance matrix. Negative diagonals (numerical noise) give zero.
pub fn standard_errors_from_covariance(covar: &Array2<f64>) -> Array1<f64> {
    covar.diag().mapv(|v| if v > 0.0 { v.sqrt() } else { 0.0 })
}

/// Reduced chi-square with the degrees of freedom floored at one.
pub fn reduced_chi_square(chi_square: f64, n_points: usize, n_params: usize) -> f64 {
    let dof = n_points.saturating_sub(n_params).max(1);
    chi_square / dof as f64
}
