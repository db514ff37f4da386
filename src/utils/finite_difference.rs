//! Forward-difference Jacobians for problems without analytic derivatives.

use crate::error::{Result, XrfError};
use ndarray::{Array1, Array2};

/// Default step size for finite differences.
const DEFAULT_EPSILON: f64 = 1e-8;

/// Step for parameter `value`, scaled to its magnitude.
fn step_for(value: f64, eps: f64) -> f64 {
    if value.abs() > eps {
        value.abs() * eps
    } else {
        eps
    }
}

/// Compute the Jacobian matrix using forward finite differences.
///
/// The Jacobian is the matrix of partial derivatives of the residuals with
/// respect to the parameters: J[i,j] = ∂residual[i]/∂param[j].
///
/// # Arguments
///
/// * `residuals_fn` - Function returning the residual vector
/// * `params` - The parameter values at which to evaluate the Jacobian
/// * `epsilon` - The relative step size for finite differences (optional)
///
/// # Returns
///
/// * `Result<Array2<f64>>` - The Jacobian matrix
pub fn jacobian(
    residuals_fn: &dyn Fn(&Array1<f64>) -> Result<Array1<f64>>,
    params: &Array1<f64>,
    epsilon: Option<f64>,
) -> Result<Array2<f64>> {
    let eps = epsilon.unwrap_or(DEFAULT_EPSILON);
    let n_params = params.len();

    let residuals = residuals_fn(params)?;
    let n_residuals = residuals.len();
    let mut jac = Array2::zeros((n_residuals, n_params));

    for j in 0..n_params {
        let mut params_perturbed = params.clone();
        let eps_j = step_for(params[j], eps);
        params_perturbed[j] += eps_j;

        let residuals_perturbed = residuals_fn(&params_perturbed)?;
        if residuals_perturbed.len() != n_residuals {
            return Err(XrfError::DimensionMismatch(format!(
                "Expected {} residuals, got {}",
                n_residuals,
                residuals_perturbed.len()
            )));
        }

        for i in 0..n_residuals {
            jac[[i, j]] = (residuals_perturbed[i] - residuals[i]) / eps_j;
        }
    }

    Ok(jac)
}
