//! Problem definition trait.
//!
//! This module defines the `Problem` trait, which represents a nonlinear
//! least squares problem to be solved with the Levenberg-Marquardt algorithm.
//! Peak fits, resolution-model fits and the instrument calibration objective
//! are all expressed as `Problem`s.

use ndarray::{Array1, Array2};

use crate::error::Result;

/// A nonlinear least squares problem over an unbounded parameter vector.
///
/// Bounds are handled by the solver, which maps bounded external parameters
/// onto the internal vector passed here.
pub trait Problem {
    /// Residuals at `params`.
    fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>>;

    /// Get the number of parameters in the problem.
    fn parameter_count(&self) -> usize;

    /// Get the number of residuals in the problem.
    fn residual_count(&self) -> usize;

    /// Evaluate the Jacobian matrix at the given parameters.
    ///
    /// The default implementation uses forward finite differences.
    fn jacobian(&self, params: &Array1<f64>) -> Result<Array2<f64>> {
        crate::utils::finite_difference::jacobian(&|p| self.eval(p), params, None)
    }

    /// Check if this problem provides a custom Jacobian implementation.
    fn has_custom_jacobian(&self) -> bool {
        false
    }
}
