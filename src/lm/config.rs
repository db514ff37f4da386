//! Configuration options for the Levenberg-Marquardt algorithm.
//!
//! This module defines the tolerances and damping schedule used by
//! [`LevenbergMarquardt`](super::LevenbergMarquardt).

use serde::{Deserialize, Serialize};

/// Method for calculating the Jacobian matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffMethod {
    /// Always use forward finite differences
    FiniteDifference,

    /// Use the analytical Jacobian when the problem provides one
    Analytical,
}

impl Default for DiffMethod {
    fn default() -> Self {
        DiffMethod::Analytical
    }
}

/// Configuration options for the Levenberg-Marquardt algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    /// Maximum number of iterations. Default: 200
    pub max_iterations: usize,

    /// Tolerance on the actual and predicted relative cost reduction. Default: 1e-10
    pub ftol: f64,

    /// Tolerance for change in (internal) parameter values. Default: 1e-10
    pub xtol: f64,

    /// Tolerance for the scaled gradient (cosine between residual and Jacobian columns). Default: 1e-10
    pub gtol: f64,

    /// Initial value for the damping parameter. Default: 1e-3
    pub initial_lambda: f64,

    /// Factor by which to increase lambda. Default: 10.0
    pub lambda_up_factor: f64,

    /// Factor by which to decrease lambda. Default: 0.1
    pub lambda_down_factor: f64,

    /// Minimum value for lambda. Default: 1e-12
    pub min_lambda: f64,

    /// Maximum value for lambda. Default: 1e12
    pub max_lambda: f64,

    /// Relative finite-difference step. Default: 1e-8
    pub diff_step: f64,

    /// Method to use for calculating the Jacobian. Default: Analytical
    pub diff_method: DiffMethod,

    /// Whether to return the Jacobian at the solution. Default: false
    pub calc_jacobian: bool,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            initial_lambda: 1e-3,
            lambda_up_factor: 10.0,
            lambda_down_factor: 0.1,
            min_lambda: 1e-12,
            max_lambda: 1e12,
            diff_step: 1e-8,
            diff_method: DiffMethod::default(),
            calc_jacobian: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config = LmConfig::default();
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.diff_method, DiffMethod::Analytical);

        // Missing fields fall back to defaults
        let config: LmConfig = serde_json::from_str(r#"{"max_iterations": 50, "ftol": 1e-6}"#).unwrap();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.ftol, 1e-6);
        assert_eq!(config.xtol, 1e-10);
    }
}
