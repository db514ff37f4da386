//! Convergence criteria for the Levenberg-Marquardt loop.

use ndarray::Array1;

use super::config::LmConfig;

/// Possible convergence states for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// The algorithm is still running.
    Running,

    /// Converged due to a small parameter change.
    ParameterConvergence,

    /// Converged because both the actual and predicted cost reductions are small.
    FunctionValueConvergence,

    /// Converged due to a small scaled gradient.
    GradientConvergence,

    /// The damping saturated without finding a step that lowers the cost.
    NoFurtherReduction,

    /// The damping saturated before any step was accepted.
    Stalled,

    /// Terminated after reaching the maximum number of iterations.
    MaxIterationsReached,

    /// Terminated due to a numerical error (non-finite cost).
    NumericalError,
}

impl ConvergenceStatus {
    /// Returns true if the optimization has terminated (either converged or failed).
    pub fn is_terminated(&self) -> bool {
        !matches!(self, ConvergenceStatus::Running)
    }

    /// Returns true if the optimization has converged.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            ConvergenceStatus::ParameterConvergence
                | ConvergenceStatus::FunctionValueConvergence
                | ConvergenceStatus::GradientConvergence
                | ConvergenceStatus::NoFurtherReduction
        )
    }

    /// Returns a description of the convergence status.
    pub fn description(&self) -> &'static str {
        match self {
            ConvergenceStatus::Running => "Optimization is still running",
            ConvergenceStatus::ParameterConvergence => "Converged: small parameter change",
            ConvergenceStatus::FunctionValueConvergence => "Converged: small cost reduction",
            ConvergenceStatus::GradientConvergence => "Converged: small gradient",
            ConvergenceStatus::NoFurtherReduction => "Converged: cost cannot be reduced further",
            ConvergenceStatus::Stalled => "Terminated: no step lowered the cost from the starting point",
            ConvergenceStatus::MaxIterationsReached => "Terminated: maximum iterations reached",
            ConvergenceStatus::NumericalError => "Terminated: numerical error",
        }
    }
}

/// Criteria for determining when the optimization has converged.
#[derive(Debug, Clone)]
pub struct ConvergenceCriteria {
    /// Tolerance for change in parameter values.
    pub xtol: f64,

    /// Tolerance for relative cost reduction.
    pub ftol: f64,

    /// Tolerance for the scaled gradient.
    pub gtol: f64,

    /// Maximum number of iterations.
    pub max_iterations: usize,
}

impl From<&LmConfig> for ConvergenceCriteria {
    fn from(config: &LmConfig) -> Self {
        Self {
            xtol: config.xtol,
            ftol: config.ftol,
            gtol: config.gtol,
            max_iterations: config.max_iterations,
        }
    }
}

impl ConvergenceCriteria {
    /// Whether a step moves every parameter by no more than `xtol`, relative
    /// to the larger of its magnitude and one.
    pub fn is_negligible_step(&self, params: &Array1<f64>, step: &Array1<f64>) -> bool {
        step.iter()
            .zip(params.iter())
            .map(|(d, p)| d.abs() / p.abs().max(1.0))
            .fold(0.0, f64::max)
            <= self.xtol
    }

    /// Checks an accepted step.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameter values before the step
    /// * `new_params` - Parameter values after the step
    /// * `cost` - Cost before the step
    /// * `new_cost` - Cost after the step
    /// * `predicted_reduction` - Cost reduction predicted by the linearized model
    /// * `iterations` - Number of completed iterations, including this one
    pub fn check_step(
        &self,
        params: &Array1<f64>,
        new_params: &Array1<f64>,
        cost: f64,
        new_cost: f64,
        predicted_reduction: f64,
        iterations: usize,
    ) -> ConvergenceStatus {
        if !new_cost.is_finite() {
            return ConvergenceStatus::NumericalError;
        }

        let scale = cost.max(f64::MIN_POSITIVE);
        let actual = (cost - new_cost).abs() / scale;
        let predicted = predicted_reduction.abs() / scale;
        if actual <= self.ftol && predicted <= self.ftol {
            return ConvergenceStatus::FunctionValueConvergence;
        }

        if self.is_negligible_step(params, &(new_params - params)) {
            return ConvergenceStatus::ParameterConvergence;
        }

        if iterations >= self.max_iterations {
            return ConvergenceStatus::MaxIterationsReached;
        }

        ConvergenceStatus::Running
    }

    /// Checks the scaled gradient at the current point.
    pub fn check_gradient(&self, scaled_gradient: f64) -> ConvergenceStatus {
        if scaled_gradient <= self.gtol {
            ConvergenceStatus::GradientConvergence
        } else {
            ConvergenceStatus::Running
        }
    }
}
