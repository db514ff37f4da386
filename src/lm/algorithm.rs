//! Implementation of the Levenberg-Marquardt algorithm.
//!
//! This module contains the core damped Gauss-Newton loop used by every fit in
//! the crate. Steps solve `(JᵀJ + λ·diag(JᵀJ)) δ = −Jᵀr` by Cholesky
//! factorization of the normal equations.

use log::debug;
use ndarray::{Array1, Array2};
use std::fmt;

use crate::error::{Result, XrfError};
use crate::parameters::Parameters;
use crate::problem::Problem;
use crate::utils::{finite_difference, ndarray_to_nalgebra};

use super::bounded::BoundedProblem;
use super::config::{DiffMethod, LmConfig};
use super::convergence::{ConvergenceCriteria, ConvergenceStatus};

/// Smallest diagonal scale used for Marquardt damping.
const DIAG_FLOOR: f64 = 1e-30;

/// Result of the Levenberg-Marquardt optimization.
#[derive(Debug, Clone)]
pub struct LmResult {
    /// Optimized parameter values
    pub params: Array1<f64>,

    /// Residuals at the solution
    pub residuals: Array1<f64>,

    /// Sum of squared residuals
    pub cost: f64,

    /// Number of iterations performed
    pub iterations: usize,

    /// Number of function evaluations
    pub func_evals: usize,

    /// Whether the optimization converged
    pub success: bool,

    /// Why the loop stopped
    pub status: ConvergenceStatus,

    /// A message describing the result
    pub message: String,

    /// The Jacobian matrix at the solution (if requested)
    pub jacobian: Option<Array2<f64>>,
}

impl fmt::Display for LmResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optimization Result:")?;
        writeln!(f, "  Success: {}", self.success)?;
        writeln!(f, "  Message: {}", self.message)?;
        writeln!(f, "  Cost: {:.6e}", self.cost)?;
        writeln!(f, "  Iterations: {}", self.iterations)?;
        writeln!(f, "  Function evaluations: {}", self.func_evals)?;
        writeln!(f, "  Parameters: {:?}", self.params)?;
        Ok(())
    }
}

/// Snapshot handed to iteration observers after every accepted step.
#[derive(Debug, Clone)]
pub struct IterationState<'a> {
    /// Completed iterations
    pub iteration: usize,

    /// Cost after the step
    pub cost: f64,

    /// Parameter values after the step
    pub params: &'a Array1<f64>,

    /// Damping used for the step
    pub lambda: f64,
}

/// Outcome of a bounded fit: the final parameter collection plus the raw result.
#[derive(Debug, Clone)]
pub struct BoundedFit {
    /// Parameters holding the optimized (external) values
    pub parameters: Parameters,

    /// Optimizer result in internal coordinates
    pub result: LmResult,
}

/// The Levenberg-Marquardt optimizer.
#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    /// Configuration options
    config: LmConfig,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt optimizer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Levenberg-Marquardt optimizer with the given configuration.
    pub fn with_config(config: LmConfig) -> Self {
        Self { config }
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Set the tolerance for the relative cost reduction.
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.config.ftol = ftol;
        self
    }

    /// Set the tolerance for change in parameter values.
    pub fn with_xtol(mut self, xtol: f64) -> Self {
        self.config.xtol = xtol;
        self
    }

    /// Set the tolerance for the scaled gradient.
    pub fn with_gtol(mut self, gtol: f64) -> Self {
        self.config.gtol = gtol;
        self
    }

    /// Set the initial damping parameter.
    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.config.initial_lambda = lambda;
        self
    }

    /// Set the method for calculating the Jacobian.
    pub fn with_differentiation_method(mut self, method: DiffMethod) -> Self {
        self.config.diff_method = method;
        self
    }

    /// Return the Jacobian at the solution.
    pub fn with_calc_jacobian(mut self, calc_jacobian: bool) -> Self {
        self.config.calc_jacobian = calc_jacobian;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    /// Minimize the sum of squared residuals for the given problem.
    ///
    /// # Arguments
    ///
    /// * `problem` - The problem to solve
    /// * `initial_params` - Initial guess for the parameter values
    ///
    /// # Returns
    ///
    /// * `Result<LmResult>` - The result of the optimization. Non-convergence is
    ///   reported through `success`, not as an error.
    pub fn minimize<P: Problem + ?Sized>(
        &self,
        problem: &P,
        initial_params: Array1<f64>,
    ) -> Result<LmResult> {
        self.minimize_with_observer(problem, initial_params, &mut |_| {})
    }

    /// Minimize, calling `observer` after every accepted step.
    pub fn minimize_with_observer<P: Problem + ?Sized>(
        &self,
        problem: &P,
        initial_params: Array1<f64>,
        observer: &mut dyn FnMut(&IterationState),
    ) -> Result<LmResult> {
        let n_params = problem.parameter_count();
        if initial_params.len() != n_params {
            return Err(XrfError::DimensionMismatch(format!(
                "Expected {} parameters, got {}",
                n_params,
                initial_params.len()
            )));
        }

        let criteria = ConvergenceCriteria::from(&self.config);
        let mut params = initial_params;
        let mut lambda = self.config.initial_lambda;

        let mut residuals = problem.eval(&params)?;
        let mut func_evals = 1;
        let mut cost = sum_of_squares(&residuals);
        if !cost.is_finite() {
            return Err(XrfError::FunctionEvaluation(
                "Cost is not finite at the initial parameters".to_string(),
            ));
        }

        let mut iterations = 0;
        let status = if n_params == 0 {
            ConvergenceStatus::ParameterConvergence
        } else {
            loop {
                if iterations >= self.config.max_iterations {
                    break ConvergenceStatus::MaxIterationsReached;
                }

                let jacobian = self.evaluate_jacobian(problem, &params)?;
                func_evals += if self.uses_analytic_jacobian(problem) { 0 } else { n_params };

                let jtj = jacobian.t().dot(&jacobian);
                let gradient = jacobian.t().dot(&residuals);

                let gradient_status = criteria.check_gradient(scaled_gradient(&jtj, &gradient, cost));
                if gradient_status.is_terminated() {
                    break gradient_status;
                }

                // Inner loop: raise the damping until a step lowers the cost
                let mut accepted = None;
                let mut first_step_negligible = None;
                while accepted.is_none() {
                    if let Some(step) = solve_damped(&jtj, &gradient, lambda) {
                        first_step_negligible
                            .get_or_insert_with(|| criteria.is_negligible_step(&params, &step));
                        let new_params = &params + &step;
                        let new_residuals = problem.eval(&new_params)?;
                        func_evals += 1;
                        let new_cost = sum_of_squares(&new_residuals);

                        if new_cost.is_finite() && new_cost < cost {
                            // Linearized model reduction: -(2 gᵀδ + δᵀJᵀJδ)
                            let predicted = -(2.0 * gradient.dot(&step) + step.dot(&jtj.dot(&step)));
                            accepted = Some((new_params, new_residuals, new_cost, predicted));
                            break;
                        }
                    }

                    lambda *= self.config.lambda_up_factor;
                    if lambda > self.config.max_lambda {
                        break;
                    }
                }

                let Some((new_params, new_residuals, new_cost, predicted)) = accepted else {
                    // A start already at the rounding floor is converged, not stalled
                    break if iterations > 0 {
                        ConvergenceStatus::NoFurtherReduction
                    } else if first_step_negligible == Some(true) {
                        ConvergenceStatus::ParameterConvergence
                    } else {
                        ConvergenceStatus::Stalled
                    };
                };

                iterations += 1;
                let status = criteria.check_step(
                    &params,
                    &new_params,
                    cost,
                    new_cost,
                    predicted,
                    iterations,
                );

                params = new_params;
                residuals = new_residuals;
                cost = new_cost;
                lambda = (lambda * self.config.lambda_down_factor).max(self.config.min_lambda);

                debug!(
                    "LM iteration {}: cost = {:.6e}, lambda = {:.1e}",
                    iterations, cost, lambda
                );
                observer(&IterationState {
                    iteration: iterations,
                    cost,
                    params: &params,
                    lambda,
                });

                if status.is_terminated() {
                    break status;
                }
            }
        };

        let jacobian = if self.config.calc_jacobian {
            Some(self.evaluate_jacobian(problem, &params)?)
        } else {
            None
        };

        Ok(LmResult {
            params,
            residuals,
            cost,
            iterations,
            func_evals,
            success: status.is_converged(),
            status,
            message: status.description().to_string(),
            jacobian,
        })
    }

    /// Minimize a problem over a bounded parameter collection.
    ///
    /// The optimizer works on the unconstrained internal vector; the observer
    /// and the returned [`BoundedFit`] see external values.
    pub fn minimize_bounded<P: Problem + ?Sized>(
        &self,
        problem: &P,
        parameters: &Parameters,
        observer: &mut dyn FnMut(&IterationState),
    ) -> Result<BoundedFit> {
        let bounded = BoundedProblem::new(problem, parameters)?;
        let start = parameters.varying_internal()?;

        let mut external_observer = |state: &IterationState| {
            if let Ok(external) = parameters.external_from_internal(state.params) {
                observer(&IterationState {
                    iteration: state.iteration,
                    cost: state.cost,
                    params: &external,
                    lambda: state.lambda,
                });
            }
        };

        let result = self.minimize_with_observer(&bounded, start, &mut external_observer)?;
        let external = parameters.external_from_internal(&result.params)?;

        Ok(BoundedFit {
            parameters: parameters.with_values(&external)?,
            result,
        })
    }

    fn uses_analytic_jacobian<P: Problem + ?Sized>(&self, problem: &P) -> bool {
        self.config.diff_method == DiffMethod::Analytical && problem.has_custom_jacobian()
    }

    fn evaluate_jacobian<P: Problem + ?Sized>(
        &self,
        problem: &P,
        params: &Array1<f64>,
    ) -> Result<Array2<f64>> {
        if self.uses_analytic_jacobian(problem) {
            problem.jacobian(params)
        } else {
            finite_difference::jacobian(&|p| problem.eval(p), params, Some(self.config.diff_step))
        }
    }
}

fn sum_of_squares(residuals: &Array1<f64>) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

/// Largest cosine between the residual vector and a Jacobian column.
fn scaled_gradient(jtj: &Array2<f64>, gradient: &Array1<f64>, cost: f64) -> f64 {
    if cost <= 0.0 {
        return 0.0;
    }
    let residual_norm = cost.sqrt();
    gradient
        .iter()
        .enumerate()
        .filter(|&(i, _)| jtj[[i, i]] > 0.0)
        .map(|(i, g)| g.abs() / (jtj[[i, i]].sqrt() * residual_norm))
        .fold(0.0, f64::max)
}

/// Solve `(JᵀJ + λ·D) δ = −g` with `D = diag(JᵀJ)`.
///
/// Returns `None` when the damped matrix is not positive definite.
fn solve_damped(jtj: &Array2<f64>, gradient: &Array1<f64>, lambda: f64) -> Option<Array1<f64>> {
    let mut a = jtj.clone();
    for i in 0..a.nrows() {
        a[[i, i]] += lambda * jtj[[i, i]].max(DIAG_FLOOR);
    }
    let rhs = gradient.mapv(|g| -g);
    let step = cholesky_solve(&a, &rhs).or_else(|| qr_solve(&a, &rhs))?;
    if step.iter().all(|s| s.is_finite()) {
        Some(step)
    } else {
        None
    }
}

/// Least-squares solve through nalgebra's QR, used when Cholesky breaks down.
fn qr_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let qr = ndarray_to_nalgebra(a).qr();
    let rhs = nalgebra::DVector::from_iterator(b.len(), b.iter().cloned());
    qr.solve(&rhs).map(|x| x.iter().cloned().collect())
}

/// Solve a symmetric positive definite system by Cholesky factorization.
pub(crate) fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for k in 0..n {
        let mut diag = a[[k, k]];
        for j in 0..k {
            diag -= l[[k, j]] * l[[k, j]];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return None;
        }
        let lkk = diag.sqrt();
        l[[k, k]] = lkk;

        for i in k + 1..n {
            let mut value = a[[i, k]];
            for j in 0..k {
                value -= l[[i, j]] * l[[k, j]];
            }
            l[[i, k]] = value / lkk;
        }
    }

    // Forward substitution (L * y = b)
    let mut y = b.clone();
    for i in 0..n {
        for j in 0..i {
            y[i] -= l[[i, j]] * y[j];
        }
        y[i] /= l[[i, i]];
    }

    // Backward substitution (L^T * x = y)
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        x[i] = y[i];
        for j in (i + 1)..n {
            x[i] -= l[[j, i]] * x[j];
        }
        x[i] /= l[[i, i]];
    }

    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{Bounds, Parameter};
    use approx::assert_relative_eq;
    use ndarray::array;

    /// FWHM(E) = sqrt(a^2 + b * E) against exact data
    struct ResolutionCurve {
        energy: Array1<f64>,
        fwhm: Array1<f64>,
    }

    impl ResolutionCurve {
        fn new(a: f64, b: f64) -> Self {
            let energy = Array1::linspace(1.0, 17.0, 12);
            let fwhm = energy.mapv(|e| (a * a + b * e).sqrt());
            Self { energy, fwhm }
        }
    }

    impl Problem for ResolutionCurve {
        fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
            Ok(self
                .energy
                .iter()
                .zip(self.fwhm.iter())
                .map(|(e, f)| (params[0] * params[0] + params[1] * e).max(0.0).sqrt() - f)
                .collect())
        }

        fn parameter_count(&self) -> usize {
            2
        }

        fn residual_count(&self) -> usize {
            self.energy.len()
        }
    }

    #[test]
    fn test_unbounded_fit() {
        let problem = ResolutionCurve::new(0.12, 0.02);
        let result = LevenbergMarquardt::new()
            .minimize(&problem, array![0.2, 0.01])
            .unwrap();

        assert!(result.success, "{}", result.message);
        assert_relative_eq!(result.params[0].abs(), 0.12, epsilon = 1e-6);
        assert_relative_eq!(result.params[1], 0.02, epsilon = 1e-7);
        assert!(result.cost < 1e-14);
    }

    #[test]
    fn test_bounded_fit_and_observer() {
        let problem = ResolutionCurve::new(0.12, 0.02);
        let mut params = Parameters::new();
        params
            .add(Parameter::new("a", 0.08, Bounds::new(0.05, 0.25).unwrap()))
            .unwrap();
        params
            .add(Parameter::new("b", 0.005, Bounds::new(0.0, 0.05).unwrap()))
            .unwrap();

        let mut seen = Vec::new();
        let fit = LevenbergMarquardt::new()
            .minimize_bounded(&problem, &params, &mut |state| {
                seen.push((state.iteration, state.params[0]));
            })
            .unwrap();

        assert!(fit.result.success);
        assert_relative_eq!(fit.parameters.get("a").unwrap().value(), 0.12, epsilon = 1e-6);
        assert_relative_eq!(fit.parameters.get("b").unwrap().value(), 0.02, epsilon = 1e-7);

        // Observer sees external values and consecutive iterations
        assert!(!seen.is_empty());
        assert_eq!(seen[0].0, 1);
        assert!(seen.iter().all(|(_, a)| *a >= 0.05 && *a <= 0.25));
    }

    #[test]
    fn test_bound_is_respected() {
        // True a = 0.12 lies outside [0.13, 0.25]; the fit must stop at the limit
        let problem = ResolutionCurve::new(0.12, 0.02);
        let mut params = Parameters::new();
        params
            .add(Parameter::new("a", 0.2, Bounds::new(0.13, 0.25).unwrap()))
            .unwrap();
        params
            .add(Parameter::new("b", 0.01, Bounds::new(0.0, 0.05).unwrap()))
            .unwrap();

        let fit = LevenbergMarquardt::new()
            .minimize_bounded(&problem, &params, &mut |_| {})
            .unwrap();
        let a = fit.parameters.get("a").unwrap().value();
        assert!(a >= 0.13 && a < 0.131);
    }

    #[test]
    fn test_max_iterations_reported() {
        let problem = ResolutionCurve::new(0.12, 0.02);
        let result = LevenbergMarquardt::new()
            .with_max_iterations(1)
            .minimize(&problem, array![1.0, 0.5])
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.status, ConvergenceStatus::MaxIterationsReached);
        assert_eq!(result.iterations, 1);
    }

    /// r = p - 1 with a Jacobian of the wrong sign: every step goes uphill.
    struct Uphill;

    impl Problem for Uphill {
        fn eval(&self, p: &Array1<f64>) -> Result<Array1<f64>> {
            Ok(array![p[0] - 1.0])
        }

        fn parameter_count(&self) -> usize {
            1
        }

        fn residual_count(&self) -> usize {
            1
        }

        fn jacobian(&self, _p: &Array1<f64>) -> Result<Array2<f64>> {
            Ok(array![[-1.0]])
        }

        fn has_custom_jacobian(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_stall_at_start_is_not_convergence() {
        let result = LevenbergMarquardt::new().minimize(&Uphill, array![3.0]).unwrap();
        assert_eq!(result.status, ConvergenceStatus::Stalled);
        assert!(!result.success);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.params[0], 3.0);
        assert!(result.message.contains("starting point"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let problem = ResolutionCurve::new(0.12, 0.02);
        assert!(LevenbergMarquardt::new()
            .minimize(&problem, array![1.0])
            .is_err());
    }

    #[test]
    fn test_cholesky_solve() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![2.0, 1.0];
        let x = cholesky_solve(&a, &b).unwrap();
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.0, epsilon = 1e-12);

        assert!(cholesky_solve(&array![[1.0, 2.0], [2.0, 1.0]], &b).is_none());
    }

    #[test]
    fn test_qr_fallback_on_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        let b = array![3.0, 3.0];
        let x = qr_solve(&a, &b).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-12);
    }
}
