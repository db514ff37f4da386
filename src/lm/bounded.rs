//! Adapter that runs a problem over bounded parameters.
//!
//! The wrapped problem is evaluated on the full external parameter vector; the
//! optimizer sees only the varying parameters, in sine-transformed internal
//! coordinates.

use ndarray::{Array1, Array2};

use crate::error::Result;
use crate::parameters::Parameters;
use crate::problem::Problem;

/// A [`Problem`] in internal coordinates of a [`Parameters`] collection.
pub struct BoundedProblem<'a, P: Problem + ?Sized> {
    inner: &'a P,
    parameters: &'a Parameters,
    varying: Vec<usize>,
}

impl<'a, P: Problem + ?Sized> BoundedProblem<'a, P> {
    /// Wrap `inner`, whose parameter vector matches `parameters` in order.
    pub fn new(inner: &'a P, parameters: &'a Parameters) -> Result<Self> {
        if inner.parameter_count() != parameters.len() {
            return Err(crate::error::XrfError::DimensionMismatch(format!(
                "Problem expects {} parameters, collection holds {}",
                inner.parameter_count(),
                parameters.len()
            )));
        }
        let varying = parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.vary())
            .map(|(i, _)| i)
            .collect();
        Ok(Self {
            inner,
            parameters,
            varying,
        })
    }
}

impl<'a, P: Problem + ?Sized> Problem for BoundedProblem<'a, P> {
    fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let external = self.parameters.external_from_internal(params)?;
        self.inner.eval(&external)
    }

    fn parameter_count(&self) -> usize {
        self.varying.len()
    }

    fn residual_count(&self) -> usize {
        self.inner.residual_count()
    }

    fn jacobian(&self, params: &Array1<f64>) -> Result<Array2<f64>> {
        if !self.inner.has_custom_jacobian() {
            return crate::utils::finite_difference::jacobian(&|p| self.eval(p), params, None);
        }

        // Chain rule through the bounds transform
        let external = self.parameters.external_from_internal(params)?;
        let full = self.inner.jacobian(&external)?;
        let scale = self.parameters.internal_scale(params);

        let mut jac = Array2::zeros((full.nrows(), self.varying.len()));
        for (k, &col) in self.varying.iter().enumerate() {
            for i in 0..full.nrows() {
                jac[[i, k]] = full[[i, col]] * scale[k];
            }
        }
        Ok(jac)
    }

    fn has_custom_jacobian(&self) -> bool {
        self.inner.has_custom_jacobian()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{Bounds, Parameter};
    use approx::assert_relative_eq;
    use ndarray::array;

    /// r = [p0 * p1 - 1, p0 - 2]
    struct Product;

    impl Problem for Product {
        fn eval(&self, p: &Array1<f64>) -> Result<Array1<f64>> {
            Ok(array![p[0] * p[1] - 1.0, p[0] - 2.0])
        }

        fn parameter_count(&self) -> usize {
            2
        }

        fn residual_count(&self) -> usize {
            2
        }

        fn jacobian(&self, p: &Array1<f64>) -> Result<Array2<f64>> {
            Ok(array![[p[1], p[0]], [1.0, 0.0]])
        }

        fn has_custom_jacobian(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_analytic_chain_rule_matches_finite_difference() {
        let mut params = Parameters::new();
        params
            .add(Parameter::new("p0", 1.5, Bounds::new(0.0, 4.0).unwrap()))
            .unwrap();
        params.add(Parameter::fixed("p1", 0.7)).unwrap();

        let bounded = BoundedProblem::new(&Product, &params).unwrap();
        assert_eq!(bounded.parameter_count(), 1);

        let u = params.varying_internal().unwrap();
        let analytic = bounded.jacobian(&u).unwrap();
        let numeric =
            crate::utils::finite_difference::jacobian(&|p| bounded.eval(p), &u, None).unwrap();

        assert_eq!(analytic.shape(), &[2, 1]);
        for i in 0..2 {
            assert_relative_eq!(analytic[[i, 0]], numeric[[i, 0]], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let mut params = Parameters::new();
        params.add(Parameter::fixed("p0", 1.0)).unwrap();
        assert!(BoundedProblem::new(&Product, &params).is_err());
    }
}
