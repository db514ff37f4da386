//! Named fit parameters.
//!
//! A [`Parameters`] collection keeps an ordered list of named parameters with
//! bounds and a vary flag, and maps between the full external vector used by
//! models and the unconstrained internal vector seen by the optimizer.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::bounds::{Bounds, BoundsTransform};
use crate::error::{Result, XrfError};

/// Margin (fraction of the bound width) used to pull starting values off a limit.
const START_MARGIN: f64 = 1e-6;

/// A single named fit parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: f64,
    bounds: Bounds,
    vary: bool,
}

impl Parameter {
    /// Create a varying parameter. The value is clamped into the bounds.
    pub fn new(name: &str, value: f64, bounds: Bounds) -> Self {
        Self {
            name: name.to_string(),
            value: bounds.clamp(value),
            bounds,
            vary: true,
        }
    }

    /// Create a parameter that is held at `value`.
    pub fn fixed(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            bounds: Bounds::unbounded(),
            vary: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn vary(&self) -> bool {
        self.vary
    }

    fn transform(&self) -> BoundsTransform {
        BoundsTransform::new(self.bounds)
    }
}

/// Ordered collection of parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    params: Vec<Parameter>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. Names must be unique.
    pub fn add(&mut self, param: Parameter) -> Result<()> {
        if self.get(param.name()).is_some() {
            return Err(XrfError::InvalidInput(format!(
                "Parameter '{}' already exists",
                param.name()
            )));
        }
        self.params.push(param);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Full external value vector in insertion order.
    pub fn values(&self) -> Array1<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    /// Names of the parameters the optimizer varies.
    pub fn varying_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.vary)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Number of varying parameters.
    pub fn varying_count(&self) -> usize {
        self.params.iter().filter(|p| p.vary).count()
    }

    /// Internal (unconstrained) start vector for the varying parameters.
    pub fn varying_internal(&self) -> Result<Array1<f64>> {
        self.params
            .iter()
            .filter(|p| p.vary)
            .map(|p| {
                let start = p.bounds.interior(p.value, START_MARGIN);
                Ok(p.transform().to_internal(start)?)
            })
            .collect()
    }

    /// Expand an internal vector of varying values into the full external vector.
    pub fn external_from_internal(&self, internal: &Array1<f64>) -> Result<Array1<f64>> {
        if internal.len() != self.varying_count() {
            return Err(XrfError::DimensionMismatch(format!(
                "Expected {} varying parameters, got {}",
                self.varying_count(),
                internal.len()
            )));
        }
        let mut k = 0;
        let mut external = Array1::zeros(self.params.len());
        for (i, p) in self.params.iter().enumerate() {
            external[i] = if p.vary {
                k += 1;
                p.transform().to_external(internal[k - 1])
            } else {
                p.value
            };
        }
        Ok(external)
    }

    /// Derivatives d(external)/d(internal) for the varying parameters.
    pub fn internal_scale(&self, internal: &Array1<f64>) -> Array1<f64> {
        self.params
            .iter()
            .filter(|p| p.vary)
            .zip(internal.iter())
            .map(|(p, &u)| p.transform().derivative(u))
            .collect()
    }

    /// Copy of the collection holding `values` (full external vector).
    pub fn with_values(&self, values: &Array1<f64>) -> Result<Parameters> {
        if values.len() != self.params.len() {
            return Err(XrfError::DimensionMismatch(format!(
                "Expected {} parameter values, got {}",
                self.params.len(),
                values.len()
            )));
        }
        let params = self
            .params
            .iter()
            .zip(values.iter())
            .map(|(p, &v)| Parameter {
                value: v,
                ..p.clone()
            })
            .collect();
        Ok(Parameters { params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn resolution_params() -> Parameters {
        let mut params = Parameters::new();
        params
            .add(Parameter::new("fwhm_0", 0.12, Bounds::new(0.05, 0.25).unwrap()))
            .unwrap();
        params.add(Parameter::fixed("scale", 2.0)).unwrap();
        params
            .add(Parameter::new("epsilon", 0.003, Bounds::new(0.0005, 0.005).unwrap()))
            .unwrap();
        params
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut params = resolution_params();
        assert!(params.add(Parameter::fixed("fwhm_0", 1.0)).is_err());
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_internal_round_trip_skips_fixed() {
        let params = resolution_params();
        assert_eq!(params.varying_count(), 2);
        assert_eq!(params.varying_names(), vec!["fwhm_0", "epsilon"]);

        let internal = params.varying_internal().unwrap();
        assert_eq!(internal.len(), 2);

        let external = params.external_from_internal(&internal).unwrap();
        assert_relative_eq!(external[0], 0.12, epsilon = 1e-9);
        assert_relative_eq!(external[1], 2.0);
        assert_relative_eq!(external[2], 0.003, epsilon = 1e-9);

        assert!(params.external_from_internal(&array![0.1]).is_err());
    }

    #[test]
    fn test_start_value_pulled_off_limit() {
        let mut params = Parameters::new();
        params
            .add(Parameter::new("fwhm_0", 0.05, Bounds::new(0.05, 0.25).unwrap()))
            .unwrap();
        let internal = params.varying_internal().unwrap();
        // Strictly inside, so the transform derivative is non-zero
        assert!(params.internal_scale(&internal)[0].abs() > 0.0);
    }

    #[test]
    fn test_with_values() {
        let params = resolution_params();
        let updated = params.with_values(&array![0.1, 3.0, 0.002]).unwrap();
        assert_relative_eq!(updated.get("scale").unwrap().value(), 3.0);
        assert!(params.with_values(&array![0.1]).is_err());
    }
}
