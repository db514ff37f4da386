//! Parameter bounds
//!
//! Box constraints for fit parameters and the Minuit-style transformation that
//! lets the unconstrained Levenberg-Marquardt engine respect them.

use serde::{Deserialize, Serialize};
use std::f64::{INFINITY, NEG_INFINITY};
use thiserror::Error;

/// Errors that can occur when working with parameter bounds
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoundsError {
    #[error("Invalid bounds: min ({min}) must be less than max ({max})")]
    InvalidBounds { min: f64, max: f64 },

    #[error("Parameter value {value} is outside bounds: [{min}, {max}]")]
    ValueOutsideBounds { value: f64, min: f64, max: f64 },

    #[error("Infinite parameter value is not allowed")]
    InfiniteValue,
}

/// Represents the bounds constraints on a parameter.
///
/// Infinite limits serialize as `null` so configuration files stay valid JSON.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Minimum allowed value for the parameter
    pub min: f64,

    /// Maximum allowed value for the parameter
    pub max: f64,
}

impl Serialize for Bounds {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let min = if self.min.is_finite() { Some(self.min) } else { None };
        let max = if self.max.is_finite() { Some(self.max) } else { None };

        let mut state = serializer.serialize_struct("Bounds", 2)?;
        state.serialize_field("min", &min)?;
        state.serialize_field("max", &max)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Bounds {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct BoundsHelper {
            #[serde(default)]
            min: Option<f64>,

            #[serde(default)]
            max: Option<f64>,
        }

        let helper = BoundsHelper::deserialize(deserializer)?;
        let min = helper.min.unwrap_or(NEG_INFINITY);
        let max = helper.max.unwrap_or(INFINITY);
        if min > max {
            return Err(serde::de::Error::custom(BoundsError::InvalidBounds { min, max }));
        }

        Ok(Bounds { min, max })
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: NEG_INFINITY,
            max: INFINITY,
        }
    }
}

impl Bounds {
    /// Create a new bounds constraint with min and max values
    ///
    /// # Examples
    ///
    /// ```
    /// use xrfcal_rs::parameters::Bounds;
    ///
    /// let bounds = Bounds::new(0.050, 0.250).unwrap();
    /// assert_eq!(bounds.min, 0.050);
    /// assert!(Bounds::new(1.0, 0.0).is_err());
    /// ```
    pub fn new(min: f64, max: f64) -> Result<Self, BoundsError> {
        if min > max || min.is_nan() || max.is_nan() {
            return Err(BoundsError::InvalidBounds { min, max });
        }

        Ok(Self { min, max })
    }

    /// Create an unbounded constraint (negative infinity to positive infinity)
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Create a bounds constraint with only a minimum value
    pub fn min_only(min: f64) -> Self {
        Self { min, max: INFINITY }
    }

    /// Check if a value is within the bounds
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Check if the parameter is bounded from below
    pub fn has_lower_bound(&self) -> bool {
        self.min.is_finite()
    }

    /// Check if the parameter is bounded from above
    pub fn has_upper_bound(&self) -> bool {
        self.max.is_finite()
    }

    /// Width of the interval, infinite when either side is open.
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Clamp a value to be within the bounds
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Clamp a value and pull it off the limits by `margin` of the interval width.
    ///
    /// Starting values that sit exactly on a limit have a zero derivative under
    /// the sine transform and would never move.
    pub fn interior(&self, value: f64, margin: f64) -> f64 {
        if !(self.has_lower_bound() && self.has_upper_bound()) || self.width() <= 0.0 {
            return self.clamp(value);
        }
        let pad = self.width() * margin;
        value.clamp(self.min + pad, self.max - pad)
    }

    /// True when the two intervals share at least one point.
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min.max(other.min) <= self.max.min(other.max)
    }

    /// Intersection with another interval. Falls back to `self` when the two are disjoint.
    pub fn intersect(&self, other: &Bounds) -> Bounds {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        if min <= max {
            Bounds { min, max }
        } else {
            *self
        }
    }
}

/// Minuit-style mapping between the bounded external value and an
/// unconstrained internal value seen by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsTransform {
    bounds: Bounds,
}

impl BoundsTransform {
    /// Create a new bounds transform
    pub fn new(bounds: Bounds) -> Self {
        Self { bounds }
    }

    /// The bounds this transform enforces.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Transform an internal parameter value to an external value
    pub fn to_external(&self, internal_value: f64) -> f64 {
        match (self.bounds.has_lower_bound(), self.bounds.has_upper_bound()) {
            (false, false) => internal_value,
            (true, false) => self.bounds.min - 1.0 + (internal_value * internal_value + 1.0).sqrt(),
            (false, true) => self.bounds.max + 1.0 - (internal_value * internal_value + 1.0).sqrt(),
            (true, true) => {
                self.bounds.min + (internal_value.sin() + 1.0) * self.bounds.width() / 2.0
            }
        }
    }

    /// Transform an external parameter value to an internal value
    pub fn to_internal(&self, external_value: f64) -> Result<f64, BoundsError> {
        if !external_value.is_finite() {
            return Err(BoundsError::InfiniteValue);
        }

        if !self.bounds.contains(external_value) {
            return Err(BoundsError::ValueOutsideBounds {
                value: external_value,
                min: self.bounds.min,
                max: self.bounds.max,
            });
        }

        let internal = match (self.bounds.has_lower_bound(), self.bounds.has_upper_bound()) {
            (false, false) => external_value,
            (true, false) => ((external_value - self.bounds.min + 1.0).powi(2) - 1.0).sqrt(),
            (false, true) => ((self.bounds.max - external_value + 1.0).powi(2) - 1.0).sqrt(),
            (true, true) => {
                if self.bounds.width() == 0.0 {
                    return Ok(0.0);
                }
                let scaled = 2.0 * (external_value - self.bounds.min) / self.bounds.width() - 1.0;
                scaled.clamp(-1.0, 1.0).asin()
            }
        };

        Ok(internal)
    }

    /// Derivative of the external value with respect to the internal value.
    pub fn derivative(&self, internal_value: f64) -> f64 {
        match (self.bounds.has_lower_bound(), self.bounds.has_upper_bound()) {
            (false, false) => 1.0,
            (true, false) => internal_value / (internal_value * internal_value + 1.0).sqrt(),
            (false, true) => -internal_value / (internal_value * internal_value + 1.0).sqrt(),
            (true, true) => internal_value.cos() * self.bounds.width() / 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bounds_creation() {
        let bounds = Bounds::new(0.0005, 0.0050).unwrap();
        assert_eq!(bounds.min, 0.0005);
        assert_eq!(bounds.max, 0.0050);

        assert!(Bounds::new(10.0, 0.0).is_err());
        assert!(Bounds::new(f64::NAN, 1.0).is_err());

        let bounds = Bounds::unbounded();
        assert!(!bounds.has_lower_bound());
        assert!(!bounds.has_upper_bound());

        let bounds = Bounds::min_only(0.0);
        assert!(bounds.has_lower_bound());
        assert!(!bounds.has_upper_bound());
    }

    #[test]
    fn test_interior_and_intersect() {
        let bounds = Bounds::new(0.0, 10.0).unwrap();
        assert_relative_eq!(bounds.interior(0.0, 0.01), 0.1);
        assert_relative_eq!(bounds.interior(12.0, 0.01), 9.9);
        assert_relative_eq!(bounds.interior(5.0, 0.01), 5.0);

        let narrowed = bounds.intersect(&Bounds::new(4.0, 20.0).unwrap());
        assert_eq!(narrowed, Bounds::new(4.0, 10.0).unwrap());

        assert!(bounds.overlaps(&Bounds::new(10.0, 12.0).unwrap()));

        // Disjoint intervals keep the original
        let other = Bounds::new(11.0, 12.0).unwrap();
        assert!(!bounds.overlaps(&other));
        assert_eq!(bounds.intersect(&other), bounds);
    }

    #[test]
    fn test_bounds_serialization() {
        let bounds = Bounds::min_only(0.5);
        let json = serde_json::to_string(&bounds).unwrap();
        assert_eq!(json, r#"{"min":0.5,"max":null}"#);

        let back: Bounds = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min, 0.5);
        assert!(back.max.is_infinite());

        assert!(serde_json::from_str::<Bounds>(r#"{"min":2.0,"max":1.0}"#).is_err());
    }

    #[test]
    fn test_transform_round_trip() {
        let cases = [
            Bounds::unbounded(),
            Bounds::min_only(5.0),
            Bounds::new(0.050, 0.250).unwrap(),
        ];
        for bounds in cases.iter() {
            let transform = BoundsTransform::new(*bounds);
            for &internal in [0.2, 0.7, 1.1].iter() {
                let external = transform.to_external(internal);
                assert!(bounds.contains(external));
                let back = transform.to_internal(external).unwrap();
                assert_relative_eq!(back, internal, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_transform_derivative() {
        let transform = BoundsTransform::new(Bounds::new(0.0005, 0.0050).unwrap());
        let u = 0.3;
        let h = 1e-7;
        let numeric = (transform.to_external(u + h) - transform.to_external(u - h)) / (2.0 * h);
        assert_relative_eq!(transform.derivative(u), numeric, epsilon = 1e-9);
    }

    #[test]
    fn test_transform_errors() {
        let transform = BoundsTransform::new(Bounds::new(0.0, 10.0).unwrap());
        assert!(matches!(
            transform.to_internal(11.0),
            Err(BoundsError::ValueOutsideBounds { .. })
        ));
        assert!(matches!(
            transform.to_internal(f64::INFINITY),
            Err(BoundsError::InfiniteValue)
        ));
    }
}
