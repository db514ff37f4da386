//! # Uncertainty Calculation
//!
//! Parameter uncertainties for the resolution-model and instrument
//! calibration fits, estimated from the Jacobian at the solution in the same
//! way lmfit-py does.

mod covariance;

pub use covariance::{
    calculate_correlation, calculate_covariance, reduced_chi_square,
    standard_errors_from_covariance,
};
