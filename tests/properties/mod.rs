//! Behavioural properties of the calibration components.

pub mod background;
pub mod peak;
pub mod resolution;
