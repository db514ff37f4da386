//! Utility functions and helpers for the xrfcal-rs library.

pub mod finite_difference;
pub mod matrix_convert;

pub use matrix_convert::{nalgebra_to_ndarray, ndarray_to_nalgebra};
