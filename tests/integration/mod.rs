//! Integration tests for the xrfcal-rs library
//!
//! These tests run the components together on synthetic spectra, rather than
//! exercising individual functions.

// Forward model over the built-in line table
pub mod forward_model;

// Instrument calibration against noisy synthetic standards
pub mod calibration;

// Peak widths -> resolution model -> instrument calibration
pub mod pipeline;
