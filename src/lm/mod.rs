//! Levenberg-Marquardt algorithm implementation.
//!
//! This module provides the damped least-squares engine behind the peak,
//! resolution-model and instrument calibration fits, together with its
//! configuration, convergence criteria and the bounded-parameter adapter.

pub mod algorithm;
pub mod bounded;
pub mod config;
pub mod convergence;

// Re-export key types
pub use algorithm::{BoundedFit, IterationState, LevenbergMarquardt, LmResult};
pub use bounded::BoundedProblem;
pub use config::{DiffMethod, LmConfig};
pub use convergence::{ConvergenceCriteria, ConvergenceStatus};
