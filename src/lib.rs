//! # xrfcal-rs
//!
//! `xrfcal-rs` calibrates the energy resolution of X-ray fluorescence
//! detectors and fits synthetic spectra to measured reference standards.
//!
//! The library provides:
//! - Background estimation (SNIP, polynomial, linear, adaptive, ALS)
//! - Peak width measurement with quality gates
//! - FWHM(E) resolution models with outlier-robust fitting and AIC/BIC comparison
//! - A forward spectrum model driven by an injected physics oracle
//! - Instrument calibration of resolution and intensity scales against the forward model
//! - A bounded Levenberg-Marquardt engine with covariance-based uncertainties
//!
//! ## Basic Usage
//!
//! ```
//! use std::sync::Arc;
//! use xrfcal_rs::{ForwardRequest, ForwardSpectrumCalculator, LineTable, ResolutionParams};
//!
//! let calculator = ForwardSpectrumCalculator::new(Arc::new(LineTable::builtin()));
//! let request = ForwardRequest::from_pairs(&[("Fe", 0.7), ("Cr", 0.2), ("Ni", 0.1)], 40.0, "Rh");
//! let spectrum = calculator
//!     .calculate(&request, ResolutionParams::new(0.120, 0.0035))
//!     .unwrap();
//! assert_eq!(spectrum.len(), 2048);
//! ```

// Public modules
pub mod error;

// Parameter system
pub mod parameters;

// Numerics
pub mod lm;
pub mod problem;
pub mod uncertainty;
pub mod utils;

// Spectroscopy
pub mod background;
pub mod calibration;
pub mod forward;
pub mod models;
pub mod peak_width;
pub mod resolution;
pub mod spectrum;

// Re-exports for convenience
pub use error::{Result, XrfError};

pub use background::{BackgroundMethod, BackgroundModel};
pub use calibration::{
    CalibrationResult, CalibrationRun, CalibratorConfig, InstrumentCalibrator, IterationReport,
    ResolutionHandling,
};
pub use forward::{
    AccuracyMode, CancellationToken, ForwardModelConfig, ForwardRequest, ForwardSpectrumCalculator,
    LineFamilyPolicy, LineSet, LineTable, PhysicsOracle, Shell,
};
pub use lm::{LevenbergMarquardt, LmConfig};
pub use parameters::{Bounds, Parameter, Parameters};
pub use peak_width::{ExpectedLine, MeasurerConfig, PeakFit, PeakMeasurement, PeakWidthMeasurer};
pub use problem::Problem;
pub use resolution::{
    calibrate_resolution, predict, FitterConfig, ModelKind, ReferenceStandard, ResolutionModel,
    ResolutionModelFitter, ResolutionParams,
};
pub use spectrum::Spectrum;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
