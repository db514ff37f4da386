//! Detector resolution: FWHM(E) models, their regression against peak
//! measurements and model comparison.

pub mod fitter;
pub mod model;

pub use fitter::{
    calibrate_resolution, delta_aic, information_criteria, FitterConfig, ReferenceStandard,
    ResidualScale, ResolutionFit, ResolutionModelFitter, ResolutionPoint,
};
pub use model::{
    predict, ModelKind, ResolutionModel, ResolutionParams, FWHM_SQUARED_FACTOR,
    RESOLUTION_FORMAT_VERSION,
};
