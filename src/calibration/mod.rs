//! Instrument calibration: fitting detector resolution to reference spectra
//! through the forward model.

pub mod calibrator;
pub mod result;

pub use calibrator::{
    CalibrationRun, CalibratorConfig, InstrumentCalibrator, IterationReport, ResolutionHandling,
};
pub use result::{CalibrationResult, ResolutionModelReference, CALIBRATION_FORMAT_VERSION};
