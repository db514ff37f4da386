//! Instrument calibration on noisy synthetic standards.

use approx::assert_relative_eq;

use xrfcal_rs::calibration::{CalibrationResult, CalibrationRun, InstrumentCalibrator};
use xrfcal_rs::{BackgroundMethod, ResolutionParams};

use crate::test_helpers::{
    builtin_calculator, synthetic_standard, temp_path, wide_range_standard, with_poisson_noise,
};

const TRUTH: (f64, f64) = (0.115, 0.0035);

fn truth() -> ResolutionParams {
    ResolutionParams::new(TRUTH.0, TRUTH.1)
}

#[test]
fn test_recovers_resolution_from_poisson_spectrum() {
    let request = wide_range_standard();
    let measured = with_poisson_noise(&synthetic_standard(&request, truth(), 2.0e6), 42);

    let result = InstrumentCalibrator::new(builtin_calculator())
        .calibrate(&measured, &request, None)
        .unwrap();

    assert!(result.converged, "{}", result.message);
    assert_relative_eq!(result.parameter("fwhm_0").unwrap(), TRUTH.0, max_relative = 0.10);
    assert_relative_eq!(result.parameter("epsilon").unwrap(), TRUTH.1, max_relative = 0.10);
    assert!(result.r_squared > 0.99);

    let errors = result.uncertainties.as_ref().unwrap();
    assert!(errors["fwhm_0"] > 0.0 && errors["fwhm_0"] < 0.01);
}

#[test]
fn test_linear_background_removed_before_fitting() {
    let request = wide_range_standard();
    let clean = synthetic_standard(&request, truth(), 2.0e6);
    let with_continuum = clean.with_counts(clean.counts().mapv(|c| c + 20.0)).unwrap();

    let result = InstrumentCalibrator::new(builtin_calculator())
        // Channels at 0.5 and 19 keV, clear of every line
        .with_background(BackgroundMethod::Linear {
            endpoints: Some((50, 1900)),
        })
        .calibrate(&with_poisson_noise(&with_continuum, 3), &request, None)
        .unwrap();

    assert_relative_eq!(result.parameter("fwhm_0").unwrap(), TRUTH.0, max_relative = 0.10);
    assert_relative_eq!(result.parameter("epsilon").unwrap(), TRUTH.1, max_relative = 0.10);
}

#[test]
fn test_result_survives_save_and_load() {
    let request = wide_range_standard();
    let measured = synthetic_standard(&request, truth(), 1.0e6);
    let result = InstrumentCalibrator::new(builtin_calculator())
        .calibrate(&measured, &request, None)
        .unwrap();

    let path = temp_path("calibration-result.json");
    result.save(&path).unwrap();
    let loaded = CalibrationResult::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded, result);
    let params = loaded.resolution_params().unwrap();
    assert_eq!(params.fwhm_0, result.parameter("fwhm_0").unwrap());
    assert_eq!(params.epsilon, result.parameter("epsilon").unwrap());
}

#[test]
fn test_batch_of_noisy_standards() {
    let request = wide_range_standard();
    let runs: Vec<CalibrationRun> = (0..4)
        .map(|seed| {
            let measured = with_poisson_noise(&synthetic_standard(&request, truth(), 2.0e6), seed);
            CalibrationRun::new(measured, request.clone())
        })
        .collect();

    let results = InstrumentCalibrator::new(builtin_calculator()).calibrate_batch(&runs);
    assert_eq!(results.len(), 4);
    for result in results {
        let result = result.unwrap();
        assert_relative_eq!(result.parameter("fwhm_0").unwrap(), TRUTH.0, max_relative = 0.10);
    }
}
