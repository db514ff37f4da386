//! Standards to resolution model to instrument calibration.

use approx::assert_relative_eq;

use xrfcal_rs::calibration::InstrumentCalibrator;
use xrfcal_rs::forward::ForwardRequest;
use xrfcal_rs::peak_width::{ExpectedLine, PeakWidthMeasurer};
use xrfcal_rs::resolution::{
    calibrate_resolution, ModelKind, ReferenceStandard, ResolutionModelFitter, ResolutionParams,
};
use xrfcal_rs::{BackgroundMethod, BackgroundModel};

use crate::test_helpers::{
    builtin_calculator, synthetic_standard, wide_range_standard, with_poisson_noise,
};

const FWHM_0: f64 = 0.095;
const EPSILON: f64 = 0.0011;

fn pure_standard(element: &str, lines: &[(&str, f64)], seed: u64) -> ReferenceStandard {
    let request = ForwardRequest::from_pairs(&[(element, 1.0)], 40.0, "Rh");
    let spectrum = with_poisson_noise(
        &synthetic_standard(&request, ResolutionParams::new(FWHM_0, EPSILON), 1.0e6),
        seed,
    );
    let expected = lines
        .iter()
        .map(|&(line, energy)| ExpectedLine::new(element, line, energy))
        .collect();
    ReferenceStandard::with_lines(element, spectrum, expected)
}

#[test]
fn test_resolution_model_feeds_calibration() {
    let standards = vec![
        pure_standard("Mg", &[("Ka", 1.2536)], 11),
        pure_standard("Fe", &[("Ka1", 6.404), ("Kb1", 7.058)], 12),
        pure_standard("Cu", &[("Ka1", 8.048)], 13),
    ];

    let fit = calibrate_resolution(
        &standards,
        &BackgroundModel::new(BackgroundMethod::None),
        &PeakWidthMeasurer::new(),
        &ResolutionModelFitter::new().with_outlier_removal(false),
        ModelKind::Detector,
    )
    .unwrap();

    assert_eq!(fit.retained.len(), 4, "rejected: {:?}", fit.rejected_peaks);
    assert!(fit.rejected_peaks.is_empty());
    let model = fit.model;
    assert_relative_eq!(model.parameter("fwhm_0").unwrap(), FWHM_0, max_relative = 0.10);
    assert_relative_eq!(model.parameter("epsilon").unwrap(), EPSILON, max_relative = 0.10);

    // Second stage: full forward-model fit seeded and bounded by the model
    let request = wide_range_standard();
    let measured = with_poisson_noise(
        &synthetic_standard(&request, ResolutionParams::new(FWHM_0, EPSILON), 2.0e6),
        14,
    );
    let result = InstrumentCalibrator::new(builtin_calculator())
        .calibrate(&measured, &request, Some(&model))
        .unwrap();

    assert!(result.converged, "{}", result.message);
    assert_relative_eq!(result.parameter("fwhm_0").unwrap(), FWHM_0, max_relative = 0.10);
    assert_relative_eq!(result.parameter("epsilon").unwrap(), EPSILON, max_relative = 0.10);

    let reference = result.resolution_model_reference.unwrap();
    assert_eq!(reference.model_type, ModelKind::Detector);
    assert!(!reference.held_fixed);
    assert_eq!(reference.created_at, model.created_at());
}
