//! Peak width measurement on synthetic spectra.

use approx::assert_abs_diff_eq;
use xrfcal_rs::peak_width::{ExpectedLine, PeakFit, PeakWidthMeasurer, RejectionReason};
use xrfcal_rs::Spectrum;

use crate::test_helpers::{energy_axis, gaussian_spectrum, with_poisson_noise};

#[test]
fn test_single_peak_at_6_40_kev() {
    let spectrum = gaussian_spectrum(&[(6.40, 1000.0, 0.145)], 0.0);
    let fit = PeakWidthMeasurer::new()
        .measure(&spectrum, &ExpectedLine::new("Fe", "Ka1", 6.40), "Fe")
        .unwrap();

    let m = fit.measurement().expect("clean peak should be accepted");
    assert_abs_diff_eq!(m.center, 6.400, epsilon = 0.005);
    assert_abs_diff_eq!(m.fwhm, 0.145, epsilon = 0.005);
    assert!(m.r_squared > 0.98);
}

#[test]
fn test_noisy_peak_is_still_measured() {
    let clean = gaussian_spectrum(&[(6.40, 1000.0, 0.145)], 0.0);
    let noisy = with_poisson_noise(&clean, 7);
    let fit = PeakWidthMeasurer::new()
        .measure(&noisy, &ExpectedLine::new("Fe", "Ka1", 6.40), "Fe")
        .unwrap();

    let m = fit.measurement().expect("noisy peak should be accepted");
    assert_abs_diff_eq!(m.center, 6.400, epsilon = 0.005);
    assert_abs_diff_eq!(m.fwhm, 0.145, epsilon = 0.01);
}

#[test]
fn test_zero_window_is_rejected() {
    let energy = energy_axis();
    let zeros = energy.mapv(|_| 0.0);
    let spectrum = Spectrum::from_arrays(energy, zeros).unwrap();

    let fit = PeakWidthMeasurer::new()
        .measure(&spectrum, &ExpectedLine::new("Cu", "Ka1", 8.048), "Cu")
        .unwrap();
    match fit {
        PeakFit::Rejected(r) => {
            assert!(matches!(r.reason, RejectionReason::InsufficientCounts { .. }));
            assert_eq!(r.standard_id, "Cu");
        }
        PeakFit::Accepted(m) => panic!("zero window accepted with FWHM {}", m.fwhm),
    }
}

#[test]
fn test_r_squared_always_in_unit_interval() {
    let measurer = PeakWidthMeasurer::new().with_min_r_squared(0.0);
    let line = ExpectedLine::new("Fe", "Ka1", 6.40);

    // From clean peaks down to pure noise on a flat baseline
    for (seed, amplitude) in [0.0, 20.0, 200.0, 2000.0].iter().enumerate() {
        let clean = gaussian_spectrum(&[(6.40, *amplitude, 0.145)], 50.0);
        let noisy = with_poisson_noise(&clean, seed as u64);
        match measurer.measure(&noisy, &line, "Fe").unwrap() {
            PeakFit::Accepted(m) => {
                assert!((0.0..=1.0).contains(&m.r_squared), "R² = {}", m.r_squared)
            }
            PeakFit::Rejected(r) => {
                if let RejectionReason::PoorFit { r_squared } = r.reason {
                    assert!((0.0..=1.0).contains(&r_squared));
                }
            }
        }
    }
}

#[test]
fn test_survey_separates_accepted_and_rejected() {
    let spectrum = gaussian_spectrum(&[(8.048, 3000.0, 0.165), (8.905, 500.0, 0.172)], 0.0);
    let survey = PeakWidthMeasurer::new()
        .survey(&spectrum, "Cu", &ExpectedLine::defaults_for("Cu"))
        .unwrap();

    // Ka1 and Ka2 share the blended peak; Kb1 is separate; Al is absent
    assert_eq!(survey.accepted.len(), 3);
    assert_eq!(survey.rejected.len(), 1);
    assert_eq!(survey.rejected[0].element, "Al");
}
