//! Background subtraction properties.

use approx::assert_abs_diff_eq;
use xrfcal_rs::{BackgroundMethod, BackgroundModel};

use crate::test_helpers::gaussian_spectrum;

const PEAKS: [(f64, f64, f64); 3] = [(3.69, 400.0, 0.120), (6.40, 1000.0, 0.145), (8.05, 600.0, 0.160)];

fn idempotent_methods() -> Vec<BackgroundMethod> {
    vec![
        BackgroundMethod::Linear { endpoints: None },
        BackgroundMethod::Polynomial {
            degree: 2,
            exclude: PEAKS.iter().map(|&(c, _, _)| (c - 0.6, c + 0.6)).collect(),
        },
        BackgroundMethod::None,
    ]
}

#[test]
fn test_subtraction_is_idempotent_without_continuum() {
    let spectrum = gaussian_spectrum(&PEAKS, 0.0);

    for method in idempotent_methods() {
        let model = BackgroundModel::new(method.clone());
        let once = model.subtract(&spectrum).unwrap();
        let twice = model.subtract(&once).unwrap();

        for (a, b) in once.counts().iter().zip(twice.counts().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
        assert_eq!(once.len(), spectrum.len(), "{} changed the channel count", method.name());
    }
}

#[test]
fn test_counts_never_negative() {
    let spectrum = gaussian_spectrum(&PEAKS, 25.0);
    for name in ["snip", "polynomial", "linear", "adaptive", "als", "none"] {
        let subtracted = BackgroundModel::from_name(name)
            .unwrap()
            .subtract(&spectrum)
            .unwrap();
        assert!(subtracted.counts().iter().all(|&c| c >= 0.0), "{} went negative", name);
        assert!(subtracted.total_counts() <= spectrum.total_counts() + 1e-9);
    }
}

#[test]
fn test_linear_removes_flat_continuum() {
    let with_continuum = gaussian_spectrum(&PEAKS, 30.0);
    let peaks_only = gaussian_spectrum(&PEAKS, 0.0);

    let subtracted = BackgroundModel::new(BackgroundMethod::Linear { endpoints: None })
        .subtract(&with_continuum)
        .unwrap();

    for (a, b) in subtracted.counts().iter().zip(peaks_only.counts().iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }
}
