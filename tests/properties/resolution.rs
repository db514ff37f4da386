//! Resolution models: monotonicity, persistence, outlier handling and ranking.

use approx::assert_relative_eq;
use xrfcal_rs::resolution::{
    ModelKind, ResidualScale, ResolutionModel, ResolutionModelFitter, ResolutionPoint,
};

use crate::test_helpers::temp_path;

fn detector_points(fwhm_0: f64, epsilon: f64, energies: &[f64]) -> Vec<ResolutionPoint> {
    energies
        .iter()
        .map(|&e| ResolutionPoint::new(e, ModelKind::Detector.evaluate(&[fwhm_0, epsilon], e)))
        .collect()
}

fn spread(n: usize, lo: f64, hi: f64) -> Vec<f64> {
    (0..n)
        .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
        .collect()
}

#[test]
fn test_detector_prediction_is_monotone() {
    for &(fwhm_0, epsilon) in &[(0.0, 0.0), (0.12, 0.0), (0.0, 0.003), (0.115, 0.0035), (0.25, 0.005)] {
        let model = ResolutionModel::from_values(ModelKind::Detector, &[fwhm_0, epsilon]).unwrap();
        assert_relative_eq!(model.predict(0.0), fwhm_0, epsilon = 1e-15);

        let mut previous = model.predict(0.0);
        for i in 1..=400 {
            let current = model.predict(0.1 * i as f64);
            assert!(current >= previous, "FWHM fell at {} keV", 0.1 * i as f64);
            previous = current;
        }
    }
}

#[test]
fn test_fitted_model_round_trips_through_file() {
    let points = detector_points(0.118, 0.0029, &spread(8, 1.0, 17.0));
    let model = ResolutionModelFitter::new()
        .fit_points(&points, ModelKind::Detector)
        .unwrap()
        .model;

    let path = temp_path("resolution-model.json");
    model.save(&path).unwrap();
    let loaded = ResolutionModel::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.model_type(), model.model_type());
    assert_eq!(loaded.parameters(), model.parameters());
    assert_eq!(loaded.r_squared(), model.r_squared());
    assert_eq!(loaded, model);
}

#[test]
fn test_two_point_detector_fit() {
    let points = vec![ResolutionPoint::new(1.25, 0.120), ResolutionPoint::new(8.05, 0.150)];
    let fit = ResolutionModelFitter::new()
        .fit_points(&points, ModelKind::Detector)
        .unwrap();

    assert_relative_eq!(fit.model.predict(1.25), 0.120, max_relative = 0.01);
    assert_relative_eq!(fit.model.predict(8.05), 0.150, max_relative = 0.01);
}

#[test]
fn test_shifted_points_are_removed() {
    let (fwhm_0, epsilon) = (0.115, 0.0025);
    let sigma = 0.002;
    let mut points = detector_points(fwhm_0, epsilon, &spread(20, 1.0, 17.0));
    let mut high = ResolutionPoint::new(5.5, ModelKind::Detector.evaluate(&[fwhm_0, epsilon], 5.5) + 10.0 * sigma);
    high.label = "shifted up".to_string();
    let low = ResolutionPoint::new(12.5, ModelKind::Detector.evaluate(&[fwhm_0, epsilon], 12.5) - 10.0 * sigma);
    points.push(high);
    points.push(low);

    let clean = ResolutionModelFitter::new()
        .with_outlier_removal(false)
        .fit_points(&points[..20], ModelKind::Detector)
        .unwrap();
    let fitter = ResolutionModelFitter::new();
    assert_eq!(fitter.config().residual_scale, ResidualScale::StandardDeviation);
    let robust = fitter.fit_points(&points, ModelKind::Detector).unwrap();

    assert_eq!(robust.removed.len(), 2);
    assert_eq!(robust.retained.len(), 20);
    for name in ["fwhm_0", "epsilon"] {
        assert_relative_eq!(
            robust.model.parameter(name).unwrap(),
            clean.model.parameter(name).unwrap(),
            max_relative = 1e-6
        );
    }
}

#[test]
fn test_detector_ranks_first_on_detector_data() {
    let points = detector_points(0.120, 0.0030, &spread(12, 1.2, 17.5));
    let ranked = ResolutionModelFitter::new()
        .with_outlier_removal(false)
        .compare_points(&points)
        .unwrap();

    assert!(ranked.len() >= 2);
    assert_eq!(ranked[0].model_type(), ModelKind::Detector);
    assert!(ranked[1..].windows(2).all(|w| w[0].aic() <= w[1].aic()));
}

#[test]
fn test_compared_models_share_retained_points() {
    let mut points = detector_points(0.120, 0.0030, &spread(20, 1.2, 17.5));
    // About 1 eV of alternating scatter
    for (i, p) in points.iter_mut().enumerate() {
        p.fwhm += if i % 2 == 0 { 0.001 } else { -0.001 };
    }
    let mut outlier = ResolutionPoint::new(9.0, ModelKind::Detector.evaluate(&[0.120, 0.0030], 9.0) + 0.05);
    outlier.label = "outlier".to_string();
    points.push(outlier);

    let ranked = ResolutionModelFitter::new().compare_points(&points).unwrap();
    assert!(ranked.len() >= 2);
    for model in &ranked {
        assert_eq!(model.n_measurements(), 20, "{}", model.model_type());
    }
}
