//! Regression of FWHM(E) against peak measurements.

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::background::BackgroundModel;
use crate::error::{Result, XrfError};
use crate::lm::{LevenbergMarquardt, LmConfig};
use crate::parameters::{Parameter, Parameters};
use crate::peak_width::{ExpectedLine, PeakMeasurement, PeakWidthMeasurer, RejectedPeak, Survey};
use crate::problem::Problem;
use crate::spectrum::Spectrum;
use crate::uncertainty::{calculate_covariance, reduced_chi_square, standard_errors_from_covariance};

use super::model::{FitStatistics, ModelKind, ResolutionModel, FWHM_SQUARED_FACTOR};

/// Consistency constant turning a median absolute deviation into a sigma.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Floor for SSR/n inside the log-likelihood.
const MIN_MEAN_SQUARE: f64 = 1e-300;

/// Spread estimate used to flag outlying residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualScale {
    /// Population standard deviation around the mean residual
    StandardDeviation,
    /// 1.4826 × median absolute deviation around the median residual
    MedianAbsoluteDeviation,
}

/// Configuration for [`ResolutionModelFitter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    pub remove_outliers: bool,

    /// Residuals beyond this many scale units are outliers
    pub outlier_threshold: f64,

    /// Ceiling on reject-and-refit rounds
    pub max_outlier_iterations: usize,

    pub residual_scale: ResidualScale,

    /// Lower limit (keV) for the residual scale
    pub min_residual_scale: f64,

    /// Models closer than this in AIC count as indistinguishable
    pub tie_break_delta_aic: f64,

    pub lm: LmConfig,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            remove_outliers: true,
            outlier_threshold: 3.0,
            max_outlier_iterations: 5,
            residual_scale: ResidualScale::StandardDeviation,
            min_residual_scale: 1e-6,
            tie_break_delta_aic: 2.0,
            lm: LmConfig::default(),
        }
    }
}

/// One (energy, FWHM) pair entering the regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPoint {
    pub energy: f64,
    pub fwhm: f64,
    /// Where the point came from, e.g. `"Fe Ka1 (Fe)"`
    pub label: String,
}

impl ResolutionPoint {
    pub fn new(energy: f64, fwhm: f64) -> Self {
        Self {
            energy,
            fwhm,
            label: String::new(),
        }
    }
}

impl From<&PeakMeasurement> for ResolutionPoint {
    fn from(m: &PeakMeasurement) -> Self {
        Self {
            energy: m.center,
            fwhm: m.fwhm,
            label: format!("{} {} ({})", m.element, m.line, m.standard_id),
        }
    }
}

/// Result of fitting one model kind.
#[derive(Debug, Clone)]
pub struct ResolutionFit {
    pub model: ResolutionModel,
    /// Points the final fit used, sorted by energy
    pub retained: Vec<ResolutionPoint>,
    /// Points flagged as outliers
    pub removed: Vec<ResolutionPoint>,
    /// Reject-and-refit rounds that removed something
    pub outlier_iterations: usize,
    /// Parameter covariance in canonical order
    pub covariance: Array2<f64>,
    /// Peaks rejected while measuring, when the fit came from raw spectra
    pub rejected_peaks: Vec<RejectedPeak>,
}

/// `model(E) − FWHM` over a set of points.
struct ResolutionProblem {
    kind: ModelKind,
    energy: Array1<f64>,
    fwhm: Array1<f64>,
}

impl Problem for ResolutionProblem {
    fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let p = params.as_slice().ok_or_else(|| {
            XrfError::InvalidInput("Parameter vector is not contiguous".to_string())
        })?;
        Ok(self
            .energy
            .iter()
            .zip(self.fwhm.iter())
            .map(|(&e, &f)| self.kind.evaluate(p, e) - f)
            .collect())
    }

    fn parameter_count(&self) -> usize {
        self.kind.parameter_count()
    }

    fn residual_count(&self) -> usize {
        self.energy.len()
    }

    fn jacobian(&self, params: &Array1<f64>) -> Result<Array2<f64>> {
        let p = params.to_vec();
        let k = self.kind.parameter_count();
        let mut jac = Array2::zeros((self.energy.len(), k));
        for (i, &e) in self.energy.iter().enumerate() {
            for (j, d) in self.kind.gradient(&p, e).into_iter().enumerate() {
                jac[[i, j]] = d;
            }
        }
        Ok(jac)
    }

    fn has_custom_jacobian(&self) -> bool {
        true
    }
}

/// Values and residual sum of squares of one regression.
struct SingleFit {
    values: Vec<f64>,
    ssr: f64,
    jacobian: Array2<f64>,
}

/// Fits resolution models with iterative outlier rejection.
#[derive(Debug, Clone, Default)]
pub struct ResolutionModelFitter {
    config: FitterConfig,
}

impl ResolutionModelFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FitterConfig) -> Self {
        Self { config }
    }

    pub fn with_outlier_removal(mut self, remove_outliers: bool) -> Self {
        self.config.remove_outliers = remove_outliers;
        self
    }

    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.config.outlier_threshold = threshold;
        self
    }

    pub fn with_residual_scale(mut self, scale: ResidualScale) -> Self {
        self.config.residual_scale = scale;
        self
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Fit `kind` to accepted peak measurements.
    pub fn fit(&self, measurements: &[PeakMeasurement], kind: ModelKind) -> Result<ResolutionFit> {
        let points: Vec<ResolutionPoint> = measurements.iter().map(ResolutionPoint::from).collect();
        self.fit_points(&points, kind)
    }

    /// Fit `kind` to raw (energy, FWHM) points.
    pub fn fit_points(&self, points: &[ResolutionPoint], kind: ModelKind) -> Result<ResolutionFit> {
        if self.config.outlier_threshold <= 0.0 {
            return Err(XrfError::Configuration(format!(
                "Outlier threshold must be positive, got {}",
                self.config.outlier_threshold
            )));
        }
        if let Some(bad) = points.iter().find(|p| !(p.energy.is_finite() && p.fwhm.is_finite())) {
            return Err(XrfError::InvalidInput(format!(
                "Non-finite resolution point '{}' ({}, {})",
                bad.label, bad.energy, bad.fwhm
            )));
        }

        let k = kind.parameter_count();
        if points.len() < k {
            return Err(XrfError::InsufficientData {
                usable: points.len(),
                required: k,
            });
        }

        let mut retained = points.to_vec();
        retained.sort_by(|a, b| a.energy.total_cmp(&b.energy));
        let mut removed = Vec::new();
        let mut outlier_iterations = 0;
        let mut fit = self.fit_once(&retained, kind)?;

        if self.config.remove_outliers && retained.len() >= k + 2 {
            while outlier_iterations < self.config.max_outlier_iterations {
                let residuals: Vec<f64> = retained
                    .iter()
                    .map(|p| p.fwhm - kind.evaluate(&fit.values, p.energy))
                    .collect();
                let (center, scale) = self.residual_spread(&residuals);
                let limit = self.config.outlier_threshold * scale;

                let (outliers, kept): (Vec<_>, Vec<_>) = retained
                    .into_iter()
                    .zip(residuals.iter())
                    .partition(|(_, &r)| (r - center).abs() > limit);
                retained = kept.into_iter().map(|(p, _)| p).collect();
                if outliers.is_empty() {
                    break;
                }

                outlier_iterations += 1;
                for (p, r) in outliers {
                    debug!(
                        "Outlier {} @ {:.2} keV: residual {:+.1} eV ({:.1} scale units)",
                        p.label,
                        p.energy,
                        r * 1000.0,
                        (r - center).abs() / scale
                    );
                    removed.push(p);
                }

                if retained.len() < k + 2 {
                    return Err(XrfError::InsufficientData {
                        usable: retained.len(),
                        required: k + 2,
                    });
                }
                fit = self.fit_once(&retained, kind)?;
            }
            if !removed.is_empty() {
                info!(
                    "Removed {} outlier(s), {} measurements remaining",
                    removed.len(),
                    retained.len()
                );
            }
        }

        let n = retained.len();
        let dof_redchi = reduced_chi_square(fit.ssr, n, k);
        let covariance = calculate_covariance(&fit.jacobian, dof_redchi)?;
        let errors = standard_errors_from_covariance(&covariance);

        let fwhm: Vec<f64> = retained.iter().map(|p| p.fwhm).collect();
        let mean = fwhm.iter().sum::<f64>() / n as f64;
        let ss_tot: f64 = fwhm.iter().map(|f| (f - mean).powi(2)).sum();
        let r_squared = if ss_tot > 0.0 { 1.0 - fit.ssr / ss_tot } else { 0.0 };
        let (aic, bic) = information_criteria(fit.ssr, n, k);

        let stats = FitStatistics {
            r_squared,
            rmse: (fit.ssr / n as f64).sqrt(),
            aic,
            bic,
            n_measurements: n,
            energy_range: (retained[0].energy, retained[n - 1].energy),
        };
        let model = ResolutionModel::fitted(kind, &fit.values, &errors.to_vec(), stats)?;
        info!("Fitted {} from {} measurements", model, n);

        Ok(ResolutionFit {
            model,
            retained,
            removed,
            outlier_iterations,
            covariance,
            rejected_peaks: Vec::new(),
        })
    }

    /// Fit every model kind and rank the results.
    ///
    /// Outliers are rejected once against the detector model, and every kind
    /// is then fitted to the same retained points so the AICs share one `n`.
    /// Models are ordered by AIC. When the detector model lies within
    /// `tie_break_delta_aic` of the best it is moved to the front. Kinds that
    /// fail to fit are logged and left out.
    pub fn compare_models(&self, measurements: &[PeakMeasurement]) -> Result<Vec<ResolutionModel>> {
        let points: Vec<ResolutionPoint> = measurements.iter().map(ResolutionPoint::from).collect();
        self.compare_points(&points)
    }

    pub fn compare_points(&self, points: &[ResolutionPoint]) -> Result<Vec<ResolutionModel>> {
        let shared = self.shared_points(points);
        let plain = self.clone().with_outlier_removal(false);

        let mut models: Vec<ResolutionModel> = ModelKind::ALL
            .par_iter()
            .filter_map(|&kind| match plain.fit_points(&shared, kind) {
                Ok(fit) => Some(fit.model),
                Err(e) => {
                    warn!("{} model failed: {}", kind, e);
                    None
                }
            })
            .collect();

        if models.is_empty() {
            return Err(XrfError::InsufficientData {
                usable: points.len(),
                required: ModelKind::ALL
                    .iter()
                    .map(|k| k.parameter_count())
                    .min()
                    .unwrap_or(2),
            });
        }

        models.sort_by(|a, b| a.aic().total_cmp(&b.aic()));
        let best_aic = models[0].aic();
        if let Some(pos) = models
            .iter()
            .position(|m| m.model_type() == ModelKind::Detector)
        {
            if pos > 0 && models[pos].aic() - best_aic < self.config.tie_break_delta_aic {
                let detector = models.remove(pos);
                models.insert(0, detector);
            }
        }
        Ok(models)
    }

    /// Points left after detector-model outlier rejection, or all of them
    /// when rejection is off or the detector fit fails.
    fn shared_points(&self, points: &[ResolutionPoint]) -> Vec<ResolutionPoint> {
        if !self.config.remove_outliers {
            return points.to_vec();
        }
        match self.fit_points(points, ModelKind::Detector) {
            Ok(fit) => {
                if !fit.removed.is_empty() {
                    debug!(
                        "Comparing models on {} points after removing {} outlier(s)",
                        fit.retained.len(),
                        fit.removed.len()
                    );
                }
                fit.retained
            }
            Err(e) => {
                warn!("Detector outlier screening failed, comparing on all points: {}", e);
                points.to_vec()
            }
        }
    }

    fn fit_once(&self, points: &[ResolutionPoint], kind: ModelKind) -> Result<SingleFit> {
        let problem = ResolutionProblem {
            kind,
            energy: points.iter().map(|p| p.energy).collect(),
            fwhm: points.iter().map(|p| p.fwhm).collect(),
        };

        let start = match kind {
            ModelKind::Detector => detector_seed(&problem.energy, &problem.fwhm),
            _ => kind.initial_guess().to_vec(),
        };
        let mut parameters = Parameters::new();
        for ((name, bounds), value) in kind
            .parameter_names()
            .iter()
            .zip(kind.bounds())
            .zip(start)
        {
            parameters.add(Parameter::new(name, value, bounds))?;
        }

        let fit = LevenbergMarquardt::with_config(self.config.lm.clone())
            .minimize_bounded(&problem, &parameters, &mut |_| {})?;
        let values = fit.parameters.values();
        if !fit.result.success {
            return Err(XrfError::Convergence {
                message: format!("{} model: {}", kind, fit.result.message),
                last_params: values.to_vec(),
            });
        }

        Ok(SingleFit {
            jacobian: problem.jacobian(&values)?,
            ssr: fit.result.cost,
            values: values.to_vec(),
        })
    }

    /// Center and spread of residuals, spread floored at `min_residual_scale`.
    fn residual_spread(&self, residuals: &[f64]) -> (f64, f64) {
        let (center, scale) = match self.config.residual_scale {
            ResidualScale::StandardDeviation => {
                let n = residuals.len() as f64;
                let mean = residuals.iter().sum::<f64>() / n;
                let var = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
                (mean, var.sqrt())
            }
            ResidualScale::MedianAbsoluteDeviation => {
                let med = median(residuals);
                let deviations: Vec<f64> = residuals.iter().map(|r| (r - med).abs()).collect();
                (med, MAD_TO_SIGMA * median(&deviations))
            }
        };
        (center, scale.max(self.config.min_residual_scale))
    }
}

/// `(AIC, BIC)` from the Gaussian log-likelihood of the residuals.
pub fn information_criteria(ssr: f64, n: usize, k: usize) -> (f64, f64) {
    let n_f = n as f64;
    let neg2_log_l = n_f * ((2.0 * PI * (ssr / n_f).max(MIN_MEAN_SQUARE)).ln() + 1.0);
    (2.0 * k as f64 + neg2_log_l, k as f64 * n_f.ln() + neg2_log_l)
}

/// AIC of each model relative to the smallest.
pub fn delta_aic(models: &[ResolutionModel]) -> Vec<f64> {
    let best = models
        .iter()
        .map(|m| m.aic())
        .fold(f64::INFINITY, f64::min);
    models.iter().map(|m| m.aic() - best).collect()
}

/// Starting values from a straight-line fit of FWHM² against E, clamped into bounds.
fn detector_seed(energy: &Array1<f64>, fwhm: &Array1<f64>) -> Vec<f64> {
    let bounds = ModelKind::Detector.bounds();
    let fallback = ModelKind::Detector.initial_guess().to_vec();
    let n = energy.len() as f64;
    let mean_e = energy.sum() / n;
    let squared = fwhm.mapv(|f| f * f);
    let mean_f2 = squared.sum() / n;

    let sxx: f64 = energy.iter().map(|e| (e - mean_e).powi(2)).sum();
    if sxx <= 0.0 {
        return fallback;
    }
    let sxy: f64 = energy
        .iter()
        .zip(squared.iter())
        .map(|(e, f2)| (e - mean_e) * (f2 - mean_f2))
        .sum();
    let slope = sxy / sxx;
    let intercept = mean_f2 - slope * mean_e;

    vec![
        bounds[0].clamp(intercept.max(0.0).sqrt()),
        bounds[1].clamp(slope / FWHM_SQUARED_FACTOR),
    ]
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// A reference-standard spectrum with the lines to measure on it.
#[derive(Debug, Clone)]
pub struct ReferenceStandard {
    pub id: String,
    pub spectrum: Spectrum,
    pub lines: Vec<ExpectedLine>,
}

impl ReferenceStandard {
    /// Standard using the built-in line list for `id`.
    pub fn new(id: &str, spectrum: Spectrum) -> Self {
        Self {
            id: id.to_string(),
            lines: ExpectedLine::defaults_for(id),
            spectrum,
        }
    }

    pub fn with_lines(id: &str, spectrum: Spectrum, lines: Vec<ExpectedLine>) -> Self {
        Self {
            id: id.to_string(),
            spectrum,
            lines,
        }
    }
}

/// Raw standards to fitted resolution model: subtract background, measure
/// every expected line, then regress the accepted widths.
pub fn calibrate_resolution(
    standards: &[ReferenceStandard],
    background: &BackgroundModel,
    measurer: &PeakWidthMeasurer,
    fitter: &ResolutionModelFitter,
    kind: ModelKind,
) -> Result<ResolutionFit> {
    let mut survey = Survey::default();
    for standard in standards {
        let subtracted = background.subtract(&standard.spectrum)?;
        let found = measurer.survey(&subtracted, &standard.id, &standard.lines)?;
        info!(
            "{}: {} lines accepted, {} rejected",
            standard.id,
            found.accepted.len(),
            found.rejected.len()
        );
        survey.extend(found);
    }

    let mut fit = fitter.fit(&survey.accepted, kind)?;
    fit.rejected_peaks = survey.rejected;
    Ok(fit)
}
