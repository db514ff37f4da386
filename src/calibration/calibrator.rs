//! Fit of detector resolution (and optional intensity scales) to a measured
//! spectrum of a reference standard.
//!
//! The objective compares the measurement with a forward-model spectrum
//! multiplied by the closed-form least-squares scale
//! `s = Σ(m·c)/Σ(c²)`. Residuals are Poisson weighted,
//! `w = 1/sqrt(max(m, 1))`, and divided by `sqrt(N)` so the cost is the
//! per-channel chi-square. Two extra residuals softly penalise resolution
//! parameters leaving their plausible band.

use chrono::Utc;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::background::{BackgroundMethod, BackgroundModel};
use crate::error::{Result, XrfError};
use crate::forward::{ForwardRequest, ForwardSpectrumCalculator, LineOrigin, LineSet, SpectralLine};
use crate::lm::{IterationState, LevenbergMarquardt, LmConfig};
use crate::parameters::{Bounds, Parameter, Parameters};
use crate::problem::Problem;
use crate::resolution::{ResolutionModel, ResolutionParams};
use crate::spectrum::Spectrum;
use crate::uncertainty::{calculate_covariance, reduced_chi_square, standard_errors_from_covariance};
use crate::utils::finite_difference;

use super::result::{CalibrationResult, ResolutionModelReference, CALIBRATION_FORMAT_VERSION};

const FWHM_0: &str = "fwhm_0";
const EPSILON: &str = "epsilon";
const SCATTER_SCALE: &str = "scatter_scale";
const ELEMENT_SCALE_PREFIX: &str = "scale_";

/// Fraction of the bound width that keeps start values off the limits.
const START_MARGIN: f64 = 1e-3;

/// How a supplied [`ResolutionModel`] constrains the resolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handling", rename_all = "snake_case")]
pub enum ResolutionHandling {
    /// Start at the model and allow `±fraction` around it
    Narrow { fraction: f64 },
    /// Hold the model values
    Fixed,
    /// Start at the model within the full bounds
    Free,
}

impl Default for ResolutionHandling {
    fn default() -> Self {
        ResolutionHandling::Narrow { fraction: 0.25 }
    }
}

/// Configuration for [`InstrumentCalibrator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Hard limits (keV)
    pub fwhm_0_bounds: (f64, f64),
    pub epsilon_bounds: (f64, f64),

    /// Start values without a resolution model
    pub initial: ResolutionParams,

    /// Plausible bands outside which the penalty applies
    pub soft_fwhm_0: (f64, f64),
    pub soft_epsilon: (f64, f64),

    /// Weight of the squared relative band excess
    pub regularization_weight: f64,

    pub fit_scatter_scale: bool,
    pub scatter_scale_bounds: (f64, f64),

    /// Fit one intensity scale per reference element
    pub fit_element_scales: bool,
    pub element_scale_bounds: (f64, f64),

    pub resolution_handling: ResolutionHandling,

    /// Subtracted from the measurement before fitting
    pub background: Option<BackgroundMethod>,

    /// Energy window (keV) of contributing channels
    pub fit_range: Option<(f64, f64)>,

    /// Observer period in iterations
    pub callback_interval: usize,

    pub lm: LmConfig,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            fwhm_0_bounds: (0.050, 0.250),
            epsilon_bounds: (0.0005, 0.0050),
            initial: ResolutionParams::new(0.120, 0.0025),
            soft_fwhm_0: (0.070, 0.200),
            soft_epsilon: (0.0010, 0.0045),
            regularization_weight: 0.01,
            fit_scatter_scale: false,
            scatter_scale_bounds: (0.0, 5.0),
            fit_element_scales: false,
            element_scale_bounds: (0.5, 2.0),
            resolution_handling: ResolutionHandling::default(),
            background: None,
            fit_range: None,
            callback_interval: 5,
            lm: LmConfig::default(),
        }
    }
}

/// Progress snapshot passed to calibration observers.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub cost: f64,
    pub parameters: BTreeMap<String, f64>,
}

/// One standard for [`InstrumentCalibrator::calibrate_batch`].
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    pub spectrum: Spectrum,
    pub request: ForwardRequest,
    pub resolution_model: Option<ResolutionModel>,
}

impl CalibrationRun {
    pub fn new(spectrum: Spectrum, request: ForwardRequest) -> Self {
        Self {
            spectrum,
            request,
            resolution_model: None,
        }
    }

    pub fn with_resolution_model(mut self, model: ResolutionModel) -> Self {
        self.resolution_model = Some(model);
        self
    }
}

/// Positions of the optional parameters in the parameter vector.
#[derive(Debug, Clone, Default)]
struct Layout {
    scatter: Option<usize>,
    elements: BTreeMap<String, usize>,
}

/// Calibration objective as a least-squares [`Problem`].
struct CalibrationProblem<'a> {
    calculator: &'a ForwardSpectrumCalculator,
    lines: &'a LineSet,
    energies: &'a Array1<f64>,
    /// Contributing channel indices
    channels: Vec<usize>,
    measured: Array1<f64>,
    weights: Array1<f64>,
    layout: Layout,
    config: &'a CalibratorConfig,
}

impl<'a> CalibrationProblem<'a> {
    fn line_weight(&self, params: &Array1<f64>, line: &SpectralLine) -> f64 {
        match line.origin {
            LineOrigin::TubeScatter => self.layout.scatter.map_or(1.0, |i| params[i]),
            LineOrigin::Fluorescence => self
                .layout
                .elements
                .get(&line.element)
                .map_or(1.0, |&i| params[i]),
        }
    }

    /// Unscaled model counts on the contributing channels.
    fn model(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let resolution = ResolutionParams::new(params[0], params[1]);
        let full = self
            .calculator
            .render(self.lines, self.energies, resolution, |line| self.line_weight(params, line))?;
        Ok(self.channels.iter().map(|&i| full[i]).collect())
    }

    /// Model counts and the least-squares scale onto the measurement.
    fn scaled_model(&self, params: &Array1<f64>) -> Result<(Array1<f64>, f64)> {
        let calculated = self.model(params)?;
        let denominator = calculated.dot(&calculated);
        if !(denominator > 0.0) {
            return Err(XrfError::FunctionEvaluation(
                "Calculated spectrum is empty in the fit range".to_string(),
            ));
        }
        let scale = self.measured.dot(&calculated) / denominator;
        Ok((calculated, scale))
    }

    /// `w·(m − s·c)` per contributing channel.
    fn weighted_residuals(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let (calculated, scale) = self.scaled_model(params)?;
        Ok((&self.measured - &(calculated * scale)) * &self.weights)
    }

    fn penalty_residuals(&self, params: &Array1<f64>) -> [f64; 2] {
        let weight = self.config.regularization_weight.max(0.0).sqrt();
        [
            weight * band_excess(params[0], self.config.soft_fwhm_0),
            weight * band_excess(params[1], self.config.soft_epsilon),
        ]
    }
}

impl<'a> Problem for CalibrationProblem<'a> {
    fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let norm = (self.channels.len() as f64).sqrt();
        let data = self.weighted_residuals(params)?;
        let penalty = self.penalty_residuals(params);
        Ok(data
            .iter()
            .map(|r| r / norm)
            .chain(penalty.iter().copied())
            .collect())
    }

    fn parameter_count(&self) -> usize {
        2 + self.layout.scatter.map_or(0, |_| 1) + self.layout.elements.len()
    }

    fn residual_count(&self) -> usize {
        self.channels.len() + 2
    }
}

/// Distance outside `[lo, hi]` relative to the band width.
fn band_excess(value: f64, (lo, hi): (f64, f64)) -> f64 {
    let range = (hi - lo).abs().max(f64::EPSILON);
    if value < lo {
        (lo - value) / range
    } else if value > hi {
        (value - hi) / range
    } else {
        0.0
    }
}

fn bounds_from(pair: (f64, f64)) -> Result<Bounds> {
    Ok(Bounds::new(pair.0, pair.1)?)
}

/// Calibrates detector resolution against reference standards.
#[derive(Clone)]
pub struct InstrumentCalibrator {
    calculator: ForwardSpectrumCalculator,
    config: CalibratorConfig,
}

impl InstrumentCalibrator {
    pub fn new(calculator: ForwardSpectrumCalculator) -> Self {
        Self {
            calculator,
            config: CalibratorConfig::default(),
        }
    }

    pub fn with_config(calculator: ForwardSpectrumCalculator, config: CalibratorConfig) -> Self {
        Self { calculator, config }
    }

    pub fn with_resolution_handling(mut self, handling: ResolutionHandling) -> Self {
        self.config.resolution_handling = handling;
        self
    }

    pub fn with_fit_range(mut self, lo: f64, hi: f64) -> Self {
        self.config.fit_range = Some((lo, hi));
        self
    }

    pub fn with_background(mut self, method: BackgroundMethod) -> Self {
        self.config.background = Some(method);
        self
    }

    pub fn with_scatter_scale(mut self, fit: bool) -> Self {
        self.config.fit_scatter_scale = fit;
        self
    }

    pub fn with_element_scales(mut self, fit: bool) -> Self {
        self.config.fit_element_scales = fit;
        self
    }

    pub fn with_callback_interval(mut self, interval: usize) -> Self {
        self.config.callback_interval = interval;
        self
    }

    pub fn with_lm_config(mut self, lm: LmConfig) -> Self {
        self.config.lm = lm;
        self
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    pub fn calculator(&self) -> &ForwardSpectrumCalculator {
        &self.calculator
    }

    /// Calibrate against one measured standard.
    pub fn calibrate(
        &self,
        measured: &Spectrum,
        request: &ForwardRequest,
        resolution_model: Option<&ResolutionModel>,
    ) -> Result<CalibrationResult> {
        self.calibrate_with_observer(measured, request, resolution_model, &mut |_| {})
    }

    /// Calibrate, reporting progress every `callback_interval` iterations.
    pub fn calibrate_with_observer(
        &self,
        measured: &Spectrum,
        request: &ForwardRequest,
        resolution_model: Option<&ResolutionModel>,
        observer: &mut dyn FnMut(&IterationReport),
    ) -> Result<CalibrationResult> {
        let measured = match &self.config.background {
            Some(method) => BackgroundModel::new(method.clone()).subtract(measured)?,
            None => measured.clone(),
        };

        let lines = self.calculator.prepare(request)?;
        let elements = lines.elements();
        if elements.is_empty() {
            return Err(XrfError::InvalidInput(
                "No reference element produced emission lines".to_string(),
            ));
        }
        let skipped: Vec<String> = lines.skipped.iter().map(|s| s.element.clone()).collect();

        let (parameters, layout) = self.initial_parameters(&lines, &elements, resolution_model)?;

        let energies = measured.energy();
        let channels: Vec<usize> = match self.config.fit_range {
            Some((lo, hi)) => (0..energies.len())
                .filter(|&i| energies[i] >= lo && energies[i] <= hi)
                .collect(),
            None => (0..energies.len()).collect(),
        };
        let required = parameters.varying_count() + 1;
        if channels.len() < required {
            return Err(XrfError::InsufficientData {
                usable: channels.len(),
                required,
            });
        }

        let values: Array1<f64> = channels.iter().map(|&i| measured.counts()[i]).collect();
        let problem = CalibrationProblem {
            calculator: &self.calculator,
            lines: &lines,
            energies,
            weights: values.mapv(|m| 1.0 / m.max(1.0).sqrt()),
            measured: values,
            channels,
            layout,
            config: &self.config,
        };

        let names = parameters.names();
        let interval = self.config.callback_interval.max(1);
        let mut report = |state: &IterationState| {
            if state.iteration % interval != 0 {
                return;
            }
            let parameters = names
                .iter()
                .cloned()
                .zip(state.params.iter().copied())
                .collect();
            observer(&IterationReport {
                iteration: state.iteration,
                cost: state.cost,
                parameters,
            });
        };

        let fit = LevenbergMarquardt::with_config(self.config.lm.clone())
            .minimize_bounded(&problem, &parameters, &mut report)?;
        let best = fit.parameters.values();

        let (calculated, scale) = problem.scaled_model(&best)?;
        let weighted = problem.weighted_residuals(&best)?;
        let chi_squared = weighted.dot(&weighted);
        let n = problem.channels.len();
        let n_varying = fit.parameters.varying_count();
        let reduced_chi_squared = reduced_chi_square(chi_squared, n, n_varying);

        let fitted = calculated * scale;
        let mean = problem.measured.mean().unwrap_or(0.0);
        let ss_res: f64 = problem
            .measured
            .iter()
            .zip(fitted.iter())
            .map(|(m, c)| (m - c).powi(2))
            .sum();
        let ss_tot: f64 = problem.measured.iter().map(|m| (m - mean).powi(2)).sum();
        let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

        let uncertainties = match parameter_errors(&problem, &fit.parameters, reduced_chi_squared) {
            Ok(errors) => errors,
            Err(e) => {
                warn!("Calibration uncertainties unavailable: {}", e);
                None
            }
        };

        let converged = fit.result.success;
        if converged {
            info!(
                "Calibration converged after {} iterations: fwhm_0 = {:.4} keV, epsilon = {:.5} keV, reduced chi-square {:.3}",
                fit.result.iterations, best[0], best[1], reduced_chi_squared
            );
        } else {
            warn!(
                "Calibration did not converge ({}); returning best parameters fwhm_0 = {:.4}, epsilon = {:.5}",
                fit.result.message, best[0], best[1]
            );
        }

        let held_fixed = self.config.resolution_handling == ResolutionHandling::Fixed;
        Ok(CalibrationResult {
            format_version: CALIBRATION_FORMAT_VERSION,
            parameters: names.iter().cloned().zip(best.iter().copied()).collect(),
            uncertainties,
            chi_squared,
            reduced_chi_squared,
            r_squared,
            intensity_scale: scale,
            n_channels: n,
            iterations: fit.result.iterations,
            converged,
            message: fit.result.message.clone(),
            skipped_elements: skipped,
            resolution_model_reference: resolution_model
                .map(|m| ResolutionModelReference::from_model(m, held_fixed)),
            created_at: Utc::now(),
        })
    }

    /// Calibrate several standards in parallel. Results keep the input order.
    pub fn calibrate_batch(&self, runs: &[CalibrationRun]) -> Vec<Result<CalibrationResult>> {
        info!("Calibrating {} standards", runs.len());
        runs.par_iter()
            .map(|run| self.calibrate(&run.spectrum, &run.request, run.resolution_model.as_ref()))
            .collect()
    }

    fn initial_parameters(
        &self,
        lines: &LineSet,
        elements: &[String],
        resolution_model: Option<&ResolutionModel>,
    ) -> Result<(Parameters, Layout)> {
        let config = &self.config;
        let fwhm_bounds = bounds_from(config.fwhm_0_bounds)?;
        let epsilon_bounds = bounds_from(config.epsilon_bounds)?;

        let mut parameters = Parameters::new();
        match resolution_model {
            None => {
                parameters.add(Parameter::new(
                    FWHM_0,
                    fwhm_bounds.interior(config.initial.fwhm_0, START_MARGIN),
                    fwhm_bounds,
                ))?;
                parameters.add(Parameter::new(
                    EPSILON,
                    epsilon_bounds.interior(config.initial.epsilon, START_MARGIN),
                    epsilon_bounds,
                ))?;
            }
            Some(model) => {
                let start = model.detector_equivalent();
                debug!(
                    "Starting from {} resolution model: fwhm_0 = {:.4}, epsilon = {:.5}",
                    model.model_type(),
                    start.fwhm_0,
                    start.epsilon
                );
                for (name, value, hard) in [
                    (FWHM_0, start.fwhm_0, fwhm_bounds),
                    (EPSILON, start.epsilon, epsilon_bounds),
                ] {
                    let parameter = match config.resolution_handling {
                        ResolutionHandling::Fixed => Parameter::fixed(name, value),
                        ResolutionHandling::Free => {
                            Parameter::new(name, hard.interior(value, START_MARGIN), hard)
                        }
                        ResolutionHandling::Narrow { fraction } => {
                            let f = fraction.abs();
                            let around = bounds_from((value * (1.0 - f), value * (1.0 + f)))?;
                            if !hard.overlaps(&around) {
                                warn!(
                                    "{} = {} from the resolution model lies outside [{}, {}]; fitting within the full bounds",
                                    name, value, hard.min, hard.max
                                );
                            }
                            let narrow = hard.intersect(&around);
                            Parameter::new(name, narrow.interior(value, START_MARGIN), narrow)
                        }
                    };
                    parameters.add(parameter)?;
                }
            }
        }

        let mut layout = Layout::default();
        if config.fit_scatter_scale && lines.scatter().next().is_some() {
            let bounds = bounds_from(config.scatter_scale_bounds)?;
            layout.scatter = Some(parameters.len());
            parameters.add(Parameter::new(SCATTER_SCALE, bounds.interior(1.0, START_MARGIN), bounds))?;
        }
        if config.fit_element_scales {
            let bounds = bounds_from(config.element_scale_bounds)?;
            for element in elements {
                layout.elements.insert(element.clone(), parameters.len());
                parameters.add(Parameter::new(
                    &format!("{}{}", ELEMENT_SCALE_PREFIX, element),
                    bounds.interior(1.0, START_MARGIN),
                    bounds,
                ))?;
            }
        }
        Ok((parameters, layout))
    }
}

/// Standard errors of the varied parameters from the weighted data residuals.
fn parameter_errors(
    problem: &CalibrationProblem,
    parameters: &Parameters,
    redchi: f64,
) -> Result<Option<BTreeMap<String, f64>>> {
    let varying: Vec<usize> = parameters
        .iter()
        .enumerate()
        .filter(|(_, p)| p.vary())
        .map(|(i, _)| i)
        .collect();
    if varying.is_empty() {
        return Ok(None);
    }

    let full = parameters.values();
    let start: Array1<f64> = varying.iter().map(|&i| full[i]).collect();
    let residuals = |sub: &Array1<f64>| -> Result<Array1<f64>> {
        let mut p = full.clone();
        for (k, &i) in varying.iter().enumerate() {
            p[i] = sub[k];
        }
        problem.weighted_residuals(&p)
    };
    let jacobian: Array2<f64> = finite_difference::jacobian(&residuals, &start, None)?;
    let covariance = calculate_covariance(&jacobian, redchi)?;
    let errors = standard_errors_from_covariance(&covariance);

    let names = parameters.names();
    Ok(Some(
        varying
            .iter()
            .zip(errors.iter())
            .map(|(&i, &e)| (names[i].clone(), e))
            .collect(),
    ))
}
