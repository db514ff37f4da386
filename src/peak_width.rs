//! Peak-width measurement on isolated emission lines.
//!
//! [`PeakWidthMeasurer`] cuts a window around an expected line energy out of a
//! background-subtracted spectrum, fits a single peak with bounded
//! Levenberg-Marquardt and either accepts the fit as a [`PeakMeasurement`] or
//! rejects it with a [`RejectionReason`]. Rejections are values: a bad line
//! never aborts a survey of the other lines.

use log::{debug, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, XrfError};
use crate::lm::{LevenbergMarquardt, LmConfig};
use crate::models::peak::{fwhm_to_sigma, sigma_to_fwhm, PeakShape};
use crate::parameters::{Bounds, Parameter, Parameters};
use crate::problem::Problem;
use crate::spectrum::Spectrum;

/// Starting FWHM for every peak fit, typical of a silicon drift detector.
const INITIAL_FWHM: f64 = 0.150;

/// Minimum counts a window must hold before a fit is attempted.
///
/// Thresholds are stricter above `switch_energy`, where both counting
/// statistics and detector efficiency degrade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountThresholds {
    pub peak_min: f64,
    pub peak_min_high: f64,
    pub total_min: f64,
    pub total_min_high: f64,
    pub switch_energy: f64,
}

impl Default for CountThresholds {
    fn default() -> Self {
        Self {
            peak_min: 80.0,
            peak_min_high: 150.0,
            total_min: 400.0,
            total_min_high: 750.0,
            switch_energy: 10.0,
        }
    }
}

impl CountThresholds {
    /// Minimum peak-maximum counts at `energy`.
    pub fn peak_minimum(&self, energy: f64) -> f64 {
        if energy > self.switch_energy {
            self.peak_min_high
        } else {
            self.peak_min
        }
    }

    /// Minimum total counts in the window at `energy`.
    pub fn total_minimum(&self, energy: f64) -> f64 {
        if energy > self.switch_energy {
            self.total_min_high
        } else {
            self.total_min
        }
    }
}

/// Configuration for [`PeakWidthMeasurer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurerConfig {
    /// Fitted line shape
    pub shape: PeakShape,

    /// Full window width (keV) centred on the expected energy
    pub window_width: f64,

    /// Allowed distance (keV) of the fitted center from the expected energy
    pub center_tolerance: f64,

    /// Amplitude bounds as fractions of the observed window maximum
    pub amplitude_range: (f64, f64),

    /// FWHM bounds (keV) the optimizer may explore
    pub fit_fwhm_range: (f64, f64),

    /// Plausible FWHM band (keV) for accepting a measurement
    pub fwhm_range: (f64, f64),

    /// Minimum coefficient of determination
    pub min_r_squared: f64,

    /// Minimum number of channels in the window
    pub min_window_points: usize,

    pub thresholds: CountThresholds,

    pub lm: LmConfig,
}

impl Default for MeasurerConfig {
    fn default() -> Self {
        Self {
            shape: PeakShape::Gaussian,
            window_width: 0.6,
            center_tolerance: 0.050,
            amplitude_range: (0.5, 1.5),
            fit_fwhm_range: (0.080, 0.300),
            fwhm_range: (0.090, 0.250),
            min_r_squared: 0.85,
            min_window_points: 10,
            thresholds: CountThresholds::default(),
            lm: LmConfig::default(),
        }
    }
}

/// An emission line expected in a reference standard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedLine {
    pub element: String,
    pub line: String,
    /// Nominal energy (keV)
    pub energy: f64,
}

impl ExpectedLine {
    pub fn new(element: &str, line: &str, energy: f64) -> Self {
        Self {
            element: element.to_string(),
            line: line.to_string(),
            energy,
        }
    }

    /// Lines measured on the common pure-element standards.
    ///
    /// Every standard also shows the Al Kα line of the sample holder. Zr L
    /// lines of cubic zirconia are left out: they are overlapping multiplets
    /// and would bias the resolution curve. Unknown standards yield an empty
    /// list.
    pub fn defaults_for(standard: &str) -> Vec<ExpectedLine> {
        let holder = ExpectedLine::new("Al", "Ka", 1.487);
        let lines: &[(&str, &str, f64)] = match standard.trim().to_ascii_lowercase().as_str() {
            "fe" => &[("Fe", "Ka1", 6.404), ("Fe", "Ka2", 6.391), ("Fe", "Kb1", 7.058)],
            "cu" => &[("Cu", "Ka1", 8.048), ("Cu", "Ka2", 8.028), ("Cu", "Kb1", 8.905)],
            "ti" => &[("Ti", "Ka1", 4.511), ("Ti", "Ka2", 4.505), ("Ti", "Kb1", 4.932)],
            "zn" => &[("Zn", "Ka1", 8.639), ("Zn", "Ka2", 8.616), ("Zn", "Kb1", 9.572)],
            "mg" => &[("Mg", "Ka", 1.254)],
            "zr" | "zro2" | "cubic zirconia" => {
                return vec![
                    ExpectedLine::new("Zr", "Ka1", 15.775),
                    ExpectedLine::new("Zr", "Kb1", 17.668),
                ]
            }
            _ => return Vec::new(),
        };

        lines
            .iter()
            .map(|&(el, line, e)| ExpectedLine::new(el, line, e))
            .chain(std::iter::once(holder))
            .collect()
    }
}

/// One accepted peak fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakMeasurement {
    pub element: String,
    pub line: String,
    pub expected_energy: f64,
    /// Fitted center (keV)
    pub center: f64,
    /// Fitted peak height (counts)
    pub amplitude: f64,
    /// Fitted full width at half maximum (keV)
    pub fwhm: f64,
    /// Integrated peak area (counts·keV)
    pub area: f64,
    /// Coefficient of determination in [0, 1]
    pub r_squared: f64,
    pub standard_id: String,
}

/// Why a line was not measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    InsufficientCounts { peak_max: f64, total: f64 },
    TooFewPoints { points: usize },
    PoorFit { r_squared: f64 },
    FwhmOutOfRange { fwhm: f64 },
    FitFailed(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InsufficientCounts { peak_max, total } => write!(
                f,
                "insufficient counts (peak {:.0}, window total {:.0})",
                peak_max, total
            ),
            RejectionReason::TooFewPoints { points } => {
                write!(f, "too few points in window ({})", points)
            }
            RejectionReason::PoorFit { r_squared } => write!(f, "poor fit (R² = {:.3})", r_squared),
            RejectionReason::FwhmOutOfRange { fwhm } => {
                write!(f, "unrealistic FWHM ({:.1} eV)", fwhm * 1000.0)
            }
            RejectionReason::FitFailed(msg) => write!(f, "fit failed: {}", msg),
        }
    }
}

/// A line that was looked for and rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPeak {
    pub element: String,
    pub line: String,
    pub expected_energy: f64,
    pub standard_id: String,
    pub reason: RejectionReason,
}

/// Outcome of measuring one line.
#[derive(Debug, Clone, PartialEq)]
pub enum PeakFit {
    Accepted(PeakMeasurement),
    Rejected(RejectedPeak),
}

impl PeakFit {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PeakFit::Accepted(_))
    }

    pub fn measurement(&self) -> Option<&PeakMeasurement> {
        match self {
            PeakFit::Accepted(m) => Some(m),
            PeakFit::Rejected(_) => None,
        }
    }
}

/// Accepted and rejected peaks of one or more standards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub accepted: Vec<PeakMeasurement>,
    pub rejected: Vec<RejectedPeak>,
}

impl Survey {
    /// Append another survey.
    pub fn extend(&mut self, other: Survey) {
        self.accepted.extend(other.accepted);
        self.rejected.extend(other.rejected);
    }
}

/// Single-peak residuals `model(E) − counts` over a window.
struct PeakWindowProblem {
    energy: Array1<f64>,
    counts: Array1<f64>,
    shape: PeakShape,
}

impl Problem for PeakWindowProblem {
    fn eval(&self, params: &Array1<f64>) -> Result<Array1<f64>> {
        let (amplitude, center, sigma) = (params[0], params[1], params[2]);
        Ok(self
            .energy
            .iter()
            .zip(self.counts.iter())
            .map(|(&e, &c)| self.shape.value(e, amplitude, center, sigma) - c)
            .collect())
    }

    fn parameter_count(&self) -> usize {
        3
    }

    fn residual_count(&self) -> usize {
        self.energy.len()
    }

    fn jacobian(&self, params: &Array1<f64>) -> Result<Array2<f64>> {
        let (amplitude, center, sigma) = (params[0], params[1], params[2]);
        let mut jac = Array2::zeros((self.energy.len(), 3));
        for (i, &e) in self.energy.iter().enumerate() {
            let d = self.shape.derivatives(e, amplitude, center, sigma);
            jac[[i, 0]] = d[0];
            jac[[i, 1]] = d[1];
            jac[[i, 2]] = d[2];
        }
        Ok(jac)
    }

    fn has_custom_jacobian(&self) -> bool {
        true
    }
}

/// Fits isolated peaks and filters them by count statistics and fit quality.
#[derive(Debug, Clone, Default)]
pub struct PeakWidthMeasurer {
    config: MeasurerConfig,
}

impl PeakWidthMeasurer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MeasurerConfig) -> Self {
        Self { config }
    }

    pub fn with_shape(mut self, shape: PeakShape) -> Self {
        self.config.shape = shape;
        self
    }

    pub fn with_window_width(mut self, window_width: f64) -> Self {
        self.config.window_width = window_width;
        self
    }

    pub fn with_min_r_squared(mut self, min_r_squared: f64) -> Self {
        self.config.min_r_squared = min_r_squared;
        self
    }

    pub fn with_fwhm_range(mut self, min: f64, max: f64) -> Self {
        self.config.fwhm_range = (min, max);
        self
    }

    pub fn with_thresholds(mut self, thresholds: CountThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn config(&self) -> &MeasurerConfig {
        &self.config
    }

    /// Measure one line with the configured window width.
    pub fn measure(
        &self,
        spectrum: &Spectrum,
        line: &ExpectedLine,
        standard_id: &str,
    ) -> Result<PeakFit> {
        self.measure_window(spectrum, line, standard_id, self.config.window_width)
    }

    /// Measure one line inside `expected ± window_width/2`.
    ///
    /// Only configuration problems are errors; everything that goes wrong with
    /// the data itself comes back as [`PeakFit::Rejected`].
    pub fn measure_window(
        &self,
        spectrum: &Spectrum,
        line: &ExpectedLine,
        standard_id: &str,
        window_width: f64,
    ) -> Result<PeakFit> {
        self.validate(window_width)?;

        let reject = |reason: RejectionReason| {
            Ok(PeakFit::Rejected(RejectedPeak {
                element: line.element.clone(),
                line: line.line.clone(),
                expected_energy: line.energy,
                standard_id: standard_id.to_string(),
                reason,
            }))
        };

        let half = 0.5 * window_width;
        let (energy, counts) = spectrum.roi(line.energy - half, line.energy + half);
        if energy.len() < self.config.min_window_points {
            return reject(RejectionReason::TooFewPoints {
                points: energy.len(),
            });
        }

        let (max_idx, peak_max) = counts
            .iter()
            .cloned()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, c)| if c > best.1 { (i, c) } else { best });
        let total = counts.sum();
        let thresholds = &self.config.thresholds;
        if peak_max < thresholds.peak_minimum(line.energy)
            || total < thresholds.total_minimum(line.energy)
        {
            return reject(RejectionReason::InsufficientCounts { peak_max, total });
        }

        let parameters = match self.start_parameters(line.energy, energy[max_idx], peak_max) {
            Ok(p) => p,
            Err(e) => return reject(RejectionReason::FitFailed(e.to_string())),
        };
        let problem = PeakWindowProblem {
            energy,
            counts,
            shape: self.config.shape,
        };

        let fit = match LevenbergMarquardt::with_config(self.config.lm.clone())
            .minimize_bounded(&problem, &parameters, &mut |_| {})
        {
            Ok(fit) => fit,
            Err(e) => return reject(RejectionReason::FitFailed(e.to_string())),
        };
        if !fit.result.success {
            return reject(RejectionReason::FitFailed(fit.result.message.clone()));
        }

        let values = fit.parameters.values();
        let (amplitude, center, sigma) = (values[0], values[1], values[2]);
        let fwhm = sigma_to_fwhm(sigma);
        let r_squared = r_squared(&problem.counts, fit.result.cost);
        debug!(
            "{} {} @ {:.3} keV: center {:.4}, FWHM {:.1} eV, R² {:.4} ({} iterations)",
            line.element,
            line.line,
            line.energy,
            center,
            fwhm * 1000.0,
            r_squared,
            fit.result.iterations
        );

        if r_squared < self.config.min_r_squared {
            return reject(RejectionReason::PoorFit { r_squared });
        }
        let (fwhm_min, fwhm_max) = self.config.fwhm_range;
        if !(fwhm > fwhm_min && fwhm < fwhm_max) {
            return reject(RejectionReason::FwhmOutOfRange { fwhm });
        }

        Ok(PeakFit::Accepted(PeakMeasurement {
            element: line.element.clone(),
            line: line.line.clone(),
            expected_energy: line.energy,
            center,
            amplitude,
            fwhm,
            area: self.config.shape.area(amplitude, sigma),
            r_squared,
            standard_id: standard_id.to_string(),
        }))
    }

    /// Measure every line of a standard, logging rejections.
    pub fn survey(
        &self,
        spectrum: &Spectrum,
        standard_id: &str,
        lines: &[ExpectedLine],
    ) -> Result<Survey> {
        let mut survey = Survey::default();
        for line in lines {
            match self.measure(spectrum, line, standard_id)? {
                PeakFit::Accepted(m) => survey.accepted.push(m),
                PeakFit::Rejected(r) => {
                    warn!(
                        "{}: {} {} @ {:.3} keV rejected: {}",
                        standard_id, r.element, r.line, r.expected_energy, r.reason
                    );
                    survey.rejected.push(r);
                }
            }
        }
        Ok(survey)
    }

    fn validate(&self, window_width: f64) -> Result<()> {
        let (lo, hi) = self.config.fit_fwhm_range;
        let (amp_lo, amp_hi) = self.config.amplitude_range;
        if !(window_width > 0.0) {
            return Err(XrfError::Configuration(format!(
                "Window width must be positive, got {}",
                window_width
            )));
        }
        if !(lo > 0.0 && lo < hi) || !(amp_lo > 0.0 && amp_lo < amp_hi) {
            return Err(XrfError::Configuration(
                "Peak fit FWHM and amplitude ranges must be positive and increasing".to_string(),
            ));
        }
        if self.config.center_tolerance <= 0.0 {
            return Err(XrfError::Configuration(
                "Center tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn start_parameters(&self, expected: f64, max_position: f64, peak_max: f64) -> Result<Parameters> {
        let config = &self.config;
        let (amp_lo, amp_hi) = config.amplitude_range;
        let (fwhm_lo, fwhm_hi) = config.fit_fwhm_range;

        let mut params = Parameters::new();
        params.add(Parameter::new(
            "amplitude",
            peak_max,
            Bounds::new(amp_lo * peak_max, amp_hi * peak_max)?,
        ))?;
        params.add(Parameter::new(
            "center",
            max_position,
            Bounds::new(expected - config.center_tolerance, expected + config.center_tolerance)?,
        ))?;
        params.add(Parameter::new(
            "sigma",
            fwhm_to_sigma(INITIAL_FWHM),
            Bounds::new(fwhm_to_sigma(fwhm_lo), fwhm_to_sigma(fwhm_hi))?,
        ))?;
        Ok(params)
    }
}

/// `1 − SSres/SStot`, clamped to [0, 1]. A flat window scores 0.
fn r_squared(observed: &Array1<f64>, ss_res: f64) -> f64 {
    let mean = observed.mean().unwrap_or(0.0);
    let ss_tot: f64 = observed.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot <= 0.0 {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}
