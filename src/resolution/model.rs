//! Detector resolution models.
//!
//! A [`ResolutionModel`] is a closed [`ModelKind`] tag plus named parameter
//! values and the goodness-of-fit statistics of the regression that produced
//! it. Prediction is a pure function of the two.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, XrfError};
use crate::parameters::Bounds;

/// `2.355²`, converting the Fano-limited variance term into FWHM².
pub const FWHM_SQUARED_FACTOR: f64 = 2.355 * 2.355;

/// Version written into persisted resolution models.
pub const RESOLUTION_FORMAT_VERSION: u32 = 1;

/// Energy (keV) at which non-detector models are matched to detector parameters.
const DETECTOR_EQUIVALENT_ENERGY: f64 = 6.0;

/// Epsilon assumed when matching non-detector models.
const TYPICAL_EPSILON: f64 = 0.0035;

/// Functional form of FWHM(E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// `sqrt(fwhm_0² + 2.355²·epsilon·E)`
    Detector,
    /// `intercept + slope·E`
    Linear,
    /// `intercept + linear_coef·E + quadratic_coef·E²`
    Quadratic,
    /// `amplitude·exp(exponent·E)`
    Exponential,
    /// `amplitude·E^power`
    Power,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Detector,
        ModelKind::Linear,
        ModelKind::Quadratic,
        ModelKind::Exponential,
        ModelKind::Power,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Detector => "detector",
            ModelKind::Linear => "linear",
            ModelKind::Quadratic => "quadratic",
            ModelKind::Exponential => "exponential",
            ModelKind::Power => "power",
        }
    }

    /// Resolve a model by name, case-insensitive.
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        ModelKind::ALL
            .iter()
            .copied()
            .find(|k| k.name() == lower)
            .ok_or_else(|| {
                XrfError::Configuration(format!(
                    "Unknown resolution model '{}'. Choose from: detector, linear, quadratic, exponential, power",
                    name
                ))
            })
    }

    /// Canonical parameter names, in fit order.
    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            ModelKind::Detector => &["fwhm_0", "epsilon"],
            ModelKind::Linear => &["intercept", "slope"],
            ModelKind::Quadratic => &["intercept", "linear_coef", "quadratic_coef"],
            ModelKind::Exponential => &["amplitude", "exponent"],
            ModelKind::Power => &["amplitude", "power"],
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_names().len()
    }

    pub fn initial_guess(&self) -> &'static [f64] {
        match self {
            ModelKind::Detector => &[0.100, 0.001],
            ModelKind::Linear => &[0.100, 0.005],
            ModelKind::Quadratic => &[0.100, 0.005, 0.0001],
            ModelKind::Exponential => &[0.100, 0.02],
            ModelKind::Power => &[0.100, 0.3],
        }
    }

    pub fn bounds(&self) -> Vec<Bounds> {
        let limits: &[(f64, f64)] = match self {
            ModelKind::Detector => &[(0.050, 0.200), (0.0001, 0.01)],
            ModelKind::Linear => &[(0.050, 0.200), (0.0, 0.02)],
            ModelKind::Quadratic => &[(0.050, 0.200), (-0.01, 0.02), (-0.001, 0.001)],
            ModelKind::Exponential => &[(0.050, 0.200), (0.0, 0.1)],
            ModelKind::Power => &[(0.050, 0.200), (0.0, 1.0)],
        };
        limits.iter().map(|&(min, max)| Bounds { min, max }).collect()
    }

    /// FWHM (keV) at `energy` for parameter values in canonical order.
    pub fn evaluate(&self, params: &[f64], energy: f64) -> f64 {
        match self {
            ModelKind::Detector => {
                (params[0] * params[0] + FWHM_SQUARED_FACTOR * params[1] * energy)
                    .max(0.0)
                    .sqrt()
            }
            ModelKind::Linear => params[0] + params[1] * energy,
            ModelKind::Quadratic => params[0] + params[1] * energy + params[2] * energy * energy,
            ModelKind::Exponential => params[0] * (params[1] * energy).exp(),
            ModelKind::Power => params[0] * energy.powf(params[1]),
        }
    }

    /// Partial derivatives of [`ModelKind::evaluate`] with respect to each parameter.
    pub fn gradient(&self, params: &[f64], energy: f64) -> Vec<f64> {
        match self {
            ModelKind::Detector => {
                let f = self.evaluate(params, energy).max(f64::MIN_POSITIVE);
                vec![params[0] / f, FWHM_SQUARED_FACTOR * energy / (2.0 * f)]
            }
            ModelKind::Linear => vec![1.0, energy],
            ModelKind::Quadratic => vec![1.0, energy, energy * energy],
            ModelKind::Exponential => {
                let e = (params[1] * energy).exp();
                vec![e, params[0] * energy * e]
            }
            ModelKind::Power => {
                let p = energy.powf(params[1]);
                let log = if energy > 0.0 { energy.ln() } else { 0.0 };
                vec![p, params[0] * p * log]
            }
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Detector parameters consumed by spectrum synthesis and calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionParams {
    /// Electronic noise contribution (keV)
    pub fwhm_0: f64,
    /// Fano-limited term (keV)
    pub epsilon: f64,
}

impl Default for ResolutionParams {
    fn default() -> Self {
        Self {
            fwhm_0: 0.120,
            epsilon: 0.0035,
        }
    }
}

impl ResolutionParams {
    pub fn new(fwhm_0: f64, epsilon: f64) -> Self {
        Self { fwhm_0, epsilon }
    }

    /// FWHM (keV) at `energy`.
    pub fn fwhm(&self, energy: f64) -> f64 {
        ModelKind::Detector.evaluate(&[self.fwhm_0, self.epsilon], energy)
    }
}

/// A fitted (or default) detector resolution model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionModel {
    format_version: u32,
    model_type: ModelKind,
    parameters: BTreeMap<String, f64>,
    parameter_errors: BTreeMap<String, f64>,
    r_squared: f64,
    rmse: f64,
    aic: f64,
    bic: f64,
    n_measurements: usize,
    energy_range: (f64, f64),
    created_at: DateTime<Utc>,
}

/// Goodness-of-fit figures attached to a fitted model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct FitStatistics {
    pub r_squared: f64,
    pub rmse: f64,
    pub aic: f64,
    pub bic: f64,
    pub n_measurements: usize,
    pub energy_range: (f64, f64),
}

impl ResolutionModel {
    /// An unfitted model with the given values in canonical order.
    pub fn from_values(kind: ModelKind, values: &[f64]) -> Result<Self> {
        Self::fitted(kind, values, &[], FitStatistics {
            energy_range: (0.0, 20.0),
            ..FitStatistics::default()
        })
    }

    pub(crate) fn fitted(
        kind: ModelKind,
        values: &[f64],
        errors: &[f64],
        stats: FitStatistics,
    ) -> Result<Self> {
        let names = kind.parameter_names();
        if values.len() != names.len() || !(errors.is_empty() || errors.len() == names.len()) {
            return Err(XrfError::DimensionMismatch(format!(
                "{} model takes {} parameters, got {} values and {} errors",
                kind,
                names.len(),
                values.len(),
                errors.len()
            )));
        }

        Ok(Self {
            format_version: RESOLUTION_FORMAT_VERSION,
            model_type: kind,
            parameters: names.iter().map(|n| n.to_string()).zip(values.iter().cloned()).collect(),
            parameter_errors: names
                .iter()
                .map(|n| n.to_string())
                .zip(errors.iter().cloned())
                .collect(),
            r_squared: stats.r_squared,
            rmse: stats.rmse,
            aic: stats.aic,
            bic: stats.bic,
            n_measurements: stats.n_measurements,
            energy_range: stats.energy_range,
            created_at: Utc::now(),
        })
    }

    /// Typical silicon drift detector: 120 eV and 3.5 eV/keV.
    pub fn default_sdd() -> Self {
        let mut model = Self {
            format_version: RESOLUTION_FORMAT_VERSION,
            model_type: ModelKind::Detector,
            parameters: BTreeMap::new(),
            parameter_errors: BTreeMap::new(),
            r_squared: 0.0,
            rmse: 0.0,
            aic: 0.0,
            bic: 0.0,
            n_measurements: 0,
            energy_range: (0.0, 20.0),
            created_at: Utc::now(),
        };
        model.parameters.insert("fwhm_0".to_string(), 0.120);
        model.parameters.insert("epsilon".to_string(), 0.0035);
        model.parameter_errors.insert("fwhm_0".to_string(), 0.005);
        model.parameter_errors.insert("epsilon".to_string(), 0.0002);
        model
    }

    pub fn model_type(&self) -> ModelKind {
        self.model_type
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    pub fn parameter_errors(&self) -> &BTreeMap<String, f64> {
        &self.parameter_errors
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    /// Values in the canonical order of the model kind. Missing entries read as 0.
    pub fn values(&self) -> Vec<f64> {
        self.model_type
            .parameter_names()
            .iter()
            .map(|n| self.parameter(n).unwrap_or(0.0))
            .collect()
    }

    pub fn r_squared(&self) -> f64 {
        self.r_squared
    }

    pub fn rmse(&self) -> f64 {
        self.rmse
    }

    pub fn aic(&self) -> f64 {
        self.aic
    }

    pub fn bic(&self) -> f64 {
        self.bic
    }

    pub fn n_measurements(&self) -> usize {
        self.n_measurements
    }

    pub fn energy_range(&self) -> (f64, f64) {
        self.energy_range
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// FWHM (keV) at `energy`.
    pub fn predict(&self, energy: f64) -> f64 {
        predict(self, energy)
    }

    pub fn predict_many(&self, energies: &[f64]) -> Vec<f64> {
        let values = self.values();
        energies
            .iter()
            .map(|&e| self.model_type.evaluate(&values, e))
            .collect()
    }

    /// Equivalent detector parameters.
    ///
    /// Detector models return their own values. Other forms are matched at
    /// 6 keV assuming a typical epsilon of 3.5 eV/keV.
    pub fn detector_equivalent(&self) -> ResolutionParams {
        match self.model_type {
            ModelKind::Detector => {
                let v = self.values();
                ResolutionParams::new(v[0], v[1])
            }
            _ => {
                let at_ref = self.predict(DETECTOR_EQUIVALENT_ENERGY);
                let fwhm_0 = (at_ref * at_ref
                    - FWHM_SQUARED_FACTOR * TYPICAL_EPSILON * DETECTOR_EQUIVALENT_ENERGY)
                    .max(0.0)
                    .sqrt();
                ResolutionParams::new(fwhm_0, TYPICAL_EPSILON)
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a persisted model, accepting the legacy detector-only layout too.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        if value.get("format_version").is_none()
            && (value.get("fwhm_0_keV").is_some() || value.get("fwhm_0_eV").is_some())
        {
            return Self::from_legacy_value(&value);
        }
        let model: ResolutionModel = serde_json::from_value(value)?;
        if model.format_version > RESOLUTION_FORMAT_VERSION {
            return Err(XrfError::InvalidInput(format!(
                "Resolution model format version {} is newer than supported ({})",
                model.format_version, RESOLUTION_FORMAT_VERSION
            )));
        }
        Ok(model)
    }

    /// Read a legacy peak-shape calibration document.
    ///
    /// Accepts `fwhm_0_keV` (with `epsilon_keV` or `epsilon_eV_per_keV`) or
    /// `fwhm_0_eV` (with `epsilon_eV_per_keV`).
    pub fn from_legacy_json(json: &str) -> Result<Self> {
        Self::from_legacy_value(&serde_json::from_str(json)?)
    }

    fn from_legacy_value(value: &Value) -> Result<Self> {
        let number = |key: &str| value.get(key).and_then(Value::as_f64);

        let (fwhm_0, epsilon) = if let Some(kev) = number("fwhm_0_keV") {
            let epsilon = number("epsilon_keV")
                .or_else(|| number("epsilon_eV_per_keV").map(|e| e / 1000.0))
                .unwrap_or(0.003);
            (kev, epsilon)
        } else if let Some(ev) = number("fwhm_0_eV") {
            (ev / 1000.0, number("epsilon_eV_per_keV").unwrap_or(3.5) / 1000.0)
        } else {
            return Err(XrfError::InvalidInput(
                "Unknown resolution calibration format".to_string(),
            ));
        };

        let created_at = value
            .get("calibration_date")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let mut model = Self::fitted(
            ModelKind::Detector,
            &[fwhm_0, epsilon],
            &[
                number("fwhm_0_error_eV").unwrap_or(0.0) / 1000.0,
                number("epsilon_error_eV_per_keV").unwrap_or(0.0) / 1000.0,
            ],
            FitStatistics {
                r_squared: number("r_squared").unwrap_or(0.0),
                rmse: number("rmse_eV").unwrap_or(0.0) / 1000.0,
                aic: number("aic").unwrap_or(0.0),
                bic: number("bic").unwrap_or(0.0),
                n_measurements: number("n_peaks").unwrap_or(0.0) as usize,
                energy_range: (0.0, 20.0),
            },
        )?;
        model.created_at = created_at;
        Ok(model)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        Self::from_json(&contents)
    }
}

impl fmt::Display for ResolutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.model_type {
            ModelKind::Detector => write!(
                f,
                "ResolutionModel(detector, FWHM0 = {:.1} eV, epsilon = {:.2} eV/keV, R² = {:.4})",
                self.parameter("fwhm_0").unwrap_or(0.0) * 1000.0,
                self.parameter("epsilon").unwrap_or(0.0) * 1000.0,
                self.r_squared
            ),
            kind => write!(
                f,
                "ResolutionModel({}, R² = {:.4}, RMSE = {:.1} eV)",
                kind,
                self.r_squared,
                self.rmse * 1000.0
            ),
        }
    }
}

/// FWHM (keV) predicted by `model` at `energy`.
pub fn predict(model: &ResolutionModel, energy: f64) -> f64 {
    model.model_type.evaluate(&model.values(), energy)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

impl From<&ResolutionModel> for ResolutionParams {
    fn from(model: &ResolutionModel) -> Self {
        model.detector_equivalent()
    }
}
