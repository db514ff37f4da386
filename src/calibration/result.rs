//! Persisted outcome of an instrument calibration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, XrfError};
use crate::resolution::{ModelKind, ResolutionModel, ResolutionParams};

/// Version written into every saved [`CalibrationResult`].
pub const CALIBRATION_FORMAT_VERSION: u32 = 1;

fn format_version_default() -> u32 {
    CALIBRATION_FORMAT_VERSION
}

/// The pre-fitted resolution model a calibration started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionModelReference {
    pub model_type: ModelKind,
    pub created_at: DateTime<Utc>,
    /// Detector-equivalent parameters of the model
    pub fwhm_0: f64,
    pub epsilon: f64,
    /// Whether the resolution parameters were held at the model values
    pub held_fixed: bool,
}

impl ResolutionModelReference {
    pub fn from_model(model: &ResolutionModel, held_fixed: bool) -> Self {
        let params = model.detector_equivalent();
        Self {
            model_type: model.model_type(),
            created_at: model.created_at(),
            fwhm_0: params.fwhm_0,
            epsilon: params.epsilon,
            held_fixed,
        }
    }
}

/// Best parameters found by [`InstrumentCalibrator`](super::InstrumentCalibrator).
///
/// A run that did not converge still produces a result, with `converged`
/// set to false and the last parameters reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    #[serde(default = "format_version_default")]
    pub format_version: u32,

    /// `fwhm_0`, `epsilon`, then any scatter and element scales
    pub parameters: BTreeMap<String, f64>,

    /// One-sigma errors of the varied parameters
    #[serde(default)]
    pub uncertainties: Option<BTreeMap<String, f64>>,

    /// Poisson-weighted sum of squared residuals
    pub chi_squared: f64,

    /// `chi_squared / (channels − varied parameters)`
    pub reduced_chi_squared: f64,

    /// Unweighted coefficient of determination of the scaled fit
    pub r_squared: f64,

    /// Closed-form factor between calculated and measured counts
    pub intensity_scale: f64,

    pub n_channels: usize,
    pub iterations: usize,
    pub converged: bool,
    pub message: String,

    /// Reference elements the physics oracle could not model
    #[serde(default)]
    pub skipped_elements: Vec<String>,

    #[serde(default)]
    pub resolution_model_reference: Option<ResolutionModelReference>,

    pub created_at: DateTime<Utc>,
}

impl CalibrationResult {
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    pub fn uncertainty(&self, name: &str) -> Option<f64> {
        self.uncertainties.as_ref()?.get(name).copied()
    }

    /// Calibrated detector resolution, ready for quantification.
    pub fn resolution_params(&self) -> Result<ResolutionParams> {
        match (self.parameter("fwhm_0"), self.parameter("epsilon")) {
            (Some(fwhm_0), Some(epsilon)) => Ok(ResolutionParams::new(fwhm_0, epsilon)),
            _ => Err(XrfError::InvalidInput(
                "Calibration result lacks fwhm_0 or epsilon".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let result: Self = serde_json::from_str(json)?;
        if result.format_version > CALIBRATION_FORMAT_VERSION {
            return Err(XrfError::Configuration(format!(
                "Calibration format version {} is newer than supported version {}",
                result.format_version, CALIBRATION_FORMAT_VERSION
            )));
        }
        Ok(result)
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

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration Result:")?;
        writeln!(f, "  Converged: {} ({})", self.converged, self.message)?;
        for (name, value) in &self.parameters {
            match self.uncertainty(name) {
                Some(err) => writeln!(f, "  {}: {:.6} ± {:.6}", name, value, err)?,
                None => writeln!(f, "  {}: {:.6}", name, value)?,
            }
        }
        writeln!(f, "  Chi-square: {:.4e}", self.chi_squared)?;
        writeln!(f, "  Reduced chi-square: {:.4}", self.reduced_chi_squared)?;
        writeln!(f, "  R²: {:.6}", self.r_squared)?;
        write!(f, "  Iterations: {}", self.iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalibrationResult {
        CalibrationResult {
            format_version: CALIBRATION_FORMAT_VERSION,
            parameters: [("fwhm_0".to_string(), 0.1153), ("epsilon".to_string(), 0.00348)]
                .into_iter()
                .collect(),
            uncertainties: Some(
                [("fwhm_0".to_string(), 0.0012), ("epsilon".to_string(), 0.00002)]
                    .into_iter()
                    .collect(),
            ),
            chi_squared: 2071.5,
            reduced_chi_squared: 1.013,
            r_squared: 0.9991,
            intensity_scale: 1234.5,
            n_channels: 2048,
            iterations: 9,
            converged: true,
            message: "Converged: small cost reduction".to_string(),
            skipped_elements: vec!["Xx".to_string()],
            resolution_model_reference: Some(ResolutionModelReference::from_model(
                &ResolutionModel::default_sdd(),
                false,
            )),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let result = sample();
        let back = CalibrationResult::from_json(&result.to_json().unwrap()).unwrap();
        assert_eq!(back, result);

        let params = back.resolution_params().unwrap();
        assert_eq!(params.fwhm_0, 0.1153);
        assert_eq!(back.uncertainty("epsilon"), Some(0.00002));
        assert_eq!(back.uncertainty("scale_Fe"), None);
    }

    #[test]
    fn test_minimal_document() {
        // Optional fields may be absent
        let json = r#"{
            "parameters": {"fwhm_0": 0.12, "epsilon": 0.003},
            "chi_squared": 10.0,
            "reduced_chi_squared": 1.1,
            "r_squared": 0.99,
            "intensity_scale": 1.0,
            "n_channels": 100,
            "iterations": 4,
            "converged": false,
            "message": "Terminated: maximum iterations reached",
            "created_at": "2024-03-01T12:00:00Z"
        }"#;
        let result = CalibrationResult::from_json(json).unwrap();
        assert_eq!(result.format_version, CALIBRATION_FORMAT_VERSION);
        assert!(result.uncertainties.is_none());
        assert!(result.resolution_model_reference.is_none());
        assert!(!result.converged);
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut result = sample();
        result.format_version = CALIBRATION_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&result).unwrap();
        assert!(matches!(
            CalibrationResult::from_json(&json),
            Err(XrfError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_resolution_parameters() {
        let mut result = sample();
        result.parameters.remove("epsilon");
        assert!(result.resolution_params().is_err());
    }
}
