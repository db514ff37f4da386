//! Peak line shapes.
//!
//! Height-parameterised profiles with analytic derivatives for single-peak
//! fitting, and area-normalised profiles for building synthetic spectra.
//!
//! The Gaussian is defined as:
//! f(x) = amplitude * exp(-(x - center)² / (2 * sigma²))
//!
//! and its Full Width at Half Maximum is related to sigma by
//! FWHM = 2 * sqrt(2 * ln(2)) * sigma ≈ 2.3548 * sigma

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// FWHM / sigma for a Gaussian, `2·sqrt(2·ln 2)`.
pub const SIGMA_TO_FWHM: f64 = 2.354_820_045_030_949;

/// Lorentzian half-width at half maximum for a profile whose FWHM equals
/// `SIGMA_TO_FWHM · sigma`, per unit sigma.
const HWHM_PER_SIGMA: f64 = SIGMA_TO_FWHM / 2.0;

/// Convert a FWHM to a Gaussian sigma.
pub fn fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / SIGMA_TO_FWHM
}

/// Convert a Gaussian sigma to a FWHM.
pub fn sigma_to_fwhm(sigma: f64) -> f64 {
    sigma * SIGMA_TO_FWHM
}

/// Shape fitted to an isolated peak.
///
/// Both shapes are parameterised by `(amplitude, center, sigma)`. The
/// pseudo-Voigt shares the FWHM `2.3548·sigma` between its Gaussian and
/// Lorentzian parts and mixes them with a fixed fraction `eta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PeakShape {
    #[default]
    Gaussian,
    PseudoVoigt {
        eta: f64,
    },
}

impl PeakShape {
    /// Profile value at `x`.
    pub fn value(&self, x: f64, amplitude: f64, center: f64, sigma: f64) -> f64 {
        let d = x - center;
        let g = (-0.5 * (d / sigma).powi(2)).exp();
        match *self {
            PeakShape::Gaussian => amplitude * g,
            PeakShape::PseudoVoigt { eta } => {
                let gamma = HWHM_PER_SIGMA * sigma;
                let l = 1.0 / (1.0 + (d / gamma).powi(2));
                amplitude * ((1.0 - eta) * g + eta * l)
            }
        }
    }

    /// Partial derivatives with respect to amplitude, center and sigma.
    pub fn derivatives(&self, x: f64, amplitude: f64, center: f64, sigma: f64) -> [f64; 3] {
        let d = x - center;
        let s2 = sigma * sigma;
        let g = (-0.5 * d * d / s2).exp();
        let dg_dc = g * d / s2;
        let dg_ds = g * d * d / (s2 * sigma);

        match *self {
            PeakShape::Gaussian => [g, amplitude * dg_dc, amplitude * dg_ds],
            PeakShape::PseudoVoigt { eta } => {
                let k2 = HWHM_PER_SIGMA * HWHM_PER_SIGMA;
                let l = 1.0 / (1.0 + d * d / (k2 * s2));
                let dl_dc = l * l * 2.0 * d / (k2 * s2);
                let dl_ds = l * l * 2.0 * d * d / (k2 * s2 * sigma);
                [
                    (1.0 - eta) * g + eta * l,
                    amplitude * ((1.0 - eta) * dg_dc + eta * dl_dc),
                    amplitude * ((1.0 - eta) * dg_ds + eta * dl_ds),
                ]
            }
        }
    }

    /// Integral of the profile over all x.
    pub fn area(&self, amplitude: f64, sigma: f64) -> f64 {
        let gaussian = amplitude * sigma * (2.0 * PI).sqrt();
        match *self {
            PeakShape::Gaussian => gaussian,
            PeakShape::PseudoVoigt { eta } => {
                let lorentzian = amplitude * PI * HWHM_PER_SIGMA * sigma;
                (1.0 - eta) * gaussian + eta * lorentzian
            }
        }
    }
}

/// Unit-area Gaussian density with the given FWHM.
pub fn gaussian_density(x: f64, center: f64, fwhm: f64) -> f64 {
    let sigma = fwhm_to_sigma(fwhm);
    let z = (x - center) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
}

/// Unit-area Lorentzian density with the given FWHM.
pub fn lorentzian_density(x: f64, center: f64, fwhm: f64) -> f64 {
    let gamma = 0.5 * fwhm;
    gamma / (PI * ((x - center).powi(2) + gamma * gamma))
}

/// Unit-area pseudo-Voigt density: `(1−η)·G + η·L`, both with FWHM `fwhm`.
pub fn pseudo_voigt_density(x: f64, center: f64, fwhm: f64, eta: f64) -> f64 {
    (1.0 - eta) * gaussian_density(x, center, fwhm) + eta * lorentzian_density(x, center, fwhm)
}

/// Thompson-Cox-Hastings approximation of a Voigt profile.
///
/// Returns the total FWHM and the Lorentzian mixing fraction `eta` for a
/// Gaussian of width `fwhm_g` convolved with a Lorentzian of width `fwhm_l`.
pub fn tch_mixing(fwhm_g: f64, fwhm_l: f64) -> (f64, f64) {
    let g = fwhm_g.max(0.0);
    let l = fwhm_l.max(0.0);
    let f = (g.powi(5)
        + 2.69269 * g.powi(4) * l
        + 2.42843 * g.powi(3) * l.powi(2)
        + 4.47163 * g.powi(2) * l.powi(3)
        + 0.07842 * g * l.powi(4)
        + l.powi(5))
    .powf(0.2);
    if f <= 0.0 {
        return (0.0, 0.0);
    }
    let ratio = l / f;
    let eta = 1.36603 * ratio - 0.47719 * ratio.powi(2) + 0.11116 * ratio.powi(3);
    (f, eta.clamp(0.0, 1.0))
}
