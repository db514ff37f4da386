//! Line-shape models shared by peak fitting and spectrum synthesis.

pub mod peak;

pub use peak::{
    fwhm_to_sigma, gaussian_density, lorentzian_density, pseudo_voigt_density, sigma_to_fwhm,
    tch_mixing, PeakShape, SIGMA_TO_FWHM,
};
