//! Measured or synthetic XRF spectra.
//!
//! A [`Spectrum`] is an immutable pair of energy (keV) and count arrays with
//! acquisition times and free-form metadata. Every transformation returns a new
//! value.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, XrfError};

/// A scalar or string metadata entry (tube element, excitation voltage, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Flag(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

/// Metadata mapping carried by a spectrum.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Normalization applied by [`Spectrum::normalized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    LiveTime,
    TotalCounts,
    Max,
}

/// An energy-calibrated spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    energy: Array1<f64>,
    counts: Array1<f64>,
    live_time: f64,
    real_time: f64,
    metadata: Metadata,
}

impl Spectrum {
    /// Build a spectrum, validating the arrays.
    ///
    /// Energies must be strictly increasing, counts finite and non-negative,
    /// and both arrays of the same non-zero length.
    pub fn new(
        energy: Array1<f64>,
        counts: Array1<f64>,
        live_time: f64,
        real_time: f64,
        metadata: Metadata,
    ) -> Result<Self> {
        if energy.is_empty() {
            return Err(XrfError::InvalidInput("Spectrum has no channels".to_string()));
        }
        if energy.len() != counts.len() {
            return Err(XrfError::DimensionMismatch(format!(
                "{} energies but {} counts",
                energy.len(),
                counts.len()
            )));
        }
        if energy.iter().any(|e| !e.is_finite()) {
            return Err(XrfError::InvalidInput("Energy axis contains non-finite values".to_string()));
        }
        if energy.windows(2).into_iter().any(|w| w[1] <= w[0]) {
            return Err(XrfError::InvalidInput(
                "Energy axis must be strictly increasing".to_string(),
            ));
        }
        if let Some(bad) = counts.iter().find(|c| !c.is_finite() || **c < 0.0) {
            return Err(XrfError::InvalidInput(format!(
                "Counts must be finite and non-negative, found {}",
                bad
            )));
        }
        if !(live_time >= 0.0 && real_time >= 0.0) {
            return Err(XrfError::InvalidInput(
                "Acquisition times must be non-negative".to_string(),
            ));
        }

        Ok(Self {
            energy,
            counts,
            live_time,
            real_time,
            metadata,
        })
    }

    /// Spectrum with unit acquisition times and no metadata.
    pub fn from_arrays(energy: Array1<f64>, counts: Array1<f64>) -> Result<Self> {
        Self::new(energy, counts, 1.0, 1.0, Metadata::new())
    }

    /// A new spectrum on the same energy axis with different counts.
    pub fn with_counts(&self, counts: Array1<f64>) -> Result<Self> {
        Self::new(
            self.energy.clone(),
            counts,
            self.live_time,
            self.real_time,
            self.metadata.clone(),
        )
    }

    /// A copy with one metadata entry added or replaced.
    pub fn with_metadata(&self, key: &str, value: impl Into<MetadataValue>) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(key.to_string(), value.into());
        copy
    }

    pub fn energy(&self) -> &Array1<f64> {
        &self.energy
    }

    pub fn counts(&self) -> &Array1<f64> {
        &self.counts
    }

    pub fn live_time(&self) -> f64 {
        self.live_time
    }

    pub fn real_time(&self) -> f64 {
        self.real_time
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.energy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }

    pub fn total_counts(&self) -> f64 {
        self.counts.sum()
    }

    pub fn max_counts(&self) -> f64 {
        self.counts.iter().cloned().fold(0.0, f64::max)
    }

    /// First and last energy.
    pub fn energy_range(&self) -> (f64, f64) {
        (self.energy[0], self.energy[self.energy.len() - 1])
    }

    /// Width of channel `i`, from the spacing of its neighbours.
    pub fn channel_width(&self, i: usize) -> f64 {
        channel_width(&self.energy, i)
    }

    /// Index range `[start, end)` of channels with `lo <= E <= hi`.
    pub fn roi_indices(&self, lo: f64, hi: f64) -> (usize, usize) {
        let energy = self.energy.as_slice_memory_order();
        match energy {
            Some(e) => (e.partition_point(|&x| x < lo), e.partition_point(|&x| x <= hi)),
            None => {
                let start = self.energy.iter().take_while(|&&x| x < lo).count();
                let end = self.energy.iter().take_while(|&&x| x <= hi).count();
                (start, end)
            }
        }
    }

    /// Energies and counts inside `[lo, hi]`.
    pub fn roi(&self, lo: f64, hi: f64) -> (Array1<f64>, Array1<f64>) {
        let (start, end) = self.roi_indices(lo, hi);
        let end = end.max(start);
        (
            self.energy.slice(ndarray::s![start..end]).to_owned(),
            self.counts.slice(ndarray::s![start..end]).to_owned(),
        )
    }

    /// Sum of counts inside `[lo, hi]`.
    pub fn roi_sum(&self, lo: f64, hi: f64) -> f64 {
        self.roi(lo, hi).1.sum()
    }

    /// Divide counts by live time, total counts or the maximum.
    pub fn normalized(&self, method: Normalization) -> Result<Self> {
        let factor = match method {
            Normalization::LiveTime => self.live_time,
            Normalization::TotalCounts => self.total_counts(),
            Normalization::Max => self.max_counts(),
        };
        if factor <= 0.0 {
            return Err(XrfError::InvalidInput(format!(
                "Cannot normalize by {:?}: factor is zero",
                method
            )));
        }
        self.with_counts(self.counts.mapv(|c| c / factor))
    }
}

/// Width of channel `i` on an increasing energy grid.
pub(crate) fn channel_width(energy: &Array1<f64>, i: usize) -> f64 {
    let n = energy.len();
    if n < 2 {
        return 1.0;
    }
    let lo = if i == 0 { 0 } else { i - 1 };
    let hi = if i + 1 >= n { n - 1 } else { i + 1 };
    (energy[hi] - energy[lo]) / (hi - lo) as f64
}
