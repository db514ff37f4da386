//! Continuum background estimation and subtraction.
//!
//! [`BackgroundModel`] estimates a smooth background under the characteristic
//! peaks of a raw spectrum with one of several methods and returns a new,
//! background-subtracted [`Spectrum`] floored at zero counts.

use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, XrfError};
use crate::lm::algorithm::cholesky_solve;
use crate::spectrum::Spectrum;

/// Fraction of channels averaged at each end by the default linear background.
const LINEAR_END_FRACTION: f64 = 0.05;

/// Background estimation method and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BackgroundMethod {
    /// Statistics-sensitive non-linear iterative peak clipping in LLS space.
    Snip {
        /// Largest clipping half-window, in channels.
        iterations: usize,
        /// Run the window from `iterations` down to 1 instead of 1 up to `iterations`.
        #[serde(default)]
        decreasing: bool,
    },

    /// Least-squares polynomial in energy.
    Polynomial {
        degree: usize,
        /// Energy ranges (keV) left out of the fit, typically known peaks.
        #[serde(default)]
        exclude: Vec<(f64, f64)>,
    },

    /// Straight line between the spectrum ends or two given channels.
    Linear {
        #[serde(default)]
        endpoints: Option<(usize, usize)>,
    },

    /// Moving-window percentile followed by Gaussian smoothing.
    Adaptive { window: usize, percentile: f64 },

    /// Asymmetric least squares smoothing.
    Als {
        lambda: f64,
        asymmetry: f64,
        iterations: usize,
    },

    /// No background.
    None,
}

impl Default for BackgroundMethod {
    fn default() -> Self {
        BackgroundMethod::Snip {
            iterations: 20,
            decreasing: false,
        }
    }
}

impl BackgroundMethod {
    /// Resolve a method by name with default parameters.
    ///
    /// Accepted names: `snip`, `polynomial`, `linear`, `adaptive`, `als`
    /// (or `asls`) and `none`, case-insensitive.
    pub fn from_name(name: &str) -> Result<Self> {
        let method = match name.trim().to_ascii_lowercase().as_str() {
            "snip" => BackgroundMethod::default(),
            "polynomial" | "poly" => BackgroundMethod::Polynomial {
                degree: 3,
                exclude: Vec::new(),
            },
            "linear" => BackgroundMethod::Linear { endpoints: None },
            "adaptive" => BackgroundMethod::Adaptive {
                window: 50,
                percentile: 10.0,
            },
            "als" | "asls" => BackgroundMethod::Als {
                lambda: 1e5,
                asymmetry: 0.01,
                iterations: 10,
            },
            "none" => BackgroundMethod::None,
            other => {
                return Err(XrfError::Configuration(format!(
                    "Unknown background method: '{}'",
                    other
                )))
            }
        };
        Ok(method)
    }

    /// Short method name.
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundMethod::Snip { .. } => "snip",
            BackgroundMethod::Polynomial { .. } => "polynomial",
            BackgroundMethod::Linear { .. } => "linear",
            BackgroundMethod::Adaptive { .. } => "adaptive",
            BackgroundMethod::Als { .. } => "als",
            BackgroundMethod::None => "none",
        }
    }
}

/// Background estimator bound to one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundModel {
    method: BackgroundMethod,
}

impl BackgroundModel {
    pub fn new(method: BackgroundMethod) -> Self {
        Self { method }
    }

    /// Model for a method name with default parameters.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(Self::new(BackgroundMethod::from_name(name)?))
    }

    pub fn method(&self) -> &BackgroundMethod {
        &self.method
    }

    /// Estimate the background, one value per channel.
    pub fn estimate(&self, spectrum: &Spectrum) -> Result<Array1<f64>> {
        estimate(spectrum.energy(), spectrum.counts(), &self.method)
    }

    /// Subtract the estimated background, flooring counts at zero.
    pub fn subtract(&self, spectrum: &Spectrum) -> Result<Spectrum> {
        let background = self.estimate(spectrum)?;
        let counts = spectrum
            .counts()
            .iter()
            .zip(background.iter())
            .map(|(c, b)| (c - b).max(0.0))
            .collect::<Array1<f64>>();
        debug!(
            "Subtracted {} background: {:.1} of {:.1} counts removed",
            self.method.name(),
            spectrum.total_counts() - counts.sum(),
            spectrum.total_counts()
        );
        spectrum.with_counts(counts)
    }
}

/// Estimate a background for raw arrays with the given method.
pub fn estimate(
    energy: &Array1<f64>,
    counts: &Array1<f64>,
    method: &BackgroundMethod,
) -> Result<Array1<f64>> {
    if energy.len() != counts.len() {
        return Err(XrfError::DimensionMismatch(format!(
            "{} energies but {} counts",
            energy.len(),
            counts.len()
        )));
    }

    match method {
        BackgroundMethod::Snip {
            iterations,
            decreasing,
        } => snip(counts, *iterations, *decreasing),
        BackgroundMethod::Polynomial { degree, exclude } => {
            polynomial(energy, counts, *degree, exclude)
        }
        BackgroundMethod::Linear { endpoints } => linear(energy, counts, *endpoints),
        BackgroundMethod::Adaptive { window, percentile } => {
            adaptive(counts, *window, *percentile)
        }
        BackgroundMethod::Als {
            lambda,
            asymmetry,
            iterations,
        } => als(counts, *lambda, *asymmetry, *iterations),
        BackgroundMethod::None => Ok(Array1::zeros(counts.len())),
    }
}

fn too_short(method: &str, have: usize, need: usize) -> XrfError {
    XrfError::Configuration(format!(
        "{} background needs at least {} points, window has {}",
        method, need, have
    ))
}

/// Log-log-square-root transform used by SNIP.
fn lls(x: f64) -> f64 {
    ((x.max(0.0) + 1.0).sqrt() + 1.0).ln().ln_1p()
}

fn lls_inverse(v: f64) -> f64 {
    ((v.exp() - 1.0).exp() - 1.0).powi(2) - 1.0
}

fn snip(counts: &Array1<f64>, iterations: usize, decreasing: bool) -> Result<Array1<f64>> {
    if iterations == 0 {
        return Err(XrfError::Configuration(
            "SNIP needs at least one iteration".to_string(),
        ));
    }
    let n = counts.len();
    if n < 2 * iterations + 1 {
        return Err(too_short("SNIP", n, 2 * iterations + 1));
    }

    let mut background = counts.mapv(lls);
    let windows: Vec<usize> = if decreasing {
        (1..=iterations).rev().collect()
    } else {
        (1..=iterations).collect()
    };

    for w in windows {
        let previous = background.clone();
        for i in w..n - w {
            let average = 0.5 * (previous[i - w] + previous[i + w]);
            if average < background[i] {
                background[i] = average;
            }
        }
    }

    Ok(background.mapv(|v| lls_inverse(v).max(0.0)))
}

fn polynomial(
    energy: &Array1<f64>,
    counts: &Array1<f64>,
    degree: usize,
    exclude: &[(f64, f64)],
) -> Result<Array1<f64>> {
    let keep: Vec<usize> = (0..energy.len())
        .filter(|&i| {
            !exclude
                .iter()
                .any(|&(lo, hi)| energy[i] >= lo && energy[i] <= hi)
        })
        .collect();
    if keep.len() < degree + 1 {
        return Err(too_short("Polynomial", keep.len(), degree + 1));
    }

    // Scaled abscissa keeps the normal equations well conditioned
    let first = energy[0];
    let last = energy[energy.len() - 1];
    let mid = 0.5 * (first + last);
    let half = (0.5 * (last - first)).max(f64::EPSILON);
    let scaled = |e: f64| (e - mid) / half;

    let m = degree + 1;
    let mut normal = ndarray::Array2::<f64>::zeros((m, m));
    let mut rhs = Array1::<f64>::zeros(m);
    for &i in &keep {
        let t = scaled(energy[i]);
        let powers: Vec<f64> = (0..m).map(|k| t.powi(k as i32)).collect();
        for a in 0..m {
            rhs[a] += powers[a] * counts[i];
            for b in 0..m {
                normal[[a, b]] += powers[a] * powers[b];
            }
        }
    }

    let coeffs = cholesky_solve(&normal, &rhs).ok_or_else(|| {
        XrfError::Configuration(format!(
            "Polynomial background of degree {} is singular on the retained points",
            degree
        ))
    })?;

    Ok(energy.mapv(|e| {
        let t = scaled(e);
        coeffs
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * t + c)
            .max(0.0)
    }))
}

fn linear(
    energy: &Array1<f64>,
    counts: &Array1<f64>,
    endpoints: Option<(usize, usize)>,
) -> Result<Array1<f64>> {
    let n = counts.len();
    if n < 2 {
        return Err(too_short("Linear", n, 2));
    }

    let ((e0, c0), (e1, c1)) = match endpoints {
        Some((start, end)) => {
            if start >= n || end >= n || start == end {
                return Err(XrfError::Configuration(format!(
                    "Invalid linear background endpoints ({}, {}) for {} channels",
                    start, end, n
                )));
            }
            ((energy[start], counts[start]), (energy[end], counts[end]))
        }
        None => {
            let k = ((n as f64 * LINEAR_END_FRACTION) as usize).clamp(1, n / 2);
            let mean = |range: std::ops::Range<usize>, data: &Array1<f64>| {
                let len = range.len() as f64;
                range.map(|i| data[i]).sum::<f64>() / len
            };
            (
                (mean(0..k, energy), mean(0..k, counts)),
                (mean(n - k..n, energy), mean(n - k..n, counts)),
            )
        }
    };

    let slope = (c1 - c0) / (e1 - e0);
    Ok(energy.mapv(|e| (c0 + slope * (e - e0)).max(0.0)))
}

/// Mirror an out-of-range index back into `0..n` (half-sample symmetric).
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut j = i.rem_euclid(period);
    if j >= n {
        j = period - 1 - j;
    }
    j as usize
}

fn percentile_of(sorted: &[f64], percentile: f64) -> f64 {
    let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn adaptive(counts: &Array1<f64>, window: usize, percentile: f64) -> Result<Array1<f64>> {
    if window == 0 || !(0.0..=100.0).contains(&percentile) {
        return Err(XrfError::Configuration(format!(
            "Adaptive background needs window > 0 and percentile in [0, 100], got {} and {}",
            window, percentile
        )));
    }
    let n = counts.len();
    if n < window {
        return Err(too_short("Adaptive", n, window));
    }

    let left = (window / 2) as isize;
    let mut buffer = Vec::with_capacity(window);
    let filtered: Vec<f64> = (0..n as isize)
        .map(|i| {
            buffer.clear();
            buffer.extend((0..window as isize).map(|k| counts[reflect(i - left + k, n)]));
            buffer.sort_by(|a, b| a.total_cmp(b));
            percentile_of(&buffer, percentile)
        })
        .collect();

    let sigma = window as f64 / 4.0;
    let radius = (4.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f64 / sigma).powi(2)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();

    Ok((0..n as isize)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * filtered[reflect(i + k as isize - radius, n)])
                .sum::<f64>()
                / norm
        })
        .collect())
}

fn als(counts: &Array1<f64>, lambda: f64, asymmetry: f64, iterations: usize) -> Result<Array1<f64>> {
    if !(lambda > 0.0) || !(asymmetry > 0.0 && asymmetry < 1.0) || iterations == 0 {
        return Err(XrfError::Configuration(format!(
            "ALS background needs lambda > 0, 0 < p < 1 and iterations > 0, got {}, {}, {}",
            lambda, asymmetry, iterations
        )));
    }
    let n = counts.len();
    if n < 3 {
        return Err(too_short("ALS", n, 3));
    }

    // lambda * D^T D for the second-difference operator, as three bands
    let mut penalty = vec![[0.0f64; 3]; n];
    let stencil = [1.0, -2.0, 1.0];
    for k in 0..n - 2 {
        for a in 0..3 {
            for b in 0..=a {
                penalty[k + a][a - b] += lambda * stencil[a] * stencil[b];
            }
        }
    }

    let mut weights = vec![1.0; n];
    let mut z = counts.clone();
    for _ in 0..iterations {
        let mut bands = penalty.clone();
        for i in 0..n {
            bands[i][0] += weights[i];
        }
        let rhs: Vec<f64> = (0..n).map(|i| weights[i] * counts[i]).collect();
        z = Array1::from(banded_cholesky_solve(&bands, &rhs).ok_or_else(|| {
            XrfError::SingularMatrix("ALS system is not positive definite".to_string())
        })?);

        for i in 0..n {
            weights[i] = if counts[i] > z[i] {
                asymmetry
            } else {
                1.0 - asymmetry
            };
        }
    }

    Ok(z.mapv(|v| v.max(0.0)))
}

/// Solve a symmetric positive definite pentadiagonal system.
///
/// `bands[i][d]` holds `A[i][i - d]` for `d` in 0..3.
fn banded_cholesky_solve(bands: &[[f64; 3]], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = bands.len();
    let mut l = vec![[0.0f64; 3]; n];

    for i in 0..n {
        for d in (0..3).rev() {
            if d > i {
                continue;
            }
            let j = i - d;
            let mut sum = bands[i][d];
            // k runs over columns shared by rows i and j inside the band
            for k in i.saturating_sub(2)..j {
                if j - k <= 2 {
                    sum -= l[i][i - k] * l[j][j - k];
                }
            }
            if d == 0 {
                if sum <= 0.0 {
                    return None;
                }
                l[i][0] = sum.sqrt();
            } else {
                l[i][d] = sum / l[j][0];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = rhs[i];
        for d in 1..3 {
            if d <= i {
                sum -= l[i][d] * y[i - d];
            }
        }
        y[i] = sum / l[i][0];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for d in 1..3 {
            if i + d < n {
                sum -= l[i + d][d] * x[i + d];
            }
        }
        x[i] = sum / l[i][0];
    }

    Some(x)
}
