//! Synthetic spectra from a composition.
//!
//! Work is split in two phases. [`ForwardSpectrumCalculator::prepare`] queries
//! the oracle once per element and produces a [`LineSet`] of discrete line
//! intensities. [`ForwardSpectrumCalculator::render`] broadens a line set onto
//! an energy grid for a given detector resolution and is cheap enough to run
//! on every optimizer iteration.

use log::{debug, info, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::excitation::{ExcitationSource, ExcitationSpectrum};
use super::oracle::{PhysicsOracle, Shell};
use crate::error::{Result, XrfError};
use crate::models::peak::{fwhm_to_sigma, gaussian_density, pseudo_voigt_density, tch_mixing};
use crate::resolution::ResolutionParams;
use crate::spectrum::{channel_width, Spectrum};

/// Element symbol to mass fraction.
pub type Composition = BTreeMap<String, f64>;

/// How line families are chosen for an element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LineFamilyPolicy {
    /// A family is requested when its shell edge lies below the excitation energy.
    AbsorptionEdge,
    /// Legacy fixed cutoffs: K always, L from `l_min_z`, M from `m_min_z`.
    AtomicNumberCutoff { l_min_z: u32, m_min_z: u32 },
}

impl Default for LineFamilyPolicy {
    fn default() -> Self {
        LineFamilyPolicy::AbsorptionEdge
    }
}

impl LineFamilyPolicy {
    fn shells(&self, oracle: &dyn PhysicsOracle, element: &str, z: u32, excitation: f64) -> Vec<Shell> {
        match *self {
            LineFamilyPolicy::AbsorptionEdge => Shell::ALL
                .iter()
                .copied()
                .filter(|&s| {
                    oracle
                        .absorption_edge(element, s)
                        .map_or(false, |edge| edge < excitation)
                })
                .collect(),
            LineFamilyPolicy::AtomicNumberCutoff { l_min_z, m_min_z } => {
                let mut shells = vec![Shell::K];
                if z >= l_min_z {
                    shells.push(Shell::L);
                }
                if z >= m_min_z {
                    shells.push(Shell::M);
                }
                shells
            }
        }
    }
}

/// Speed/accuracy trade-off of [`ForwardSpectrumCalculator::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AccuracyMode {
    /// Primary fluorescence with `ForwardModelConfig::continuum_points` continuum energies.
    Fast,
    /// Adds secondary (and optionally tertiary) enhancement on a finer continuum.
    HighAccuracy { continuum_points: usize, tertiary: bool },
}

impl Default for AccuracyMode {
    fn default() -> Self {
        AccuracyMode::Fast
    }
}

/// Energy axis used by [`ForwardSpectrumCalculator::calculate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyGrid {
    pub start: f64,
    pub step: f64,
    pub channels: usize,
}

impl Default for EnergyGrid {
    fn default() -> Self {
        Self {
            start: 0.0,
            step: 0.01,
            channels: 2048,
        }
    }
}

impl EnergyGrid {
    pub fn energies(&self) -> Array1<f64> {
        Array1::from_iter((0..self.channels).map(|i| self.start + self.step * i as f64))
    }
}

/// Configuration of the forward model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardModelConfig {
    /// Tube-scatter intensity as a fraction of total fluorescence
    pub scatter_fraction: f64,
    /// Share of the excitation weight carried by the tube's characteristic lines
    pub tube_line_fraction: f64,
    /// Natural width (keV) of heavy-element L lines
    pub l_line_natural_width: f64,
    /// Lowest Z whose L lines get a Voigt profile
    pub heavy_l_line_min_z: u32,
    /// Profiles are truncated at this many Gaussian sigmas
    pub profile_cutoff_sigmas: f64,
    /// Continuum energies in fast mode
    pub continuum_points: usize,
    pub line_policy: LineFamilyPolicy,
    pub accuracy: AccuracyMode,
    /// Incidence angle (degrees)
    pub incident_angle: f64,
    /// Take-off angle (degrees)
    pub takeoff_angle: f64,
    /// Secondary fluorescence strength per unit concentration
    pub secondary_strength: f64,
    /// Cap on the total relative enhancement
    pub max_enhancement: f64,
    pub grid: EnergyGrid,
}

impl Default for ForwardModelConfig {
    fn default() -> Self {
        Self {
            scatter_fraction: 0.02,
            tube_line_fraction: 0.5,
            l_line_natural_width: 0.008,
            heavy_l_line_min_z: 56,
            profile_cutoff_sigmas: 6.0,
            continuum_points: 20,
            line_policy: LineFamilyPolicy::AbsorptionEdge,
            accuracy: AccuracyMode::Fast,
            incident_angle: 45.0,
            takeoff_angle: 45.0,
            secondary_strength: 0.3,
            max_enhancement: 0.5,
            grid: EnergyGrid::default(),
        }
    }
}

/// What to simulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Mass fractions; normalised before use
    pub composition: Composition,
    /// Tube voltage (kV), the highest excitation energy (keV)
    pub excitation_energy: f64,
    pub tube_element: String,
    /// Sample thickness (cm)
    pub thickness: f64,
    /// Sample density (g/cm³)
    pub density: f64,
}

impl ForwardRequest {
    pub fn new(composition: Composition, excitation_energy: f64, tube_element: &str) -> Self {
        Self {
            composition,
            excitation_energy,
            tube_element: tube_element.to_string(),
            thickness: 0.1,
            density: 1.0,
        }
    }

    /// Convenience constructor from `(symbol, fraction)` pairs.
    pub fn from_pairs(pairs: &[(&str, f64)], excitation_energy: f64, tube_element: &str) -> Self {
        let composition = pairs.iter().map(|&(el, c)| (el.to_string(), c)).collect();
        Self::new(composition, excitation_energy, tube_element)
    }

    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    pub fn with_density(mut self, density: f64) -> Self {
        self.density = density;
        self
    }
}

/// Cooperative cancellation flag shared with a running calculation.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sample fluorescence or scattered tube radiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineOrigin {
    Fluorescence,
    TubeScatter,
}

/// A discrete line ready to be broadened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralLine {
    pub element: String,
    pub line: String,
    pub shell: Shell,
    pub energy: f64,
    pub intensity: f64,
    pub origin: LineOrigin,
    /// Lorentzian width (keV); zero for a pure Gaussian
    pub natural_width: f64,
}

/// An element left out of a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedElement {
    pub element: String,
    pub reason: String,
}

/// Output of [`ForwardSpectrumCalculator::prepare`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineSet {
    pub lines: Vec<SpectralLine>,
    pub skipped: Vec<SkippedElement>,
}

impl LineSet {
    pub fn fluorescence(&self) -> impl Iterator<Item = &SpectralLine> {
        self.lines.iter().filter(|l| l.origin == LineOrigin::Fluorescence)
    }

    pub fn scatter(&self) -> impl Iterator<Item = &SpectralLine> {
        self.lines.iter().filter(|l| l.origin == LineOrigin::TubeScatter)
    }

    /// Elements contributing fluorescence lines, sorted.
    pub fn elements(&self) -> Vec<String> {
        let mut elements: Vec<String> = self.fluorescence().map(|l| l.element.clone()).collect();
        elements.dedup();
        elements
    }

    pub fn total_fluorescence(&self) -> f64 {
        self.fluorescence().map(|l| l.intensity).sum()
    }

    pub fn is_skipped(&self, element: &str) -> bool {
        self.skipped.iter().any(|s| s.element == element)
    }
}

/// Primary line before enhancement is applied.
struct PrimaryLine {
    line: SpectralLine,
    edge: Option<f64>,
}

/// Forward model over an injected physics oracle.
#[derive(Clone)]
pub struct ForwardSpectrumCalculator {
    oracle: Arc<dyn PhysicsOracle + Send + Sync>,
    config: ForwardModelConfig,
}

impl ForwardSpectrumCalculator {
    pub fn new(oracle: Arc<dyn PhysicsOracle + Send + Sync>) -> Self {
        Self {
            oracle,
            config: ForwardModelConfig::default(),
        }
    }

    pub fn with_config(oracle: Arc<dyn PhysicsOracle + Send + Sync>, config: ForwardModelConfig) -> Self {
        Self { oracle, config }
    }

    pub fn with_scatter_fraction(mut self, fraction: f64) -> Self {
        self.config.scatter_fraction = fraction;
        self
    }

    pub fn with_line_policy(mut self, policy: LineFamilyPolicy) -> Self {
        self.config.line_policy = policy;
        self
    }

    pub fn with_accuracy(mut self, accuracy: AccuracyMode) -> Self {
        self.config.accuracy = accuracy;
        self
    }

    pub fn with_grid(mut self, grid: EnergyGrid) -> Self {
        self.config.grid = grid;
        self
    }

    pub fn config(&self) -> &ForwardModelConfig {
        &self.config
    }

    pub fn oracle(&self) -> &(dyn PhysicsOracle + Send + Sync) {
        self.oracle.as_ref()
    }

    /// Synthetic spectrum on the configured default grid.
    pub fn calculate(&self, request: &ForwardRequest, resolution: ResolutionParams) -> Result<Spectrum> {
        self.calculate_on(request, resolution, &self.config.grid.energies())
    }

    /// Synthetic spectrum on a caller-supplied energy axis.
    pub fn calculate_on(
        &self,
        request: &ForwardRequest,
        resolution: ResolutionParams,
        energies: &Array1<f64>,
    ) -> Result<Spectrum> {
        let lines = self.prepare(request)?;
        let counts = self.render(&lines, energies, resolution, |_| 1.0)?;
        Spectrum::from_arrays(energies.clone(), counts)
    }

    /// Line intensities for `request`.
    pub fn prepare(&self, request: &ForwardRequest) -> Result<LineSet> {
        self.prepare_with_cancel(request, &CancellationToken::new())
    }

    /// As [`prepare`](Self::prepare), checking `token` between elements.
    pub fn prepare_with_cancel(&self, request: &ForwardRequest, token: &CancellationToken) -> Result<LineSet> {
        let composition = validate_request(request)?;
        let oracle = self.oracle.as_ref();
        let e0 = request.excitation_energy;

        let (continuum_points, enhance, tertiary) = match self.config.accuracy {
            AccuracyMode::Fast => (self.config.continuum_points, false, false),
            AccuracyMode::HighAccuracy {
                continuum_points,
                tertiary,
            } => (continuum_points, true, tertiary),
        };
        let excitation = ExcitationSpectrum::build(
            oracle,
            &request.tube_element,
            e0,
            continuum_points,
            self.config.tube_line_fraction,
        );
        if oracle.atomic_number(&request.tube_element).is_none() {
            warn!(
                "Tube element {} unknown to the physics oracle, continuum only",
                request.tube_element
            );
        }

        let mut skipped = Vec::new();
        let mut primary: BTreeMap<String, Vec<PrimaryLine>> = BTreeMap::new();

        for (element, &fraction) in &composition {
            if token.is_cancelled() {
                return Err(XrfError::Cancelled(format!(
                    "forward calculation stopped before {}",
                    element
                )));
            }
            if fraction <= 0.0 {
                continue;
            }
            let Some(z) = oracle.atomic_number(element) else {
                warn!("Skipping {}: unknown to the physics oracle", element);
                skipped.push(SkippedElement {
                    element: element.clone(),
                    reason: "unknown element".to_string(),
                });
                continue;
            };

            let shells = self.config.line_policy.shells(oracle, element, z, e0);
            let mut lines = Vec::new();
            for entry in oracle.emission_lines(element, &shells, e0) {
                if !(entry.relative_intensity > 0.0) || entry.energy <= 0.0 || entry.energy >= e0 {
                    continue;
                }
                let excitation_factor = excitation.excitation_factor(oracle, element, entry.shell);
                let absorption = self.absorption_factor(&composition, request, excitation.mean_energy(), entry.energy);
                let intensity = fraction * entry.relative_intensity * excitation_factor * absorption;
                if !(intensity > 0.0) {
                    continue;
                }
                lines.push(PrimaryLine {
                    edge: oracle.absorption_edge(element, entry.shell),
                    line: SpectralLine {
                        element: element.clone(),
                        line: entry.line,
                        shell: entry.shell,
                        energy: entry.energy,
                        intensity,
                        origin: LineOrigin::Fluorescence,
                        natural_width: self.natural_width(z, entry.shell),
                    },
                });
            }

            if lines.is_empty() {
                warn!("Skipping {}: no emission lines below {} keV", element, e0);
                skipped.push(SkippedElement {
                    element: element.clone(),
                    reason: format!("no emission lines excited at {} keV", e0),
                });
                continue;
            }
            primary.insert(element.clone(), lines);
        }

        let enhancement = if enhance {
            self.enhancements(&composition, &primary, tertiary, token)?
        } else {
            BTreeMap::new()
        };

        let mut lines: Vec<SpectralLine> = Vec::new();
        for (element, element_lines) in primary {
            for (i, p) in element_lines.into_iter().enumerate() {
                let factor = 1.0 + enhancement.get(&(element.clone(), i)).copied().unwrap_or(0.0);
                let mut line = p.line;
                line.intensity *= factor;
                lines.push(line);
            }
        }

        let total: f64 = lines.iter().map(|l| l.intensity).sum();
        lines.extend(self.scatter_lines(oracle, request, &excitation, total));

        info!(
            "Prepared {} lines for {} elements ({} skipped)",
            lines.len(),
            composition.len() - skipped.len(),
            skipped.len()
        );
        Ok(LineSet { lines, skipped })
    }

    /// Broaden `lines` onto `energies`, scaling each line by `weight(line)`.
    ///
    /// Each line contributes its intensity times an area-normalised profile
    /// times the channel width, so the channel sum approximates the area.
    pub fn render<F>(
        &self,
        lines: &LineSet,
        energies: &Array1<f64>,
        resolution: ResolutionParams,
        weight: F,
    ) -> Result<Array1<f64>>
    where
        F: Fn(&SpectralLine) -> f64,
    {
        if energies.is_empty() {
            return Err(XrfError::InvalidInput("Empty energy grid".to_string()));
        }
        if energies.windows(2).into_iter().any(|w| w[1] <= w[0]) {
            return Err(XrfError::InvalidInput(
                "Energy grid must be strictly increasing".to_string(),
            ));
        }

        let mut counts = Array1::<f64>::zeros(energies.len());
        let axis = energies.as_slice();
        for line in &lines.lines {
            let amplitude = line.intensity * weight(line);
            if !(amplitude > 0.0) {
                continue;
            }
            let fwhm_g = resolution.fwhm(line.energy);
            if !(fwhm_g > 0.0) {
                return Err(XrfError::InvalidInput(format!(
                    "Non-positive FWHM {} at {} keV",
                    fwhm_g, line.energy
                )));
            }
            let (fwhm, eta) = if line.natural_width > 0.0 {
                tch_mixing(fwhm_g, line.natural_width)
            } else {
                (fwhm_g, 0.0)
            };

            let half = self.config.profile_cutoff_sigmas * fwhm_to_sigma(fwhm);
            let (lo, hi) = match axis {
                Some(a) => (
                    a.partition_point(|&e| e < line.energy - half),
                    a.partition_point(|&e| e <= line.energy + half),
                ),
                None => (0, energies.len()),
            };
            for i in lo..hi {
                let e = energies[i];
                if (e - line.energy).abs() > half {
                    continue;
                }
                let density = if eta > 0.0 {
                    pseudo_voigt_density(e, line.energy, fwhm, eta)
                } else {
                    gaussian_density(e, line.energy, fwhm)
                };
                counts[i] += amplitude * density * channel_width(energies, i);
            }
        }
        debug!("Rendered {} lines onto {} channels", lines.lines.len(), energies.len());
        Ok(counts)
    }

    fn natural_width(&self, z: u32, shell: Shell) -> f64 {
        if shell == Shell::L && z >= self.config.heavy_l_line_min_z {
            self.config.l_line_natural_width
        } else {
            0.0
        }
    }

    /// Self-absorption of a line at `line_energy` excited at `incident_energy`.
    ///
    /// `(1 − exp(−χρt))/χ` with `χ = μ_in/sinψ₁ + μ_out/sinψ₂` when every
    /// element has attenuation data, otherwise the thin-film limit `ρt`.
    fn absorption_factor(
        &self,
        composition: &Composition,
        request: &ForwardRequest,
        incident_energy: f64,
        line_energy: f64,
    ) -> f64 {
        let rho_t = request.density * request.thickness;
        let mu = |energy: f64| -> Option<f64> {
            composition
                .iter()
                .map(|(el, &c)| self.oracle.mass_attenuation(el, energy).map(|m| c * m))
                .sum()
        };
        let (Some(mu_in), Some(mu_out)) = (mu(incident_energy), mu(line_energy)) else {
            return rho_t;
        };
        let sin_in = self.config.incident_angle.to_radians().sin();
        let sin_out = self.config.takeoff_angle.to_radians().sin();
        let chi = mu_in / sin_in + mu_out / sin_out;
        if !(chi > 0.0) || !chi.is_finite() {
            return rho_t;
        }
        (1.0 - (-chi * rho_t).exp()) / chi
    }

    /// Relative enhancement of every primary line, keyed by (element, index).
    ///
    /// Secondary: `Σ_j c_j·r_j·min((E_j − edge)/edge, 1)·strength` over lines of
    /// other elements above the edge, `r_j` being line j's share of its
    /// element's intensity. Tertiary adds the secondary term weighted by the
    /// enhancement of the exciting line itself.
    fn enhancements(
        &self,
        composition: &Composition,
        primary: &BTreeMap<String, Vec<PrimaryLine>>,
        tertiary: bool,
        token: &CancellationToken,
    ) -> Result<BTreeMap<(String, usize), f64>> {
        let strength = self.config.secondary_strength;
        let shares: BTreeMap<&str, f64> = primary
            .iter()
            .map(|(el, lines)| (el.as_str(), lines.iter().map(|p| p.line.intensity).sum()))
            .collect();

        let secondary_of = |element: &str, edge: f64| -> f64 {
            primary
                .iter()
                .filter(|(other, _)| other.as_str() != element)
                .map(|(other, lines)| {
                    let c = composition.get(other).copied().unwrap_or(0.0);
                    let total = shares.get(other.as_str()).copied().unwrap_or(0.0);
                    if total <= 0.0 {
                        return 0.0;
                    }
                    lines
                        .iter()
                        .filter(|p| p.line.energy > edge)
                        .map(|p| {
                            let gain = ((p.line.energy - edge) / edge).min(1.0);
                            c * (p.line.intensity / total) * gain * strength
                        })
                        .sum::<f64>()
                })
                .sum()
        };

        let mut secondary: BTreeMap<(String, usize), f64> = BTreeMap::new();
        for (element, lines) in primary {
            if token.is_cancelled() {
                return Err(XrfError::Cancelled(format!(
                    "secondary fluorescence stopped at {}",
                    element
                )));
            }
            for (i, p) in lines.iter().enumerate() {
                let value = p.edge.map_or(0.0, |edge| secondary_of(element, edge));
                secondary.insert((element.clone(), i), value);
            }
        }

        if !tertiary {
            return Ok(cap(secondary, self.config.max_enhancement));
        }

        let mut total = secondary.clone();
        for (element, lines) in primary {
            if token.is_cancelled() {
                return Err(XrfError::Cancelled(format!(
                    "tertiary fluorescence stopped at {}",
                    element
                )));
            }
            for (i, p) in lines.iter().enumerate() {
                let Some(edge) = p.edge else { continue };
                let extra: f64 = primary
                    .iter()
                    .filter(|(other, _)| *other != element)
                    .map(|(other, other_lines)| {
                        let c = composition.get(other).copied().unwrap_or(0.0);
                        let share = shares.get(other.as_str()).copied().unwrap_or(0.0);
                        if share <= 0.0 {
                            return 0.0;
                        }
                        other_lines
                            .iter()
                            .enumerate()
                            .filter(|(_, q)| q.line.energy > edge)
                            .map(|(j, q)| {
                                let gain = ((q.line.energy - edge) / edge).min(1.0);
                                let e_j = secondary.get(&(other.clone(), j)).copied().unwrap_or(0.0);
                                c * (q.line.intensity / share) * gain * strength * e_j
                            })
                            .sum::<f64>()
                    })
                    .sum();
                if let Some(v) = total.get_mut(&(element.clone(), i)) {
                    *v += extra;
                }
            }
        }
        Ok(cap(total, self.config.max_enhancement))
    }

    fn scatter_lines(
        &self,
        oracle: &dyn PhysicsOracle,
        request: &ForwardRequest,
        excitation: &ExcitationSpectrum,
        total_fluorescence: f64,
    ) -> Vec<SpectralLine> {
        let tube: Vec<_> = excitation.tube_lines().collect();
        let tube_weight: f64 = tube.iter().map(|p| p.weight).sum();
        if tube_weight <= 0.0 || total_fluorescence <= 0.0 {
            return Vec::new();
        }
        let budget = self.config.scatter_fraction * total_fluorescence;
        let z = oracle.atomic_number(&request.tube_element).unwrap_or(0);

        tube.into_iter()
            .filter_map(|p| match &p.source {
                ExcitationSource::TubeLine { line, shell } => Some(SpectralLine {
                    element: request.tube_element.clone(),
                    line: line.clone(),
                    shell: *shell,
                    energy: p.energy,
                    intensity: budget * p.weight / tube_weight,
                    origin: LineOrigin::TubeScatter,
                    natural_width: self.natural_width(z, *shell),
                }),
                ExcitationSource::Continuum => None,
            })
            .collect()
    }
}

fn cap(values: BTreeMap<(String, usize), f64>, max: f64) -> BTreeMap<(String, usize), f64> {
    values.into_iter().map(|(k, v)| (k, v.clamp(0.0, max))).collect()
}

/// Validate and normalise the composition.
fn validate_request(request: &ForwardRequest) -> Result<Composition> {
    if !(request.excitation_energy > 0.0) || !request.excitation_energy.is_finite() {
        return Err(XrfError::Configuration(format!(
            "Excitation energy must be positive, got {}",
            request.excitation_energy
        )));
    }
    if !(request.thickness > 0.0) || !(request.density > 0.0) {
        return Err(XrfError::Configuration(
            "Sample thickness and density must be positive".to_string(),
        ));
    }
    if request.composition.is_empty() {
        return Err(XrfError::InvalidInput("Composition is empty".to_string()));
    }
    if let Some((el, c)) = request
        .composition
        .iter()
        .find(|(_, c)| !c.is_finite() || **c < 0.0)
    {
        return Err(XrfError::InvalidInput(format!(
            "Invalid mass fraction {} for {}",
            c, el
        )));
    }
    let total: f64 = request.composition.values().sum();
    if total <= 0.0 {
        return Err(XrfError::InvalidInput(
            "Composition mass fractions sum to zero".to_string(),
        ));
    }
    Ok(request
        .composition
        .iter()
        .map(|(el, c)| (el.clone(), c / total))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::oracle::LineTable;
    use approx::assert_relative_eq;

    fn calculator() -> ForwardSpectrumCalculator {
        ForwardSpectrumCalculator::new(Arc::new(LineTable::builtin()))
    }

    fn steel() -> ForwardRequest {
        ForwardRequest::from_pairs(&[("Fe", 0.7), ("Cr", 0.2), ("Ni", 0.1)], 40.0, "Rh")
    }

    #[test]
    fn test_prepare_steel() {
        let lines = calculator().prepare(&steel()).unwrap();
        assert!(lines.skipped.is_empty());
        assert_eq!(lines.elements(), vec!["Cr", "Fe", "Ni"]);
        assert!(lines.lines.iter().all(|l| l.intensity > 0.0 && l.energy < 40.0));

        // Fe Ka1 dominates
        let strongest = lines
            .fluorescence()
            .max_by(|a, b| a.intensity.partial_cmp(&b.intensity).unwrap())
            .unwrap();
        assert_eq!(strongest.element, "Fe");
        assert_eq!(strongest.line, "Ka1");

        let scatter: f64 = lines.scatter().map(|l| l.intensity).sum();
        assert_relative_eq!(scatter, 0.02 * lines.total_fluorescence(), epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_element_is_skipped() {
        let request = ForwardRequest::from_pairs(&[("Fe", 0.5), ("Xx", 0.5)], 40.0, "Rh");
        let lines = calculator().prepare(&request).unwrap();
        assert!(lines.is_skipped("Xx"));
        assert_eq!(lines.elements(), vec!["Fe"]);
    }

    #[test]
    fn test_edge_policy_excludes_unexcited_families() {
        // Zr K edge (18.0 keV) is above a 15 kV tube; only Zr L remains
        let request = ForwardRequest::from_pairs(&[("Zr", 1.0)], 15.0, "Rh");
        let lines = calculator().prepare(&request).unwrap();
        assert!(lines.fluorescence().all(|l| l.shell == Shell::L));
        assert!(lines.fluorescence().count() > 0);

        // Legacy cutoff never requests L lines below l_min_z
        let legacy = calculator().with_line_policy(LineFamilyPolicy::AtomicNumberCutoff {
            l_min_z: 50,
            m_min_z: 70,
        });
        let lines = legacy.prepare(&request).unwrap();
        assert!(lines.is_skipped("Zr"));
    }

    #[test]
    fn test_heavy_l_lines_are_voigt() {
        let request = ForwardRequest::from_pairs(&[("Pb", 1.0)], 40.0, "Rh");
        let lines = calculator().prepare(&request).unwrap();
        assert!(lines
            .fluorescence()
            .filter(|l| l.shell == Shell::L)
            .all(|l| l.natural_width == 0.008));
        assert!(lines
            .fluorescence()
            .filter(|l| l.shell == Shell::M)
            .all(|l| l.natural_width == 0.0));
    }

    #[test]
    fn test_render_preserves_area() {
        let calc = calculator();
        let lines = LineSet {
            lines: vec![SpectralLine {
                element: "Fe".to_string(),
                line: "Ka1".to_string(),
                shell: Shell::K,
                energy: 6.4,
                intensity: 1000.0,
                origin: LineOrigin::Fluorescence,
                natural_width: 0.0,
            }],
            skipped: Vec::new(),
        };
        let energies = calc.config().grid.energies();
        let counts = calc
            .render(&lines, &energies, ResolutionParams::new(0.12, 0.0005), |_| 1.0)
            .unwrap();
        assert_relative_eq!(counts.sum(), 1000.0, max_relative = 1e-4);

        let doubled = calc
            .render(&lines, &energies, ResolutionParams::new(0.12, 0.0005), |_| 2.0)
            .unwrap();
        assert_relative_eq!(doubled.sum(), 2.0 * counts.sum(), max_relative = 1e-12);
    }

    #[test]
    fn test_calculate_default_grid() {
        let spectrum = calculator().calculate(&steel(), ResolutionParams::default()).unwrap();
        assert_eq!(spectrum.len(), 2048);
        assert_relative_eq!(spectrum.energy()[2047], 20.47, epsilon = 1e-9);
        assert!(spectrum.total_counts() > 0.0);

        // Peak channel near Fe Ka
        let (imax, _) = spectrum
            .counts()
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &c)| if c > acc.1 { (i, c) } else { acc });
        assert!((spectrum.energy()[imax] - 6.4).abs() < 0.1);
    }

    #[test]
    fn test_invalid_requests() {
        let calc = calculator();
        let mut request = steel();
        request.excitation_energy = 0.0;
        assert!(matches!(calc.prepare(&request), Err(XrfError::Configuration(_))));

        let request = ForwardRequest::new(Composition::new(), 40.0, "Rh");
        assert!(matches!(calc.prepare(&request), Err(XrfError::InvalidInput(_))));

        let request = ForwardRequest::from_pairs(&[("Fe", -1.0)], 40.0, "Rh");
        assert!(calc.prepare(&request).is_err());
    }

    #[test]
    fn test_secondary_enhancement() {
        // Fe Ka excites Cr K; Cr lines gain, Fe lines do not
        let fast = calculator().prepare(&steel()).unwrap();
        let accurate = calculator()
            .with_accuracy(AccuracyMode::HighAccuracy {
                continuum_points: 20,
                tertiary: false,
            })
            .prepare(&steel())
            .unwrap();

        let find = |set: &LineSet, el: &str| {
            set.fluorescence()
                .find(|l| l.element == el && l.line == "Ka1")
                .map(|l| l.intensity)
                .unwrap()
        };
        let cr_gain = find(&accurate, "Cr") / find(&fast, "Cr") - 1.0;
        assert!(cr_gain > 0.0 && cr_gain <= 0.5);
        assert_relative_eq!(find(&accurate, "Ni"), find(&fast, "Ni"), epsilon = 1e-12);

        let tertiary = calculator()
            .with_accuracy(AccuracyMode::HighAccuracy {
                continuum_points: 20,
                tertiary: true,
            })
            .prepare(&steel())
            .unwrap();
        assert!(find(&tertiary, "Cr") >= find(&accurate, "Cr"));
    }

    #[test]
    fn test_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let calc = calculator().with_accuracy(AccuracyMode::HighAccuracy {
            continuum_points: 200,
            tertiary: true,
        });
        assert!(matches!(
            calc.prepare_with_cancel(&steel(), &token),
            Err(XrfError::Cancelled(_))
        ));
    }

    #[test]
    fn test_thick_sample_absorption() {
        let mut table = LineTable::builtin();
        let mut fe = table.get("Fe").unwrap().clone();
        fe.attenuation = vec![(1.0, 9000.0), (7.1, 50.0), (7.2, 400.0), (40.0, 5.0)];
        table.insert("Fe", fe);
        let thin_table = LineTable::builtin();

        let request = ForwardRequest::from_pairs(&[("Fe", 1.0)], 40.0, "Rh")
            .with_density(7.87)
            .with_thickness(1.0);
        let thick = ForwardSpectrumCalculator::new(Arc::new(table)).prepare(&request).unwrap();
        let thin = ForwardSpectrumCalculator::new(Arc::new(thin_table))
            .prepare(&request)
            .unwrap();
        // Infinitely thick limit is far below the thin-film ρt
        assert!(thick.total_fluorescence() < 0.01 * thin.total_fluorescence());
    }
}
