//! Coarse tube excitation spectrum: the anode's characteristic lines plus a
//! sparse Kramers continuum.

use serde::{Deserialize, Serialize};

use super::oracle::{PhysicsOracle, Shell};

/// Where an excitation energy comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExcitationSource {
    Continuum,
    TubeLine { line: String, shell: Shell },
}

/// One energy of the discretised excitation spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcitationPoint {
    pub energy: f64,
    pub weight: f64,
    pub source: ExcitationSource,
}

/// Discretised tube output; weights sum to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcitationSpectrum {
    points: Vec<ExcitationPoint>,
}

impl ExcitationSpectrum {
    /// Build the spectrum of a tube with anode `tube_element` run at
    /// `excitation_energy` kV.
    ///
    /// Continuum energies sit at `E0·(i+1)/(n+1)` with Kramers weights
    /// `Z·(E0−E)/E`. Tube lines whose shell edge lies below `E0` share
    /// `tube_line_fraction` of the total weight. An anode unknown to the
    /// oracle contributes a continuum only.
    pub fn build(
        oracle: &dyn PhysicsOracle,
        tube_element: &str,
        excitation_energy: f64,
        continuum_points: usize,
        tube_line_fraction: f64,
    ) -> Self {
        let e0 = excitation_energy;
        let z = oracle.atomic_number(tube_element).unwrap_or(1) as f64;
        let n = continuum_points.max(1);
        let de = e0 / (n + 1) as f64;

        let mut continuum: Vec<ExcitationPoint> = (1..=n)
            .map(|i| {
                let energy = de * i as f64;
                ExcitationPoint {
                    energy,
                    weight: z * (e0 - energy) / energy * de,
                    source: ExcitationSource::Continuum,
                }
            })
            .collect();

        let shells: Vec<Shell> = Shell::ALL
            .iter()
            .copied()
            .filter(|&s| {
                oracle
                    .absorption_edge(tube_element, s)
                    .map_or(false, |edge| edge < e0)
            })
            .collect();
        let mut lines: Vec<ExcitationPoint> = oracle
            .emission_lines(tube_element, &shells, e0)
            .into_iter()
            .filter(|l| l.relative_intensity > 0.0 && l.energy > 0.0 && l.energy < e0)
            .map(|l| ExcitationPoint {
                energy: l.energy,
                weight: l.relative_intensity,
                source: ExcitationSource::TubeLine {
                    line: l.line,
                    shell: l.shell,
                },
            })
            .collect();

        let line_share = if lines.is_empty() {
            0.0
        } else {
            tube_line_fraction.clamp(0.0, 1.0)
        };
        normalize(&mut continuum, 1.0 - line_share);
        normalize(&mut lines, line_share);

        let mut points = continuum;
        points.extend(lines);
        Self { points }
    }

    pub fn points(&self) -> &[ExcitationPoint] {
        &self.points
    }

    /// Characteristic tube lines, the source of the scatter peaks.
    pub fn tube_lines(&self) -> impl Iterator<Item = &ExcitationPoint> {
        self.points
            .iter()
            .filter(|p| matches!(p.source, ExcitationSource::TubeLine { .. }))
    }

    /// Weight-averaged excitation energy.
    pub fn mean_energy(&self) -> f64 {
        let total: f64 = self.points.iter().map(|p| p.weight).sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.points.iter().map(|p| p.weight * p.energy).sum::<f64>() / total
    }

    /// `Σ w_j·σ(E_j)` for a shell of `element`.
    pub fn excitation_factor(&self, oracle: &dyn PhysicsOracle, element: &str, shell: Shell) -> f64 {
        self.points
            .iter()
            .map(|p| p.weight * oracle.photoionization(element, shell, p.energy))
            .sum()
    }
}

fn normalize(points: &mut [ExcitationPoint], target: f64) {
    let total: f64 = points.iter().map(|p| p.weight).sum();
    if total > 0.0 {
        for p in points.iter_mut() {
            p.weight *= target / total;
        }
    }
}
