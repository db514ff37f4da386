//! Atomic data supplied to the forward model.
//!
//! The forward calculator only talks to a [`PhysicsOracle`]. [`LineTable`] is
//! a serde-loadable implementation with a small built-in data set covering
//! the usual reference standards and tube anodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

/// Electron shell in which the initial vacancy of a line family is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Shell {
    K,
    L,
    M,
}

impl Shell {
    pub const ALL: [Shell; 3] = [Shell::K, Shell::L, Shell::M];
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shell::K => "K",
            Shell::L => "L",
            Shell::M => "M",
        };
        f.write_str(name)
    }
}

/// One characteristic line as reported by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionLineEntry {
    pub element: String,
    pub line: String,
    pub shell: Shell,
    /// Line energy (keV)
    pub energy: f64,
    /// Emission probability per vacancy in `shell`, fluorescence yield included
    pub relative_intensity: f64,
}

/// Read-only source of atomic data.
///
/// Unknown elements are reported by empty results or `None`, never by errors.
pub trait PhysicsOracle {
    /// Lines of `element` belonging to `shells`.
    fn emission_lines(&self, element: &str, shells: &[Shell], excitation_energy: f64)
        -> Vec<EmissionLineEntry>;

    /// Absorption edge (keV) of a shell. L and M refer to the L3 and M5 subshells.
    fn absorption_edge(&self, element: &str, shell: Shell) -> Option<f64>;

    fn atomic_number(&self, element: &str) -> Option<u32>;

    /// Total mass attenuation coefficient (cm²/g) at `energy`.
    fn mass_attenuation(&self, _element: &str, _energy: f64) -> Option<f64> {
        None
    }

    /// Relative photoionization cross-section of `shell` at `energy`.
    ///
    /// Defaults to the `(edge/E)^(8/3)` power law above the edge and zero
    /// below it. Shells without a known edge count as always excited.
    fn photoionization(&self, element: &str, shell: Shell, energy: f64) -> f64 {
        match self.absorption_edge(element, shell) {
            Some(edge) if energy > edge => (edge / energy).powf(8.0 / 3.0),
            Some(_) => 0.0,
            None => 1.0,
        }
    }
}

/// A line stored in a [`LineTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLine {
    pub name: String,
    pub shell: Shell,
    pub energy: f64,
    pub relative_intensity: f64,
}

/// Atomic data for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    pub atomic_number: u32,
    #[serde(default)]
    pub edges: BTreeMap<Shell, f64>,
    #[serde(default)]
    pub lines: Vec<TableLine>,
    /// `(energy keV, μ/ρ cm²/g)` pairs with increasing energy, interpolated log-log
    #[serde(default)]
    pub attenuation: Vec<(f64, f64)>,
}

/// Table-backed [`PhysicsOracle`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineTable {
    elements: BTreeMap<String, ElementData>,
}

/// `a` in the yield estimate `ω = Z⁴ / (a + Z⁴)`.
fn yield_constant(shell: Shell) -> f64 {
    match shell {
        Shell::K => 1.12e6,
        Shell::L => 8.9e7,
        Shell::M => 1.6e9,
    }
}

/// Rough fluorescence yield of a shell.
fn fluorescence_yield(z: u32, shell: Shell) -> f64 {
    let z4 = (z as f64).powi(4);
    z4 / (yield_constant(shell) + z4)
}

type LineSpec = (&'static str, f64, f64);

struct BuiltinElement {
    symbol: &'static str,
    z: u32,
    edges: &'static [(Shell, f64)],
    k: &'static [LineSpec],
    l: &'static [LineSpec],
    m: &'static [LineSpec],
}

const L_BRANCHING: [f64; 5] = [1.0, 0.11, 0.6, 0.2, 0.08];

macro_rules! l_lines {
    ($la1:expr, $la2:expr, $lb1:expr, $lb2:expr, $lg1:expr) => {
        &[
            ("La1", $la1, L_BRANCHING[0]),
            ("La2", $la2, L_BRANCHING[1]),
            ("Lb1", $lb1, L_BRANCHING[2]),
            ("Lb2", $lb2, L_BRANCHING[3]),
            ("Lg1", $lg1, L_BRANCHING[4]),
        ]
    };
}

const BUILTIN: &[BuiltinElement] = &[
    BuiltinElement {
        symbol: "Mg",
        z: 12,
        edges: &[(Shell::K, 1.3050)],
        k: &[("Ka", 1.2536, 1.0), ("Kb1", 1.3022, 0.03)],
        l: &[],
        m: &[],
    },
    BuiltinElement {
        symbol: "Al",
        z: 13,
        edges: &[(Shell::K, 1.5596)],
        k: &[("Ka", 1.4866, 1.0), ("Kb1", 1.5575, 0.03)],
        l: &[],
        m: &[],
    },
    BuiltinElement {
        symbol: "Si",
        z: 14,
        edges: &[(Shell::K, 1.8389)],
        k: &[("Ka1", 1.73998, 1.0), ("Ka2", 1.73938, 0.5), ("Kb1", 1.83594, 0.05)],
        l: &[],
        m: &[],
    },
    BuiltinElement {
        symbol: "K",
        z: 19,
        edges: &[(Shell::K, 3.6074), (Shell::L, 0.2942)],
        k: &[("Ka1", 3.3138, 1.0), ("Ka2", 3.3111, 0.5), ("Kb1", 3.5896, 0.13)],
        l: &[],
        m: &[],
    },
    BuiltinElement {
        symbol: "Ca",
        z: 20,
        edges: &[(Shell::K, 4.0381), (Shell::L, 0.3463)],
        k: &[("Ka1", 3.69168, 1.0), ("Ka2", 3.68809, 0.5), ("Kb1", 4.0127, 0.13)],
        l: &[("La", 0.3413, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Ti",
        z: 22,
        edges: &[(Shell::K, 4.9664), (Shell::L, 0.4555)],
        k: &[("Ka1", 4.51084, 1.0), ("Ka2", 4.50486, 0.5), ("Kb1", 4.93181, 0.15)],
        l: &[("La", 0.4522, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Cr",
        z: 24,
        edges: &[(Shell::K, 5.9892), (Shell::L, 0.5745)],
        k: &[("Ka1", 5.41472, 1.0), ("Ka2", 5.40551, 0.5), ("Kb1", 5.94671, 0.16)],
        l: &[("La", 0.5728, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Mn",
        z: 25,
        edges: &[(Shell::K, 6.5390), (Shell::L, 0.6387)],
        k: &[("Ka1", 5.89875, 1.0), ("Ka2", 5.88765, 0.5), ("Kb1", 6.49045, 0.17)],
        l: &[("La", 0.6374, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Fe",
        z: 26,
        edges: &[(Shell::K, 7.1120), (Shell::L, 0.7081)],
        k: &[("Ka1", 6.40384, 1.0), ("Ka2", 6.39084, 0.5), ("Kb1", 7.05798, 0.17)],
        l: &[("La", 0.7050, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Ni",
        z: 28,
        edges: &[(Shell::K, 8.3328), (Shell::L, 0.8547)],
        k: &[("Ka1", 7.47815, 1.0), ("Ka2", 7.46089, 0.51), ("Kb1", 8.26466, 0.17)],
        l: &[("La", 0.8515, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Cu",
        z: 29,
        edges: &[(Shell::K, 8.9789), (Shell::L, 0.9327)],
        k: &[("Ka1", 8.04778, 1.0), ("Ka2", 8.02783, 0.51), ("Kb1", 8.90529, 0.17)],
        l: &[("La", 0.9297, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Zn",
        z: 30,
        edges: &[(Shell::K, 9.6586), (Shell::L, 1.0196)],
        k: &[("Ka1", 8.63886, 1.0), ("Ka2", 8.61578, 0.51), ("Kb1", 9.5720, 0.17)],
        l: &[("La1", 1.0116, 1.0)],
        m: &[],
    },
    BuiltinElement {
        symbol: "Zr",
        z: 40,
        edges: &[(Shell::K, 17.9976), (Shell::L, 2.2223)],
        k: &[("Ka1", 15.7751, 1.0), ("Ka2", 15.6909, 0.52), ("Kb1", 17.6678, 0.19)],
        l: l_lines!(2.04236, 2.0399, 2.1244, 2.2194, 2.3027),
        m: &[],
    },
    BuiltinElement {
        symbol: "Mo",
        z: 42,
        edges: &[(Shell::K, 20.0000), (Shell::L, 2.5202)],
        k: &[("Ka1", 17.47934, 1.0), ("Ka2", 17.3743, 0.52), ("Kb1", 19.6083, 0.2)],
        l: l_lines!(2.29316, 2.28985, 2.39481, 2.5183, 2.6235),
        m: &[],
    },
    BuiltinElement {
        symbol: "Rh",
        z: 45,
        edges: &[(Shell::K, 23.2199), (Shell::L, 3.0038)],
        k: &[("Ka1", 20.2161, 1.0), ("Ka2", 20.0737, 0.53), ("Kb1", 22.7236, 0.2)],
        l: l_lines!(2.69674, 2.69205, 2.83441, 3.00145, 3.14373),
        m: &[],
    },
    BuiltinElement {
        symbol: "Ag",
        z: 47,
        edges: &[(Shell::K, 25.514), (Shell::L, 3.3511)],
        k: &[("Ka1", 22.16292, 1.0), ("Ka2", 21.9903, 0.53), ("Kb1", 24.9424, 0.21)],
        l: l_lines!(2.98431, 2.97821, 3.15094, 3.34781, 3.51959),
        m: &[],
    },
    BuiltinElement {
        symbol: "Sn",
        z: 50,
        edges: &[(Shell::K, 29.2001), (Shell::L, 3.9288)],
        k: &[("Ka1", 25.2713, 1.0), ("Ka2", 25.0440, 0.53), ("Kb1", 28.4860, 0.21)],
        l: l_lines!(3.44398, 3.43542, 3.66280, 3.90486, 4.13112),
        m: &[],
    },
    BuiltinElement {
        symbol: "W",
        z: 74,
        edges: &[(Shell::K, 69.5250), (Shell::L, 10.2068), (Shell::M, 1.8092)],
        k: &[("Ka1", 59.3182, 1.0), ("Ka2", 57.9817, 0.58), ("Kb1", 67.2443, 0.22)],
        l: l_lines!(8.3976, 8.3352, 9.67235, 9.9615, 11.2859),
        m: &[("Ma1", 1.7754, 1.0)],
    },
    BuiltinElement {
        symbol: "Au",
        z: 79,
        edges: &[(Shell::K, 80.7249), (Shell::L, 11.9187), (Shell::M, 2.2057)],
        k: &[("Ka1", 68.8062, 1.0), ("Ka2", 66.9913, 0.59), ("Kb1", 77.984, 0.23)],
        l: l_lines!(9.7133, 9.6280, 11.4423, 11.5847, 13.3817),
        m: &[("Ma1", 2.1229, 1.0)],
    },
    BuiltinElement {
        symbol: "Pb",
        z: 82,
        edges: &[(Shell::K, 88.0045), (Shell::L, 13.0352), (Shell::M, 2.4840)],
        k: &[("Ka1", 74.9694, 1.0), ("Ka2", 72.8042, 0.6), ("Kb1", 84.936, 0.23)],
        l: l_lines!(10.5515, 10.4495, 12.6137, 12.6226, 14.7644),
        m: &[("Ma1", 2.3455, 1.0)],
    },
];

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in data for Mg Al Si K Ca Ti Cr Mn Fe Ni Cu Zn Zr Mo Rh Ag Sn W Au Pb.
    ///
    /// Relative intensities are in-family branching ratios multiplied by an
    /// estimated fluorescence yield. No attenuation data is included.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for el in BUILTIN {
            let families = [(Shell::K, el.k), (Shell::L, el.l), (Shell::M, el.m)];
            let lines = families
                .iter()
                .flat_map(|&(shell, specs)| {
                    let omega = fluorescence_yield(el.z, shell);
                    specs.iter().map(move |&(name, energy, branching)| TableLine {
                        name: name.to_string(),
                        shell,
                        energy,
                        relative_intensity: branching * omega,
                    })
                })
                .collect();

            table.insert(
                el.symbol,
                ElementData {
                    atomic_number: el.z,
                    edges: el.edges.iter().cloned().collect(),
                    lines,
                    attenuation: Vec::new(),
                },
            );
        }
        table
    }

    /// Add or replace an element.
    pub fn insert(&mut self, symbol: &str, data: ElementData) {
        self.elements.insert(symbol.to_string(), data);
    }

    pub fn get(&self, symbol: &str) -> Option<&ElementData> {
        self.elements.get(symbol)
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        Self::from_json(&contents)
    }
}

impl PhysicsOracle for LineTable {
    fn emission_lines(
        &self,
        element: &str,
        shells: &[Shell],
        _excitation_energy: f64,
    ) -> Vec<EmissionLineEntry> {
        let Some(data) = self.elements.get(element) else {
            return Vec::new();
        };
        data.lines
            .iter()
            .filter(|l| shells.contains(&l.shell))
            .map(|l| EmissionLineEntry {
                element: element.to_string(),
                line: l.name.clone(),
                shell: l.shell,
                energy: l.energy,
                relative_intensity: l.relative_intensity,
            })
            .collect()
    }

    fn absorption_edge(&self, element: &str, shell: Shell) -> Option<f64> {
        self.elements.get(element)?.edges.get(&shell).copied()
    }

    fn atomic_number(&self, element: &str) -> Option<u32> {
        self.elements.get(element).map(|d| d.atomic_number)
    }

    fn mass_attenuation(&self, element: &str, energy: f64) -> Option<f64> {
        let points = &self.elements.get(element)?.attenuation;
        if points.len() < 2 || energy <= 0.0 {
            return None;
        }
        // Segment containing `energy`, extrapolating from the end segments
        let i = points
            .partition_point(|&(e, _)| e < energy)
            .clamp(1, points.len() - 1);
        let (e0, m0) = points[i - 1];
        let (e1, m1) = points[i];
        if e0 <= 0.0 || e1 <= e0 || m0 <= 0.0 || m1 <= 0.0 {
            return None;
        }
        let slope = (m1 / m0).ln() / (e1 / e0).ln();
        Some(m0 * (energy / e0).powf(slope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_builtin_contents() {
        let table = LineTable::builtin();
        assert_eq!(table.len(), 20);
        assert_eq!(table.atomic_number("Fe"), Some(26));
        assert_eq!(table.atomic_number("Xx"), None);

        let fe = table.emission_lines("Fe", &[Shell::K], 40.0);
        assert_eq!(fe.len(), 3);
        assert!(fe.iter().all(|l| l.shell == Shell::K && l.relative_intensity > 0.0));

        let pb = table.emission_lines("Pb", &[Shell::L, Shell::M], 40.0);
        assert_eq!(pb.len(), 6);
        assert!(table.emission_lines("Unobtainium", &Shell::ALL, 40.0).is_empty());
    }

    #[test]
    fn test_photoionization_default() {
        let table = LineTable::builtin();
        let edge = table.absorption_edge("Fe", Shell::K).unwrap();
        assert_eq!(table.photoionization("Fe", Shell::K, edge - 0.1), 0.0);
        assert_relative_eq!(
            table.photoionization("Fe", Shell::K, 2.0 * edge),
            0.5f64.powf(8.0 / 3.0),
            epsilon = 1e-12
        );
        // Heavier elements fluoresce more efficiently
        assert!(fluorescence_yield(40, Shell::K) > fluorescence_yield(20, Shell::K));
    }

    #[test]
    fn test_attenuation_interpolation() {
        let mut table = LineTable::new();
        table.insert(
            "Fe",
            ElementData {
                atomic_number: 26,
                edges: BTreeMap::new(),
                lines: Vec::new(),
                attenuation: vec![(1.0, 1000.0), (10.0, 10.0), (100.0, 0.1)],
            },
        );
        // Power law with slope -2 on every segment
        assert_relative_eq!(table.mass_attenuation("Fe", 5.0).unwrap(), 40.0, epsilon = 1e-9);
        assert_relative_eq!(table.mass_attenuation("Fe", 200.0).unwrap(), 0.025, epsilon = 1e-12);
        assert!(table.mass_attenuation("Cu", 5.0).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let table = LineTable::builtin();
        let back = LineTable::from_json(&table.to_json().unwrap()).unwrap();
        assert_eq!(back, table);
    }
}
