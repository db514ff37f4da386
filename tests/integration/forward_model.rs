//! Forward spectrum calculation against the built-in and user-supplied line tables.

use approx::assert_relative_eq;
use ndarray::Array1;
use std::collections::BTreeMap;
use std::sync::Arc;

use xrfcal_rs::forward::{
    AccuracyMode, ElementData, ForwardRequest, ForwardSpectrumCalculator, LineOrigin, LineTable,
    Shell, TableLine,
};
use xrfcal_rs::ResolutionParams;

use crate::test_helpers::{builtin_calculator, temp_path};

const BUILTIN: [&str; 20] = [
    "Mg", "Al", "Si", "K", "Ca", "Ti", "Cr", "Mn", "Fe", "Ni", "Cu", "Zn", "Zr", "Mo", "Rh", "Ag",
    "Sn", "W", "Au", "Pb",
];
const NOT_TABULATED: [&str; 10] = ["V", "Co", "Ga", "Ge", "As", "Se", "Br", "Sr", "Nb", "Ba"];

fn sdd() -> ResolutionParams {
    ResolutionParams::new(0.120, 0.0035)
}

#[test]
fn test_thirty_element_request() {
    let pairs: Vec<(&str, f64)> = BUILTIN
        .iter()
        .chain(NOT_TABULATED.iter())
        .map(|&el| (el, 1.0 / 30.0))
        .collect();
    let request = ForwardRequest::from_pairs(&pairs, 40.0, "Rh");
    let calculator = builtin_calculator();

    let lines = calculator.prepare(&request).unwrap();
    assert_eq!(lines.skipped.len(), NOT_TABULATED.len());
    for el in NOT_TABULATED {
        assert!(lines.is_skipped(el), "{} should be skipped", el);
    }
    assert_eq!(lines.elements().len(), BUILTIN.len());

    let spectrum = calculator.calculate(&request, sdd()).unwrap();
    assert_eq!(spectrum.len(), 2048);
    assert!(spectrum.counts().iter().all(|c| c.is_finite() && *c >= 0.0));
    assert!(spectrum.total_counts() > 0.0);
}

#[test]
fn test_scatter_fraction_sets_tube_line_budget() {
    let request = ForwardRequest::from_pairs(&[("Fe", 0.5), ("Cu", 0.5)], 40.0, "Rh");
    for fraction in [0.01, 0.02, 0.1] {
        let lines = builtin_calculator()
            .with_scatter_fraction(fraction)
            .prepare(&request)
            .unwrap();
        let scatter: f64 = lines.scatter().map(|l| l.intensity).sum();
        assert_relative_eq!(scatter / lines.total_fluorescence(), fraction, max_relative = 1e-12);
        assert!(lines.scatter().all(|l| l.origin == LineOrigin::TubeScatter && l.element == "Rh"));
    }
}

#[test]
fn test_custom_energy_axis() {
    let request = ForwardRequest::from_pairs(&[("Fe", 1.0)], 40.0, "Rh");
    let calculator = builtin_calculator();

    let fine = Array1::from_iter((0..=1800).map(|i| 1.0 + 0.005 * i as f64));
    let on_fine = calculator.calculate_on(&request, sdd(), &fine).unwrap();
    assert_eq!(on_fine.len(), 1801);

    let peak = on_fine
        .counts()
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, &c)| if c > best.1 { (i, c) } else { best });
    assert_relative_eq!(fine[peak.0], 6.404, epsilon = 0.01);

    // Same area in 1-10 keV on both grids
    let default = calculator.calculate(&request, sdd()).unwrap();
    assert_relative_eq!(
        on_fine.total_counts(),
        default.roi_sum(1.0, 10.0),
        max_relative = 0.01
    );
}

#[test]
fn test_line_table_from_file() {
    let path = temp_path("line-table.json");
    std::fs::write(&path, LineTable::builtin().to_json().unwrap()).unwrap();
    let loaded = LineTable::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded, LineTable::builtin());
    assert_eq!(loaded.len(), 20);
}

#[test]
fn test_user_supplied_element() {
    let mut table = LineTable::new();
    table.insert(
        "Xx",
        ElementData {
            atomic_number: 30,
            edges: BTreeMap::from([(Shell::K, 5.5)]),
            lines: vec![TableLine {
                name: "Ka1".to_string(),
                shell: Shell::K,
                energy: 5.0,
                relative_intensity: 0.5,
            }],
            attenuation: Vec::new(),
        },
    );
    let calculator = ForwardSpectrumCalculator::new(Arc::new(table));
    let request = ForwardRequest::from_pairs(&[("Xx", 1.0)], 30.0, "Rh");

    let lines = calculator.prepare(&request).unwrap();
    // Unknown tube: continuum excitation and no scatter lines
    assert_eq!(lines.lines.len(), 1);
    assert_eq!(lines.scatter().count(), 0);

    let spectrum = calculator.calculate(&request, sdd()).unwrap();
    assert_relative_eq!(spectrum.roi_sum(4.0, 6.0), spectrum.total_counts(), max_relative = 1e-3);
}

#[test]
fn test_accuracy_modes_only_add_intensity() {
    let request = ForwardRequest::from_pairs(&[("Fe", 0.7), ("Cr", 0.2), ("Ni", 0.1)], 40.0, "Rh");
    let fast = builtin_calculator().prepare(&request).unwrap();
    let secondary = builtin_calculator()
        .with_accuracy(AccuracyMode::HighAccuracy {
            continuum_points: 20,
            tertiary: false,
        })
        .prepare(&request)
        .unwrap();
    let tertiary = builtin_calculator()
        .with_accuracy(AccuracyMode::HighAccuracy {
            continuum_points: 20,
            tertiary: true,
        })
        .prepare(&request)
        .unwrap();

    let find = |set: &xrfcal_rs::LineSet, el: &str, line: &str| {
        set.fluorescence()
            .find(|l| l.element == el && l.line == line)
            .map(|l| l.intensity)
            .unwrap()
    };
    for el in ["Fe", "Cr", "Ni"] {
        let (a, b, c) = (find(&fast, el, "Ka1"), find(&secondary, el, "Ka1"), find(&tertiary, el, "Ka1"));
        assert!(a <= b && b <= c, "{}: {} {} {}", el, a, b, c);
    }
    // Fe Ka lies above the Cr K edge
    assert!(find(&secondary, "Cr", "Ka1") > find(&fast, "Cr", "Ka1"));
}
