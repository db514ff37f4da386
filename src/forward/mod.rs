//! Forward model: synthetic spectra from composition and detector resolution.

pub mod calculator;
pub mod excitation;
pub mod oracle;

pub use crate::resolution::ResolutionParams;
pub use calculator::{
    AccuracyMode, CancellationToken, Composition, EnergyGrid, ForwardModelConfig, ForwardRequest,
    ForwardSpectrumCalculator, LineFamilyPolicy, LineOrigin, LineSet, SkippedElement, SpectralLine,
};
pub use excitation::{ExcitationPoint, ExcitationSource, ExcitationSpectrum};
pub use oracle::{ElementData, EmissionLineEntry, LineTable, PhysicsOracle, Shell, TableLine};
