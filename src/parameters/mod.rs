//! # Parameter System
//!
//! Named, bounded fit parameters shared by the peak, resolution-model and
//! instrument calibration fits.
//!
//! - [`Parameter`]: a value with bounds and a vary flag
//! - [`Parameters`]: an ordered collection mapping to and from the optimizer's internal vector
//! - [`Bounds`] and [`BoundsTransform`]: box constraints and the sine transform that enforces them

pub mod bounds;
pub mod parameter;

pub use bounds::{Bounds, BoundsError, BoundsTransform};
pub use parameter::{Parameter, Parameters};
