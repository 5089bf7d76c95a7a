//! Interpolation of tensor volumes at continuous indices.

pub mod trait_;
pub mod linear;

pub use trait_::Interpolator;
pub use linear::{Boundary, LinearInterpolator};
