//! Symmetric nonlinear registration.

pub mod bundle;
pub mod config;
pub mod engine;
pub mod warp;

pub use bundle::{linear_from_header, BundleField, BundleHeader, WarpBundle, BUNDLE_FIELDS};
pub use config::{SynConfig, DEFAULT_SYN_ITERATIONS};
pub use engine::{midway_grid, SynRegistration, SynResult};
pub use warp::{gradient, warp_volume, Warped};
