//! Rigid and affine registration.
//!
//! A stage is configured once ([`LinearConfig`]), initialised by one
//! [`InitPolicy`], optionally refined by a coarse global search, then
//! optimised level by level with adaptive-step gradient descent on a
//! symmetric midway cost whose gradient comes from burn autodiff.

pub mod config;
pub mod cost;
pub mod engine;
pub mod global_search;
pub mod init;
pub mod params;

pub use config::{InitPolicy, LinearConfig, TransformModel, DEFAULT_LINEAR_ITERATIONS};
pub use cost::{CostFunction, CostOptions, Evaluation, LevelImages};
pub use engine::{LevelReport, LinearRegistration, LinearResult};
pub use global_search::global_search;
pub use init::{initialise, moments, principal_axes_rotation, Moments};
