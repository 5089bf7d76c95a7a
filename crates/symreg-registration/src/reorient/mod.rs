//! Orientation-aware handling of spherical harmonic images.

pub mod sh;
pub mod directions;
#[allow(clippy::module_inception)]
pub mod reorient;

pub use directions::{DirectionSet, DEFAULT_DIRECTION_COUNT};
pub use reorient::Reorienter;
pub use sh::{is_sh_count, l_for_n, n_for_l};
