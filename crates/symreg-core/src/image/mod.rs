//! Image types and operations.
//!
//! `Image` carries tensor data on a burn backend; `ImageGrid` and `Volume`
//! are the host-side geometry and sample store used by the registration
//! loops.

pub mod image;
pub mod grid;
pub mod volume;

pub use image::Image;
pub use grid::{generate_grid_3d, ImageGrid};
pub use volume::Volume;
