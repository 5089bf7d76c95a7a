pub mod error;
pub mod spatial;
pub mod image;
pub mod interpolation;
pub mod filter;
pub mod transform;

pub use error::{CoreError, Result};
pub use image::{Image, ImageGrid, Volume};
pub use spatial::{Direction, Point, Spacing, Vector};
pub use transform::{DeformationField, DisplacementField, LinearTransform};
