//! Spatial types for points, vectors, spacing and direction matrices.
//!
//! All types are thin wrappers over nalgebra so that physical-space
//! arithmetic reads the same everywhere in the workspace.

pub mod point;
pub mod vector;
pub mod spacing;
pub mod direction;

pub use point::Point;
pub use vector::Vector;
pub use spacing::Spacing;
pub use direction::Direction;

pub type Point3 = Point<3>;
pub type Vector3 = Vector<3>;
pub type Spacing3 = Spacing<3>;
pub type Direction3 = Direction<3>;
