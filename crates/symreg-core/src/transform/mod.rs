//! Spatial transforms.
//!
//! `LinearTransform` is the centred affine with its symmetric halves;
//! `DisplacementField` and `DeformationField` are host-side dense maps used
//! by the nonlinear stage.

pub mod trait_;
pub mod linear;
pub mod displacement_field;
pub mod compose;

pub use trait_::Transform;
pub use linear::{matrix_sqrt, LinearTransform};
pub use displacement_field::DisplacementField;
pub use compose::{compose_halfway_transforms, compose_linear_displacement, DeformationField};
