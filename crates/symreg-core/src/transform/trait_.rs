//! Tensor-side spatial transform trait.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

/// Maps batches of world points on a burn backend.
///
/// The resample filter pulls values through this trait, so implementations
/// map output-space points to input-space points.
pub trait Transform<B: Backend, const D: usize> {
    /// Map `[Batch, D]` points to `[Batch, D]` points.
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2>;
}

impl<B: Backend, const D: usize, T: Transform<B, D> + ?Sized> Transform<B, D> for &T {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        (**self).transform_points(points)
    }
}
