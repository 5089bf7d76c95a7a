//! Interpolator trait for sampling values at continuous coordinates.

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

/// Samples a `[Z, Y, X]` volume at continuous indices.
///
/// # Type Parameters
/// * `B` - The Burn backend
pub trait Interpolator<B: Backend> {
    /// Interpolate values at `indices` (`[Batch, 3]`, ordered `(x, y, z)`).
    ///
    /// Returns `[Batch]` samples; values outside the volume depend on the
    /// interpolator's boundary handling.
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1>;
}
