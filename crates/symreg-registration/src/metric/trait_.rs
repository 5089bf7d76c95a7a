//! Metric trait for voxel-wise image similarity.
//!
//! The engines sample both images in a common space and hand each metric
//! the co-located samples as `[voxels, samples, components]` tensors, where
//! `samples` is the neighbourhood size (`extent^3`). A metric returns one
//! cost per voxel; gradients come from the autodiff backend.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Similarity metric over sampled neighbourhoods. Lower cost is better.
///
/// # Examples
///
/// ```
/// use burn::tensor::Tensor;
/// use burn_ndarray::NdArray;
/// use symreg_registration::metric::{MeanSquared, SimilarityMetric};
///
/// let device = Default::default();
/// let moving = Tensor::<NdArray<f32>, 3>::from_floats([[[3.0]], [[1.0]]], &device);
/// let fixed = Tensor::<NdArray<f32>, 3>::from_floats([[[1.0]], [[1.0]]], &device);
/// let cost: Vec<f32> = MeanSquared.forward(moving, fixed).into_data().iter::<f32>().collect();
/// assert_eq!(cost, vec![4.0, 0.0]);
/// ```
pub trait SimilarityMetric<B: Backend>: Send + Sync {
    /// Side length of the cubic neighbourhood the metric needs.
    fn extent(&self) -> usize {
        1
    }

    /// Get the name of this metric.
    fn name(&self) -> &'static str;

    /// Cost of each voxel, `[voxels]`.
    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1>;
}

/// Flatten `[voxels, samples, components]` to `[voxels, samples * components]`.
pub(crate) fn flatten<B: Backend>(samples: Tensor<B, 3>) -> Tensor<B, 2> {
    let [n, s, c] = samples.dims();
    samples.reshape([n, s * c])
}
