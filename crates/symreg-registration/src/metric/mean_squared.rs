//! Mean squared difference.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::trait_::{flatten, SimilarityMetric};

/// Squared intensity difference of a single-volume image:
/// `(moving - fixed)^2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquared;

impl<B: Backend> SimilarityMetric<B> for MeanSquared {
    fn name(&self) -> &'static str {
        "mean_squared"
    }

    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, _, _] = moving.dims();
        let r = flatten(moving - fixed);
        (r.clone() * r).sum_dim(1).reshape([n])
    }
}

/// Squared difference summed over volumes and normalised by volume count.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquared4D;

impl<B: Backend> SimilarityMetric<B> for MeanSquared4D {
    fn name(&self) -> &'static str {
        "mean_squared_4d"
    }

    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, _, _] = moving.dims();
        let r = flatten(moving - fixed);
        (r.clone() * r).mean_dim(1).reshape([n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::trait_::testing::{host, samples, TestAutodiff, TestBackend};

    #[test]
    fn test_mean_squared_4d_normalises() {
        let moving = samples::<TestBackend>(&[1.0, 3.0, 2.0, 2.0], [2, 1, 2]);
        let fixed = samples::<TestBackend>(&[0.0, 0.0, 2.0, 2.0], [2, 1, 2]);
        assert_eq!(host(MeanSquared4D.forward(moving, fixed)), vec![5.0, 0.0]);
    }

    #[test]
    fn test_gradient_is_twice_the_residual() {
        let moving = samples::<TestAutodiff>(&[2.0, -1.0], [2, 1, 1]).require_grad();
        let fixed = samples::<TestAutodiff>(&[0.5, 1.0], [2, 1, 1]);
        let cost = MeanSquared.forward(moving.clone(), fixed);
        let grads = cost.sum().backward();
        let grad = host(moving.grad(&grads).unwrap());
        assert!((grad[0] - 3.0).abs() < 1e-6);
        assert!((grad[1] + 4.0).abs() < 1e-6);
    }
}
