//! Intensity difference reweighted by an M-estimator.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::estimator::Estimator;
use super::trait_::{flatten, SimilarityMetric};

/// Keeps the residual norm differentiable at zero.
const NORM_EPSILON: f64 = 1e-12;

/// `rho(moving - fixed)` for single-volume images.
#[derive(Debug, Clone, Copy)]
pub struct DifferenceRobust {
    estimator: Estimator,
}

impl DifferenceRobust {
    pub fn new(estimator: Estimator) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> Estimator {
        self.estimator
    }
}

impl<B: Backend> SimilarityMetric<B> for DifferenceRobust {
    fn name(&self) -> &'static str {
        "difference_robust"
    }

    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, _, _] = moving.dims();
        let r = flatten(moving - fixed);
        self.estimator.forward(r).sum_dim(1).reshape([n])
    }
}

/// `rho(|r|)` over the residual vector of all volumes.
#[derive(Debug, Clone, Copy)]
pub struct DifferenceRobust4D {
    estimator: Estimator,
}

impl DifferenceRobust4D {
    pub fn new(estimator: Estimator) -> Self {
        Self { estimator }
    }
}

impl<B: Backend> SimilarityMetric<B> for DifferenceRobust4D {
    fn name(&self) -> &'static str {
        "difference_robust_4d"
    }

    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, _, _] = moving.dims();
        let r = flatten(moving - fixed);
        let squared = (r.clone() * r).sum_dim(1).reshape([n]);
        match self.estimator {
            Estimator::L2 => squared,
            other => other.forward((squared + NORM_EPSILON).sqrt()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::trait_::testing::{host, samples, TestAutodiff, TestBackend};
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_matches_squared_difference() {
        let moving = samples::<TestBackend>(&[5.0], [1, 1, 1]);
        let fixed = samples::<TestBackend>(&[2.0], [1, 1, 1]);
        assert_eq!(host(DifferenceRobust::new(Estimator::L2).forward(moving, fixed)), vec![9.0]);
    }

    #[test]
    fn test_4d_uses_residual_norm() {
        let metric = DifferenceRobust4D::new(Estimator::L1);
        let moving = samples::<TestAutodiff>(&[3.0, 4.0, 1.0, 1.0], [2, 1, 2]).require_grad();
        let fixed = samples::<TestAutodiff>(&[0.0, 0.0, 1.0, 1.0], [2, 1, 2]);
        let cost = metric.forward(moving.clone(), fixed);
        let values = host(cost.clone());
        assert_relative_eq!(values[0], 5.0, epsilon = 1e-5);
        assert!(values[1] < 1e-5);

        let grad = host(moving.grad(&cost.sum().backward()).unwrap());
        assert_relative_eq!(grad[0], 0.6, epsilon = 1e-5);
        assert_relative_eq!(grad[1], 0.8, epsilon = 1e-5);
        assert_eq!(&grad[2..], &[0.0, 0.0]);
    }
}
