//! Local normalised cross-correlation over a 3x3x3 neighbourhood.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::trait_::{flatten, SimilarityMetric};

/// Local cross-correlation, `-s_ab^2 / (s_aa * s_bb)` with `a` the moving
/// and `b` the fixed neighbourhood, centred on their means.
///
/// Only defined for single-volume images. Flat neighbourhoods contribute
/// zero cost and zero gradient. Every sample of the neighbourhood
/// contributes to the gradient.
#[derive(Debug, Clone, Copy)]
pub struct CrossCorrelation {
    epsilon: f64,
}

impl Default for CrossCorrelation {
    fn default() -> Self {
        Self { epsilon: 1e-10 }
    }
}

impl CrossCorrelation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> SimilarityMetric<B> for CrossCorrelation {
    fn extent(&self) -> usize {
        3
    }

    fn name(&self) -> &'static str {
        "cross_correlation"
    }

    fn forward(&self, moving: Tensor<B, 3>, fixed: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, _, _] = moving.dims();
        let a = flatten(moving);
        let b = flatten(fixed);
        let a = a.clone() - a.mean_dim(1);
        let b = b.clone() - b.mean_dim(1);

        let s_ab = (a.clone() * b.clone()).sum_dim(1);
        let s_aa = (a.clone() * a).sum_dim(1);
        let s_bb = (b.clone() * b).sum_dim(1);
        let denom = s_aa * s_bb;
        let textured = denom.clone().greater_elem(self.epsilon).float();

        ((s_ab.clone() * s_ab).neg() / denom.clamp_min(self.epsilon) * textured).reshape([n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::trait_::testing::{host, samples, TestAutodiff, TestBackend};
    use approx::assert_relative_eq;

    fn fixed_values() -> Vec<f64> {
        (0..27).map(|k| ((k * 7) % 11) as f64).collect()
    }

    #[test]
    fn test_perfect_linear_relation_is_minimal() {
        let fixed = fixed_values();
        let moving: Vec<f64> = fixed.iter().map(|v| 2.5 * v - 3.0).collect();
        let cost = CrossCorrelation::new().forward(
            samples::<TestBackend>(&moving, [1, 27, 1]),
            samples::<TestBackend>(&fixed, [1, 27, 1]),
        );
        assert_relative_eq!(host(cost)[0], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_gradient_reaches_every_neighbour() {
        let metric = CrossCorrelation::new();
        let fixed = fixed_values();
        let moving: Vec<f64> = (0..27).map(|k| ((k * 5) % 13) as f64).collect();
        let cost_at = |m: &[f64]| {
            host(metric.forward(
                samples::<TestBackend>(m, [1, 27, 1]),
                samples::<TestBackend>(&fixed, [1, 27, 1]),
            ))[0]
        };

        let tracked = samples::<TestAutodiff>(&moving, [1, 27, 1]).require_grad();
        let cost = metric.forward(tracked.clone(), samples::<TestAutodiff>(&fixed, [1, 27, 1]));
        let grad = host(tracked.grad(&cost.sum().backward()).unwrap());
        assert!(grad.iter().filter(|g| g.abs() > 1e-6).count() > 13);

        let h = 1e-2;
        for k in [0, 5, 13, 26] {
            let mut up = moving.clone();
            up[k] += h;
            let mut down = moving.clone();
            down[k] -= h;
            let numeric = (cost_at(&up) - cost_at(&down)) / (2.0 * h);
            assert_relative_eq!(grad[k], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_flat_neighbourhood_is_neutral() {
        let flat = vec![4.0; 27];
        let tracked = samples::<TestAutodiff>(&flat, [1, 27, 1]).require_grad();
        let cost = CrossCorrelation::new().forward(tracked.clone(), samples::<TestAutodiff>(&fixed_values(), [1, 27, 1]));
        assert_eq!(host(cost.clone()), vec![0.0]);
        let grad = host(tracked.grad(&cost.sum().backward()).unwrap());
        assert!(grad.iter().all(|g| *g == 0.0));
    }
}
