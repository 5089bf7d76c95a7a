//! Reduction of per-region gradient estimates.

use serde::{Deserialize, Serialize};

/// How per-region (z-slab) gradient estimates are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientCombiner {
    /// Plain summation; no robust estimation.
    #[default]
    Sum,
    /// Per-parameter median scaled by the number of regions.
    Median,
}

impl GradientCombiner {
    /// Combine `regions` (each of length `n`) into a single gradient.
    ///
    /// Regions that sampled no voxels should be left out by the caller.
    pub fn combine(&self, regions: &[Vec<f64>], n: usize) -> Vec<f64> {
        match self {
            Self::Sum => {
                let mut out = vec![0.0; n];
                for region in regions {
                    for (o, g) in out.iter_mut().zip(region) {
                        *o += g;
                    }
                }
                out
            }
            Self::Median => {
                let count = regions.len() as f64;
                (0..n)
                    .map(|i| {
                        let mut values: Vec<f64> = regions.iter().map(|r| r[i]).collect();
                        median(&mut values) * count
                    })
                    .collect()
            }
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_median() {
        let regions = vec![vec![1.0, -1.0], vec![2.0, 0.0], vec![100.0, 1.0]];
        assert_eq!(GradientCombiner::Sum.combine(&regions, 2), vec![103.0, 0.0]);
        // The outlier region does not dominate the median.
        assert_eq!(GradientCombiner::Median.combine(&regions, 2), vec![6.0, 0.0]);
        assert_eq!(GradientCombiner::Median.combine(&[], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_even_median() {
        let regions = vec![vec![1.0], vec![3.0]];
        assert_eq!(GradientCombiner::Median.combine(&regions, 1), vec![4.0]);
    }
}
