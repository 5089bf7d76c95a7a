//! Metric implementations.
//!
//! The metric family is a closed set: a [`MetricKind`] plus an optional
//! [`Estimator`] is resolved once per stage by [`build_metric`] into a boxed
//! [`SimilarityMetric`]. Metrics are burn tensor forwards, so a stage on an
//! autodiff backend gets its gradients from `backward()`.

pub mod trait_;
pub mod estimator;
pub mod mean_squared;
pub mod cross_correlation;
pub mod difference_robust;

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};

pub use cross_correlation::CrossCorrelation;
pub use difference_robust::{DifferenceRobust, DifferenceRobust4D};
pub use estimator::{Estimator, DEFAULT_LP_POWER};
pub use mean_squared::{MeanSquared, MeanSquared4D};
pub use trait_::SimilarityMetric;

/// Similarity metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Intensity difference, optionally reweighted by an estimator.
    #[default]
    Diff,
    /// Local normalised cross-correlation.
    Ncc,
}

impl FromStr for MetricKind {
    type Err = RegistrationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diff" => Ok(Self::Diff),
            "ncc" => Ok(Self::Ncc),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown metric '{other}' (expected diff or ncc)"
            ))),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diff => write!(f, "diff"),
            Self::Ncc => write!(f, "ncc"),
        }
    }
}

/// Reject metric and estimator combinations that are undefined for images
/// with `components` volumes.
pub fn validate_metric(kind: MetricKind, estimator: Option<Estimator>, components: usize) -> Result<()> {
    match (kind, estimator) {
        (MetricKind::Ncc, _) if components > 1 => Err(RegistrationError::invalid_configuration(
            "cross-correlation metric is not defined for 4D images",
        )),
        (MetricKind::Ncc, Some(e)) => Err(RegistrationError::invalid_configuration(format!(
            "robust estimator '{e}' cannot be combined with the ncc metric"
        ))),
        _ => Ok(()),
    }
}

/// Resolve a metric family and estimator for images with `components`
/// volumes.
pub fn build_metric<B: Backend>(
    kind: MetricKind,
    estimator: Option<Estimator>,
    components: usize,
) -> Result<Box<dyn SimilarityMetric<B>>> {
    validate_metric(kind, estimator, components)?;
    let multi = components > 1;
    Ok(match (kind, estimator) {
        (MetricKind::Ncc, _) => Box::new(CrossCorrelation::new()),
        (MetricKind::Diff, None) if multi => Box::new(MeanSquared4D),
        (MetricKind::Diff, None) => Box::new(MeanSquared),
        (MetricKind::Diff, Some(e)) if multi => Box::new(DifferenceRobust4D::new(e)),
        (MetricKind::Diff, Some(e)) => Box::new(DifferenceRobust::new(e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trait_::testing::TestBackend;

    fn name(kind: MetricKind, estimator: Option<Estimator>, components: usize) -> &'static str {
        build_metric::<TestBackend>(kind, estimator, components).unwrap().name()
    }

    #[test]
    fn test_build_metric_dispatch() {
        assert_eq!(name(MetricKind::Diff, None, 1), "mean_squared");
        assert_eq!(name(MetricKind::Diff, None, 6), "mean_squared_4d");
        assert_eq!(name(MetricKind::Diff, Some(Estimator::L1), 1), "difference_robust");
        assert_eq!(name(MetricKind::Diff, Some(Estimator::lp()), 6), "difference_robust_4d");
        let ncc = build_metric::<TestBackend>(MetricKind::Ncc, None, 1).unwrap();
        assert_eq!(ncc.extent(), 3);
    }

    #[test]
    fn test_build_metric_rejects_invalid_combinations() {
        let err = build_metric::<TestBackend>(MetricKind::Ncc, None, 6).err().unwrap();
        assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));
        assert!(validate_metric(MetricKind::Ncc, Some(Estimator::L2), 1).is_err());
        assert!(validate_metric(MetricKind::Diff, Some(Estimator::L2), 6).is_ok());
        assert!("mi".parse::<MetricKind>().is_err());
    }
}
