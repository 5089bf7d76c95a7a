//! M-estimators for robust difference metrics.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;

/// Default power of the `Lp` estimator.
pub const DEFAULT_LP_POWER: f64 = 1.2;

/// Residual reweighting function `rho(r)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimator {
    /// `|r|`
    L1,
    /// `r^2`, the plain squared difference.
    L2,
    /// `|r|^p`
    Lp { power: f64 },
}

impl Estimator {
    /// `Lp` with the default power.
    pub fn lp() -> Self {
        Self::Lp {
            power: DEFAULT_LP_POWER,
        }
    }

    /// `rho` applied elementwise to a residual tensor.
    pub fn forward<B: Backend, const D: usize>(&self, r: Tensor<B, D>) -> Tensor<B, D> {
        match *self {
            Self::L1 => r.abs(),
            Self::L2 => r.clone() * r,
            Self::Lp { power } => r.abs().powf_scalar(power),
        }
    }
}

impl FromStr for Estimator {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "lp" => Ok(Self::lp()),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown robust estimator '{other}' (expected l1, l2 or lp)"
            ))),
        }
    }
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "l1"),
            Self::L2 => write!(f, "l2"),
            Self::Lp { .. } => write!(f, "lp"),
        }
    }
}
