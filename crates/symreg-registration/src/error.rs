//! Error types for registration operations.

use symreg_core::CoreError;
use thiserror::Error;

/// Main error type for registration operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    /// Geometry or transform failure from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Incompatible or malformed options, detected before any iteration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Degenerate transform or singular statistics.
    #[error("Numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// Dimension mismatch.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A warp bundle with the wrong rank, shape or metadata.
    #[error("Malformed warp bundle: {0}")]
    MalformedBundle(String),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, RegistrationError>;

impl RegistrationError {
    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a numerical degeneracy error.
    pub fn numerical_degeneracy(msg: impl Into<String>) -> Self {
        Self::NumericalDegeneracy(msg.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create a malformed bundle error.
    pub fn malformed_bundle(msg: impl Into<String>) -> Self {
        Self::MalformedBundle(msg.into())
    }

    /// Whether this is a hard numerical failure rather than a usage error.
    pub fn is_numerical_degeneracy(&self) -> bool {
        matches!(
            self,
            Self::NumericalDegeneracy(_)
                | Self::Core(CoreError::NonPositiveDeterminant { .. })
                | Self::Core(CoreError::SquareRootNotConverged { .. })
                | Self::Core(CoreError::SingularMatrix(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RegistrationError::invalid_configuration("bad option");
        assert!(matches!(err, RegistrationError::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Invalid configuration: bad option");
    }

    #[test]
    fn test_core_errors_convert() {
        let err: RegistrationError = CoreError::NonPositiveDeterminant { determinant: 0.0 }.into();
        assert!(err.is_numerical_degeneracy());
        assert!(!RegistrationError::dimension_mismatch("ndim").is_numerical_degeneracy());
    }
}
