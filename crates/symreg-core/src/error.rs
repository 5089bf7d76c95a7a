//! Error types for core geometry and transform operations.

use thiserror::Error;

/// Errors raised by transforms, grids and fields.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A linear transform whose homogeneous form has a non-positive determinant.
    #[error("non-positive determinant {determinant:.6e}: transform is degenerate or left-handed")]
    NonPositiveDeterminant { determinant: f64 },

    /// The principal square root iteration did not converge.
    #[error("matrix square root did not converge after {iterations} iterations (residual {residual:.3e})")]
    SquareRootNotConverged { iterations: usize, residual: f64 },

    /// A matrix that must be inverted is singular.
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    /// Two grids, volumes or fields that must agree do not.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Invalid grid geometry or buffer length.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a singular matrix error.
    pub fn singular(msg: impl Into<String>) -> Self {
        Self::SingularMatrix(msg.into())
    }

    /// Create an invalid geometry error.
    pub fn invalid_geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NonPositiveDeterminant { determinant: -1.0 };
        assert!(err.to_string().contains("non-positive determinant"));

        let err = CoreError::ShapeMismatch { expected: vec![4, 4, 4], actual: vec![4, 4, 5] };
        assert_eq!(err.to_string(), "shape mismatch: expected [4, 4, 4], got [4, 4, 5]");
    }
}
