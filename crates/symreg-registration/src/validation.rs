//! Validation utilities for registration operations.
//!
//! Every check here runs before a stage starts iterating, so a bad option
//! never costs a resampling pass.

use symreg_core::{ImageGrid, Volume};

use crate::error::{RegistrationError, Result};

/// Validate a multi-resolution scale schedule.
pub fn validate_scale_factors(option: &str, factors: &[f64]) -> Result<()> {
    if factors.is_empty() {
        return Err(RegistrationError::invalid_configuration(format!(
            "{option}: at least one scale factor is required"
        )));
    }
    for &f in factors {
        if !f.is_finite() || f <= 0.0 || f > 1.0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "{option}: scale factors must lie in (0, 1], got {f}"
            )));
        }
    }
    Ok(())
}

/// Validate iteration count.
pub fn validate_iterations(iterations: usize) -> Result<()> {
    if iterations == 0 {
        return Err(RegistrationError::invalid_configuration(
            "Iterations must be positive",
        ));
    }

    if iterations > 1_000_000 {
        return Err(RegistrationError::invalid_configuration(format!(
            "Iterations too large: {}",
            iterations
        )));
    }

    Ok(())
}

/// Expand a per-level iteration list against the number of levels.
///
/// A single entry applies to every level; otherwise the lengths must agree.
pub fn expand_iterations(option: &str, niter: &[usize], levels: usize) -> Result<Vec<usize>> {
    for &n in niter {
        validate_iterations(n)?;
    }
    match niter.len() {
        1 => Ok(vec![niter[0]; levels]),
        n if n == levels => Ok(niter.to_vec()),
        n => Err(RegistrationError::invalid_configuration(format!(
            "{option}: {n} iteration entries for {levels} scale levels"
        ))),
    }
}

/// Validate a positive step or smoothing parameter.
pub fn validate_positive(option: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "{option} must be positive, got {value}"
        )));
    }
    Ok(())
}

/// Validate a non-negative smoothing parameter.
pub fn validate_non_negative(option: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(RegistrationError::invalid_configuration(format!(
            "{option} must not be negative, got {value}"
        )));
    }
    Ok(())
}

/// Validate the fraction of voxels sampled per iteration.
pub fn validate_loop_density(density: &[f64]) -> Result<()> {
    for &d in density {
        if !d.is_finite() || d <= 0.0 || d > 1.0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "loop density must lie in (0, 1], got {d}"
            )));
        }
    }
    Ok(())
}

/// Validate that two input volumes can be registered.
pub fn validate_image_pair(moving: &Volume, template: &Volume) -> Result<()> {
    if moving.components() != template.components() {
        return Err(RegistrationError::dimension_mismatch(format!(
            "input images have {} and {} volumes",
            moving.components(),
            template.components()
        )));
    }
    Ok(())
}

/// Validate that a mask lies on its image's grid.
pub fn validate_mask(name: &str, mask: &Volume, image: &ImageGrid) -> Result<()> {
    if mask.components() != 1 {
        return Err(RegistrationError::invalid_configuration(format!(
            "{name} must have a single volume, got {}",
            mask.components()
        )));
    }
    if mask.grid().shape() != image.shape() {
        return Err(RegistrationError::ShapeMismatch {
            expected: image.shape().to_vec(),
            actual: mask.grid().shape().to_vec(),
        });
    }
    Ok(())
}

/// Check for convergence based on loss history.
#[derive(Debug, Clone)]
pub struct ConvergenceChecker {
    /// Minimum relative improvement to keep going.
    pub min_improvement: f64,
    /// Number of iterations to check for improvement.
    pub patience: usize,
}

impl Default for ConvergenceChecker {
    fn default() -> Self {
        Self {
            min_improvement: 1e-6,
            patience: 50,
        }
    }
}

impl ConvergenceChecker {
    /// Create a new convergence checker.
    pub fn new(min_improvement: f64, patience: usize) -> Self {
        Self {
            min_improvement,
            patience,
        }
    }

    /// Check if converged based on loss history.
    ///
    /// Converged when the loss over the last `patience` iterations improved
    /// by less than `min_improvement` relative to the best before them.
    pub fn check_convergence(&self, loss_history: &[f64]) -> bool {
        if loss_history.len() < self.patience + 1 {
            return false;
        }

        let split = loss_history.len() - self.patience;
        let before = loss_history[..split].iter().cloned().fold(f64::INFINITY, f64::min);
        let recent = loss_history[split..].iter().cloned().fold(f64::INFINITY, f64::min);

        let relative_improvement = (before - recent) / (before.abs() + 1e-10);
        relative_improvement < self.min_improvement
    }
}
