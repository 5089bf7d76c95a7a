//! Configuration of the symmetric nonlinear stage.

use crate::error::{RegistrationError, Result};
use crate::validation::{expand_iterations, validate_non_negative, validate_positive, validate_scale_factors};

/// Default per-level iteration cap.
pub const DEFAULT_SYN_ITERATIONS: usize = 50;

/// Immutable configuration of a SyN stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SynConfig {
    /// Scale factors, coarsest first.
    pub scale_factors: Vec<f64>,
    /// Iteration cap per level.
    pub iterations: Vec<usize>,
    /// Gaussian smoothing of each update, in voxels.
    pub update_smooth: f64,
    /// Gaussian smoothing of the composed fields, in voxels.
    pub disp_smooth: f64,
    /// Largest update per iteration, in mean voxel sizes.
    pub grad_step: f64,
    /// Non-improving iterations tolerated before a level stops.
    pub patience: usize,
    /// Fixed-point iterations used to invert the fields.
    pub inverse_iterations: usize,
}

impl Default for SynConfig {
    fn default() -> Self {
        Self {
            scale_factors: vec![0.25, 0.5, 1.0],
            iterations: vec![DEFAULT_SYN_ITERATIONS],
            update_smooth: 2.0,
            disp_smooth: 1.0,
            grad_step: 0.5,
            patience: 5,
            inverse_iterations: 10,
        }
    }
}

impl SynConfig {
    pub fn levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Validate and expand per-level lists.
    ///
    /// When resuming from a saved bundle exactly one full-resolution level
    /// runs: a longer scale list is replaced by `[1.0]` (the caller warns),
    /// a longer iteration list is an error.
    pub fn validate(mut self, resuming: bool) -> Result<Self> {
        validate_scale_factors("syn_scale", &self.scale_factors)?;
        if resuming {
            if self.iterations.len() > 1 {
                return Err(RegistrationError::invalid_configuration(
                    "syn_niter: only a single level is run when resuming from syn_init, \
                     so a single iteration count is required",
                ));
            }
            self.scale_factors = vec![1.0];
        }
        self.iterations = expand_iterations("syn_niter", &self.iterations, self.levels())?;
        validate_non_negative("syn_update_smooth", self.update_smooth)?;
        validate_non_negative("syn_disp_smooth", self.disp_smooth)?;
        validate_positive("syn_grad_step", self.grad_step)?;
        if self.patience == 0 || self.inverse_iterations == 0 {
            return Err(RegistrationError::invalid_configuration(
                "syn patience and inverse iterations must be positive",
            ));
        }
        Ok(self)
    }
}
