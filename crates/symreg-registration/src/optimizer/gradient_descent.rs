//! Bounded gradient descent with an adaptive step length.
//!
//! Parameters are moved along the normalised weighted negative gradient by
//! a step measured in mm. An accepted move lengthens the step, a rejected
//! one shortens it; the level ends once the step falls below its floor.

/// Step growth after an accepted move.
pub const STEP_GROWTH: f64 = 1.2;
/// Step shrink after a rejected move.
pub const STEP_SHRINK: f64 = 0.5;

/// Adaptive-step gradient descent state for one level.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    step: f64,
    initial_step: f64,
    min_step: f64,
    weights: Vec<f64>,
}

impl GradientDescent {
    /// Create with an initial step, a step floor and per-parameter weights.
    pub fn new(initial_step: f64, min_step: f64, weights: Vec<f64>) -> Self {
        Self {
            step: initial_step,
            initial_step,
            min_step,
            weights,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Restart from the initial step, e.g. for a repetition.
    pub fn reset(&mut self) {
        self.step = self.initial_step;
    }

    /// Whether the step has collapsed below its floor.
    pub fn converged(&self) -> bool {
        self.step < self.min_step
    }

    /// Unit descent direction `-W g / |W g|`, or `None` for a zero gradient.
    pub fn direction(&self, gradient: &[f64]) -> Option<Vec<f64>> {
        let weighted: Vec<f64> = gradient.iter().zip(&self.weights).map(|(g, w)| g * w).collect();
        let norm = weighted.iter().map(|v| v * v).sum::<f64>().sqrt();
        if !(norm > 0.0) || !norm.is_finite() {
            return None;
        }
        Some(weighted.iter().map(|v| -v / norm).collect())
    }

    /// Parameter update for the current step along `direction`.
    pub fn displacement(&self, direction: &[f64]) -> Vec<f64> {
        direction.iter().map(|d| d * self.step).collect()
    }

    pub fn accept(&mut self) {
        self.step *= STEP_GROWTH;
    }

    pub fn reject(&mut self) {
        self.step *= STEP_SHRINK;
    }
}
