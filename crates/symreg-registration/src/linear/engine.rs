//! Multi-resolution gradient descent of a linear transform.

use burn::backend::Autodiff;
use burn::tensor::backend::{AutodiffBackend, Backend};
use symreg_core::filter::{downsample, resample_mask};
use symreg_core::{LinearTransform, Volume};

use super::config::LinearConfig;
use super::cost::{CostFunction, CostOptions, LevelImages};
use super::global_search::global_search;
use super::init::initialise;
use super::params::apply_step;
use crate::error::{RegistrationError, Result};
use crate::optimizer::GradientDescent;
use crate::progress::ProgressTracker;
use crate::reorient::Reorienter;
use crate::validation::{validate_image_pair, validate_mask, ConvergenceChecker};

/// Step floor relative to the level's mean voxel size.
const MIN_STEP_FRACTION: f64 = 1e-3;

/// Outcome of one level.
#[derive(Debug, Clone)]
pub struct LevelReport {
    pub scale: f64,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

impl LevelReport {
    /// Whether the level lowered the cost at all.
    pub fn improved(&self) -> bool {
        self.final_cost < self.initial_cost
    }
}

/// Result of a linear stage.
#[derive(Debug, Clone)]
pub struct LinearResult {
    pub transform: LinearTransform,
    pub cost: f64,
    pub levels: Vec<LevelReport>,
}

/// Rigid or affine registration of image 1 (moving) to image 2 (template).
///
/// The estimated transform maps template points into moving space.
pub struct LinearRegistration {
    config: LinearConfig,
    reorienter: Option<Reorienter>,
    tracker: ProgressTracker,
}

impl LinearRegistration {
    /// Create a stage from a validated configuration.
    pub fn new(config: LinearConfig) -> Self {
        Self {
            config,
            reorienter: None,
            tracker: ProgressTracker::new(),
        }
    }

    /// Reorient SH samples of both images by the linear part of the half
    /// transform that pulls them into midway space.
    pub fn with_reorienter(mut self, reorienter: Reorienter) -> Self {
        self.reorienter = Some(reorienter);
        self
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Run the stage. Gradients are taken on `Autodiff<B>`.
    pub fn execute<B: Backend>(
        &mut self,
        im1: &Volume,
        im2: &Volume,
        mask1: Option<&Volume>,
        mask2: Option<&Volume>,
        device: &B::Device,
    ) -> Result<LinearResult> {
        validate_image_pair(im1, im2)?;
        if let Some(m) = mask1 {
            validate_mask("mask1", m, im1.grid())?;
        }
        if let Some(m) = mask2 {
            validate_mask("mask2", m, im2.grid())?;
        }
        let config = &self.config;
        let stage = config.model.name();
        let weights = config.optimiser_weights();

        let mut transform = initialise(config.init, config.seed.as_ref(), im1, im2, mask1, mask2)?;
        self.tracker.start(stage, config.levels());

        let mut levels = Vec::with_capacity(config.levels());
        let mut cost = f64::INFINITY;
        for (level, &scale) in config.scale_factors.iter().enumerate() {
            let niter = config.iterations[level];
            self.tracker.level(level, niter);
            tracing::info!(
                "Starting {} level {}/{} (scale {}, {} iterations)",
                stage,
                level + 1,
                config.levels(),
                scale,
                niter
            );

            let l1 = downsample::<B>(im1, scale, device)?;
            let l2 = downsample::<B>(im2, scale, device)?;
            let lm1 = mask1.map(|m| resample_mask::<B>(m, scale, device)).transpose()?;
            let lm2 = mask2.map(|m| resample_mask::<B>(m, scale, device)).transpose()?;
            let images = LevelImages {
                im1: &l1,
                im2: &l2,
                mask1: lm1.as_ref(),
                mask2: lm2.as_ref(),
            };
            let spacing = l2.grid().mean_spacing();
            let options = CostOptions {
                model: config.model,
                reorienter: self.reorienter.as_ref(),
                combiner: config.combiner,
                density: config.loop_density[level],
                level,
                radius: l2.grid().radius().max(spacing),
            };
            let build = |start: &LinearTransform| {
                config
                    .build_metric::<Autodiff<B>>(im1.components())
                    .and_then(|metric| CostFunction::new(images, metric, options, start, device))
            };

            let mut cost_fn = build(&transform)?;
            if level == 0 && config.global_search {
                transform = global_search(&cost_fn, &transform)?;
                cost_fn = build(&transform)?;
            }

            let mut optimiser = GradientDescent::new(spacing, MIN_STEP_FRACTION * spacing, weights.clone());
            let mut current = cost_fn.evaluate(&transform);
            if !current.is_valid() {
                return Err(RegistrationError::numerical_degeneracy(format!(
                    "{stage} level {}: no midway voxel maps inside both images and masks",
                    level + 1
                )));
            }
            let initial_cost = current.cost;
            let mut iterations = 0;
            let mut accepted = 0;

            for repetition in 0..config.repetitions[level] {
                optimiser.reset();
                let checker = ConvergenceChecker::new(1e-6, 30);
                let mut history = vec![current.cost];
                for iter in 1..=niter {
                    iterations += 1;
                    let Some(direction) = optimiser.direction(&current.gradient) else {
                        tracing::debug!("{} level {}: zero gradient at iteration {}", stage, level + 1, iter);
                        break;
                    };
                    let step = optimiser.displacement(&direction);
                    match try_step(&cost_fn, &transform, &step, current.cost) {
                        Some(candidate) => {
                            current = cost_fn.evaluate(&candidate);
                            transform = candidate;
                            accepted += 1;
                            optimiser.accept();
                        }
                        None => optimiser.reject(),
                    }
                    self.tracker.update(iter, Some(niter), current.cost, optimiser.step());
                    history.push(current.cost);
                    if optimiser.converged() || checker.check_convergence(&history) {
                        tracing::debug!(
                            "{} level {} repetition {}: converged after {} iterations",
                            stage,
                            level + 1,
                            repetition + 1,
                            iter
                        );
                        break;
                    }
                }
            }

            tracing::info!(
                "{} level {} done: cost {:.6} -> {:.6} ({} accepted steps)",
                stage,
                level + 1,
                initial_cost,
                current.cost,
                accepted
            );
            cost = current.cost;
            let report = LevelReport {
                scale,
                iterations,
                initial_cost,
                final_cost: current.cost,
            };
            if !report.improved() {
                tracing::warn!(
                    "{} level {}: no step improved the cost ({:.6}) in {} iterations",
                    stage,
                    level + 1,
                    initial_cost,
                    iterations
                );
            }
            levels.push(report);
        }

        self.tracker.complete(cost);
        Ok(LinearResult {
            transform,
            cost,
            levels,
        })
    }
}

/// Candidate after `step`; `None` when it is degenerate or does not lower
/// the cost.
fn try_step<A: AutodiffBackend>(
    cost_fn: &CostFunction<'_, A>,
    transform: &LinearTransform,
    step: &[f64],
    current: f64,
) -> Option<LinearTransform> {
    let candidate = apply_step(cost_fn.model(), transform, step, cost_fn.radius()).ok()?;
    let cost = cost_fn.cost(&candidate);
    (cost.is_finite() && cost < current).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::config::InitPolicy;
    use burn_ndarray::NdArray;
    use symreg_core::ImageGrid;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_masked_out_template_is_an_error() {
        let grid = ImageGrid::with_shape([8, 8, 8]).unwrap();
        let im = Volume::from_fn(grid.clone(), |p| p[0]);
        let mask = Volume::zeros(grid, 1);
        let mut config = LinearConfig::rigid();
        config.scale_factors = vec![1.0];
        config.init = InitPolicy::Identity;
        let config = config.validate(1).unwrap();
        let device = Default::default();
        let err = LinearRegistration::new(config)
            .execute::<TestBackend>(&im, &im, None, Some(&mask), &device)
            .unwrap_err();
        assert!(err.is_numerical_degeneracy());
    }

    #[test]
    fn test_self_registration_stays_at_identity() {
        let grid = ImageGrid::with_shape([12, 12, 12]).unwrap();
        let c = grid.centre();
        let im = Volume::from_fn(grid, |p| {
            let d = p - c;
            (-(d[0] * d[0] / 10.0 + d[1] * d[1] / 6.0 + d[2] * d[2] / 4.0)).exp()
        });
        let mut config = LinearConfig::affine();
        config.scale_factors = vec![0.5, 1.0];
        config.iterations = vec![20];
        let config = config.validate(1).unwrap();
        let device = Default::default();
        let result = LinearRegistration::new(config)
            .execute::<TestBackend>(&im, &im, None, None, &device)
            .unwrap();
        assert!(result.cost < 1e-8);
        assert!(result.transform.translation().norm() < 1e-3);
        assert_eq!(result.levels.len(), 2);
        assert!(result.levels.iter().all(|level| !level.improved()));
    }
}
