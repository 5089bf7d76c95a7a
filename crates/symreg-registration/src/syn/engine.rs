//! Symmetric diffeomorphic (SyN-style) registration in the midway space.
//!
//! Both images are pulled into a common midway space through the linear
//! halves and their own displacement fields: `I1(m) = im1(H(m + u1(m)))`
//! and `I2(m) = im2(H^-1(m + u2(m)))`. Each iteration computes a symmetric
//! demons force from the mean-squared difference, pushes `u1` and `u2` in
//! opposite directions, and regularises by Gaussian smoothing of both the
//! update and the accumulated field. Inverse fields are recovered by
//! fixed-point inversion at the end.

use burn::tensor::backend::Backend;
use nalgebra::Vector3;
use rayon::prelude::*;
use symreg_core::filter::{downsample, resample_mask};
use symreg_core::transform::compose_linear_displacement;
use symreg_core::{DisplacementField, ImageGrid, LinearTransform, Volume};

use super::bundle::WarpBundle;
use super::config::SynConfig;
use super::warp::{gradient, warp_volume};
use crate::error::{RegistrationError, Result};
use crate::linear::LevelReport;
use crate::progress::ProgressTracker;
use crate::reorient::Reorienter;
use crate::validation::{validate_image_pair, validate_mask, ConvergenceChecker};

const STAGE: &str = "syn";
/// Guards the demons denominator in flat, matched regions.
const DEMONS_EPSILON: f64 = 1e-12;

/// Result of a nonlinear stage.
#[derive(Debug, Clone)]
pub struct SynResult {
    pub bundle: WarpBundle,
    /// Final mean-squared midway difference.
    pub cost: f64,
    pub levels: Vec<LevelReport>,
}

/// Bounding grid of both images mapped into midway space, with the mean of
/// their voxel sizes and identity orientation.
pub fn midway_grid(grid1: &ImageGrid, grid2: &ImageGrid, linear: &LinearTransform) -> Result<ImageGrid> {
    let mut corners = Vec::with_capacity(16);
    corners.extend(grid1.corners().iter().map(|p| linear.apply_half_inverse(p)));
    corners.extend(grid2.corners().iter().map(|p| linear.apply_half(p)));
    let spacing = 0.5 * (grid1.mean_spacing() + grid2.mean_spacing());
    Ok(ImageGrid::bounding(&corners, spacing)?)
}

struct LevelImages {
    im1: Volume,
    im2: Volume,
    mask1: Option<Volume>,
    mask2: Option<Volume>,
}

struct DemonsStep {
    cost: f64,
    count: usize,
    update1: DisplacementField,
    update2: DisplacementField,
}

/// Nonlinear registration of image 1 (moving) and image 2 (template)
/// towards each other.
pub struct SynRegistration {
    config: SynConfig,
    reorienter: Option<Reorienter>,
    tracker: ProgressTracker,
}

impl SynRegistration {
    /// Create a stage from a validated configuration.
    pub fn new(config: SynConfig) -> Self {
        Self {
            config,
            reorienter: None,
            tracker: ProgressTracker::new(),
        }
    }

    /// Reorient warped SH images by the local Jacobian of each warp.
    pub fn with_reorienter(mut self, reorienter: Reorienter) -> Self {
        self.reorienter = Some(reorienter);
        self
    }

    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn config(&self) -> &SynConfig {
        &self.config
    }

    /// Run the stage starting from `linear`, or from `resume` when a saved
    /// bundle is given; the bundle then supplies both the linear part and
    /// the midway grid.
    #[allow(clippy::too_many_arguments)]
    pub fn execute<B: Backend>(
        &mut self,
        im1: &Volume,
        im2: &Volume,
        mask1: Option<&Volume>,
        mask2: Option<&Volume>,
        linear: &LinearTransform,
        resume: Option<&WarpBundle>,
        device: &B::Device,
    ) -> Result<SynResult> {
        validate_image_pair(im1, im2)?;
        if let Some(m) = mask1 {
            validate_mask("mask1", m, im1.grid())?;
        }
        if let Some(m) = mask2 {
            validate_mask("mask2", m, im2.grid())?;
        }

        let (linear, midway) = match resume {
            Some(bundle) => (bundle.linear().clone(), bundle.grid().clone()),
            None => (linear.clone(), midway_grid(im1.grid(), im2.grid(), linear)?),
        };
        let half = linear.half()?;
        let half_inverse = linear.half_inverse()?;
        tracing::info!(
            "Midway grid {:?} at {:.3} mm",
            midway.size(),
            midway.spacing()[0]
        );

        let (mut u1, mut u2) = match resume {
            Some(bundle) => (bundle.im1_forward().clone(), bundle.im2_forward().clone()),
            None => (
                DisplacementField::zeros(midway.clone()),
                DisplacementField::zeros(midway.clone()),
            ),
        };

        let config = &self.config;
        self.tracker.start(STAGE, config.levels());
        let mut levels = Vec::with_capacity(config.levels());
        let mut cost = f64::INFINITY;

        for (level, &scale) in config.scale_factors.iter().enumerate() {
            let niter = config.iterations[level];
            self.tracker.level(level, niter);
            tracing::info!(
                "Starting {} level {}/{} (scale {}, {} iterations)",
                STAGE,
                level + 1,
                config.levels(),
                scale,
                niter
            );

            let grid = if scale >= 1.0 { midway.clone() } else { midway.scaled(scale)? };
            if !u1.grid().same_geometry(&grid, 1e-9) {
                u1 = u1.resample_to(&grid);
                u2 = u2.resample_to(&grid);
            }
            let images = LevelImages {
                im1: downsample::<B>(im1, scale, device)?,
                im2: downsample::<B>(im2, scale, device)?,
                mask1: mask1.map(|m| resample_mask::<B>(m, scale, device)).transpose()?,
                mask2: mask2.map(|m| resample_mask::<B>(m, scale, device)).transpose()?,
            };
            let max_step = config.grad_step * grid.mean_spacing();

            let checker = ConvergenceChecker::new(1e-6, config.patience);
            let mut history = Vec::with_capacity(niter + 1);
            let mut best: Option<(f64, DisplacementField, DisplacementField)> = None;
            let mut iterations = 0;

            for iter in 0..=niter {
                let step = self.demons_step(&images, &half, &half_inverse, &u1, &u2)?;
                if step.count == 0 {
                    return Err(RegistrationError::numerical_degeneracy(format!(
                        "{STAGE} level {}: no midway voxel maps inside both images",
                        level + 1
                    )));
                }
                history.push(step.cost);
                if best.as_ref().map_or(true, |(c, _, _)| step.cost < *c) {
                    best = Some((step.cost, u1.clone(), u2.clone()));
                }
                if iter > 0 {
                    self.tracker.update(iter, Some(niter), step.cost, max_step);
                }
                if iter == niter || checker.check_convergence(&history) {
                    break;
                }
                iterations += 1;

                let mut update1 = step.update1.smoothed::<B>(config.update_smooth, device)?;
                let mut update2 = step.update2.smoothed::<B>(config.update_smooth, device)?;
                let largest = update1.max_norm().max(update2.max_norm());
                if !(largest > 0.0) {
                    tracing::debug!("{} level {}: zero update at iteration {}", STAGE, level + 1, iter + 1);
                    break;
                }
                let factor = max_step / largest;
                update1.scale(factor);
                update2.scale(factor);
                u1 = u1.compose_update(&update1)?.smoothed::<B>(config.disp_smooth, device)?;
                u2 = u2.compose_update(&update2)?.smoothed::<B>(config.disp_smooth, device)?;
            }

            let (level_cost, b1, b2) = best.ok_or_else(|| {
                RegistrationError::numerical_degeneracy(format!("{STAGE} level {}: no evaluation", level + 1))
            })?;
            u1 = b1;
            u2 = b2;
            tracing::info!(
                "{} level {} done: cost {:.6} -> {:.6}",
                STAGE,
                level + 1,
                history[0],
                level_cost
            );
            cost = level_cost;
            let report = LevelReport {
                scale,
                iterations,
                initial_cost: history[0],
                final_cost: level_cost,
            };
            if !report.improved() {
                tracing::warn!(
                    "{} level {}: no update improved the cost ({:.6}) in {} iterations",
                    STAGE,
                    level + 1,
                    history[0],
                    iterations
                );
            }
            levels.push(report);
        }

        if !u1.grid().same_geometry(&midway, 1e-9) {
            u1 = u1.resample_to(&midway);
            u2 = u2.resample_to(&midway);
        }
        let iterations = config.inverse_iterations;
        let u1_inverse = u1.invert(resume.map(|b| b.im1_inverse()), iterations)?;
        let u2_inverse = u2.invert(resume.map(|b| b.im2_inverse()), iterations)?;
        let bundle = WarpBundle::new(linear, u1, u1_inverse, u2, u2_inverse)?;
        tracing::info!("Warp round-trip error {:.4} mm", bundle.round_trip_error());

        self.tracker.complete(cost);
        Ok(SynResult { bundle, cost, levels })
    }

    /// Warp both level images into midway space and compute the symmetric
    /// demons update of each field.
    fn demons_step(
        &self,
        images: &LevelImages,
        half: &LinearTransform,
        half_inverse: &LinearTransform,
        u1: &DisplacementField,
        u2: &DisplacementField,
    ) -> Result<DemonsStep> {
        let deform1 = compose_linear_displacement(half, u1);
        let deform2 = compose_linear_displacement(half_inverse, u2);
        let mut warped1 = warp_volume(&images.im1, images.mask1.as_ref(), &deform1)?;
        let mut warped2 = warp_volume(&images.im2, images.mask2.as_ref(), &deform2)?;
        if let Some(r) = &self.reorienter {
            r.reorient_warp(&mut warped1.volume, &deform1)?;
            r.reorient_warp(&mut warped2.volume, &deform2)?;
        }

        let components = warped1.volume.components();
        let grads1: Vec<Vec<Vector3<f64>>> = (0..components).map(|c| gradient(&warped1.volume, c)).collect();
        let grads2: Vec<Vec<Vector3<f64>>> = (0..components).map(|c| gradient(&warped2.volume, c)).collect();
        let (w1, w2) = (&warped1, &warped2);

        let per_voxel: Vec<(Vector3<f64>, Option<f64>)> = (0..u1.grid().num_voxels())
            .into_par_iter()
            .map(|i| {
                if !(w1.valid[i] && w2.valid[i]) {
                    return (Vector3::zeros(), None);
                }
                let mut numerator = Vector3::zeros();
                let mut denominator = 0.0;
                let mut squared = 0.0;
                for c in 0..components {
                    let diff = w1.volume.component(c)[i] - w2.volume.component(c)[i];
                    let g = 0.5 * (grads1[c][i] + grads2[c][i]);
                    numerator += g * diff;
                    denominator += g.norm_squared() + diff * diff;
                    squared += diff * diff;
                }
                let delta = if denominator > DEMONS_EPSILON {
                    numerator / denominator
                } else {
                    Vector3::zeros()
                };
                (delta, Some(squared / components as f64))
            })
            .collect();

        let (sum, count) = per_voxel
            .iter()
            .filter_map(|(_, c)| *c)
            .fold((0.0, 0usize), |(s, n), c| (s + c, n + 1));
        let forward: Vec<Vector3<f64>> = per_voxel.iter().map(|(d, _)| -d).collect();
        let backward: Vec<Vector3<f64>> = per_voxel.iter().map(|(d, _)| *d).collect();
        Ok(DemonsStep {
            cost: if count > 0 { sum / count as f64 } else { f64::INFINITY },
            count,
            update1: DisplacementField::new(u1.grid().clone(), forward)?,
            update2: DisplacementField::new(u2.grid().clone(), backward)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syn::config::SynConfig;
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;
    use nalgebra::Matrix3;

    type TestBackend = NdArray<f32>;

    fn blob(grid: &ImageGrid, centre: Vector3<f64>) -> Volume {
        Volume::from_fn(grid.clone(), |p| {
            let d = p - centre;
            (-d.norm_squared() / 8.0).exp()
        })
    }

    fn config(iterations: usize) -> SynConfig {
        SynConfig {
            scale_factors: vec![1.0],
            iterations: vec![iterations],
            ..SynConfig::default()
        }
        .validate(false)
        .unwrap()
    }

    #[test]
    fn test_midway_grid_of_identity_matches_input() {
        let grid = ImageGrid::with_shape([6, 7, 8]).unwrap();
        let midway = midway_grid(&grid, &grid, &LinearTransform::identity()).unwrap();
        assert_eq!(midway.shape(), grid.shape());
        assert_relative_eq!(midway.origin().coords(), grid.origin().coords(), epsilon = 1e-9);
    }

    #[test]
    fn test_midway_grid_lies_between_shifted_images() {
        let grid = ImageGrid::with_shape([8, 8, 8]).unwrap();
        let linear = LinearTransform::new(Matrix3::identity(), Vector3::new(4.0, 0.0, 0.0), Vector3::zeros()).unwrap();
        let midway = midway_grid(&grid, &grid, &linear).unwrap();
        // H shifts by 2 and H^-1 by -2: the union spans 4 voxels more along x.
        assert_eq!(midway.size(), [12, 8, 8]);
        assert_relative_eq!(midway.origin().coords()[0], -2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_identical_images_leave_fields_at_zero() {
        let grid = ImageGrid::with_shape([10, 10, 10]).unwrap();
        let im = blob(&grid, grid.centre());
        let device = Default::default();
        let result = SynRegistration::new(config(5))
            .execute::<TestBackend>(&im, &im, None, None, &LinearTransform::identity(), None, &device)
            .unwrap();
        assert!(result.cost < 1e-12);
        assert!(result.bundle.im1_forward().max_norm() < 1e-9);
        assert!(result.bundle.im2_forward().max_norm() < 1e-9);
        assert!(result.bundle.round_trip_error() < 1e-9);
        assert!(!result.levels[0].improved());
    }

    #[test]
    fn test_shifted_blobs_meet_in_the_middle() {
        let grid = ImageGrid::with_shape([12, 12, 12]).unwrap();
        let c = grid.centre();
        let im1 = blob(&grid, c + Vector3::new(0.75, 0.0, 0.0));
        let im2 = blob(&grid, c - Vector3::new(0.75, 0.0, 0.0));
        let device = Default::default();
        let result = SynRegistration::new(config(30))
            .execute::<TestBackend>(&im1, &im2, None, None, &LinearTransform::identity(), None, &device)
            .unwrap();
        let level = &result.levels[0];
        assert!(level.final_cost < 0.5 * level.initial_cost, "{:?}", level);

        // Symmetry: the two forward fields point in opposite directions.
        let u1 = result.bundle.im1_forward().sample(&c);
        let u2 = result.bundle.im2_forward().sample(&c);
        assert!(u1[0] > 0.0 && u2[0] < 0.0, "u1 {u1:?} u2 {u2:?}");
        // Mirror-symmetric inputs: equal and opposite displacement.
        assert!((u1[0] + u2[0]).abs() < 0.02 * u1[0].abs(), "u1 {u1:?} u2 {u2:?}");
        assert!(u1[1].abs() < 1e-6 && u2[1].abs() < 1e-6);
        assert!(result.bundle.round_trip_error() < 0.1);
    }

    #[test]
    fn test_resume_keeps_bundle_grid() {
        let grid = ImageGrid::with_shape([8, 8, 8]).unwrap();
        let im = blob(&grid, grid.centre());
        let start = WarpBundle::identity(LinearTransform::identity(), &grid);
        let device = Default::default();
        let config = SynConfig {
            iterations: vec![3],
            ..SynConfig::default()
        }
        .validate(true)
        .unwrap();
        let result = SynRegistration::new(config)
            .execute::<TestBackend>(&im, &im, None, None, &LinearTransform::identity(), Some(&start), &device)
            .unwrap();
        assert_eq!(result.levels.len(), 1);
        assert_eq!(result.bundle.grid().shape(), grid.shape());
    }

    #[test]
    fn test_disjoint_masks_are_degenerate() {
        let grid = ImageGrid::with_shape([6, 6, 6]).unwrap();
        let im = blob(&grid, grid.centre());
        let mask = Volume::zeros(grid, 1);
        let device = Default::default();
        let err = SynRegistration::new(config(2))
            .execute::<TestBackend>(&im, &im, Some(&mask), None, &LinearTransform::identity(), None, &device)
            .unwrap_err();
        assert!(err.is_numerical_degeneracy());
    }
}
