use burn::tensor::backend::Backend;

use super::gaussian::GaussianFilter;
use super::resample::ResampleImageFilter;
use crate::error::Result;
use crate::image::{Image, Volume};
use crate::interpolation::LinearInterpolator;
use crate::transform::LinearTransform;

/// Multi-resolution image pyramid over fractional scale factors.
///
/// Levels are stored in the order the factors were given, which is
/// coarsest first for a registration schedule.
pub struct MultiResolutionPyramid {
    levels: Vec<Volume>,
    factors: Vec<f64>,
}

impl MultiResolutionPyramid {
    /// Build one level per scale factor.
    pub fn new<B: Backend>(input: &Volume, factors: &[f64], device: &B::Device) -> Result<Self> {
        let levels = factors
            .iter()
            .map(|&factor| downsample::<B>(input, factor, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            levels,
            factors: factors.to_vec(),
        })
    }

    pub fn get_level(&self, level: usize) -> &Volume {
        &self.levels[level]
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn factor(&self, level: usize) -> f64 {
        self.factors[level]
    }

    /// Scale factors `1/2^(levels-1), ..., 1/2, 1`.
    pub fn default_schedule(levels: usize) -> Vec<f64> {
        (0..levels)
            .map(|i| 0.5f64.powi((levels - 1 - i) as i32))
            .collect()
    }
}

/// Smooth with `sigma = 0.5 * spacing / factor` mm and resample onto the
/// scaled grid. A factor of one returns the input unchanged.
pub fn downsample<B: Backend>(input: &Volume, factor: f64, device: &B::Device) -> Result<Volume> {
    if (factor - 1.0).abs() < 1e-12 {
        return Ok(input.clone());
    }
    let grid = input.grid();
    let target = grid.scaled(factor)?;
    let sigmas: Vec<f64> = (0..3).map(|axis| 0.5 * grid.spacing()[axis] / factor).collect();
    let smoother = GaussianFilter::<B>::new(sigmas);
    let resampler = ResampleImageFilter::<B, _, _>::from_grid(
        &target,
        LinearTransform::identity(),
        LinearInterpolator::new(),
    );

    let images: Vec<Image<B, 3>> = input
        .to_images::<B>(device)
        .iter()
        .map(|image| resampler.apply(&smoother.apply(image)))
        .collect();
    Volume::from_images(&images)
}

/// Resample without smoothing, for masks.
pub fn resample_mask<B: Backend>(mask: &Volume, factor: f64, device: &B::Device) -> Result<Volume> {
    if (factor - 1.0).abs() < 1e-12 {
        return Ok(mask.clone());
    }
    let target = mask.grid().scaled(factor)?;
    ResampleImageFilter::<B, _, _>::from_grid(&target, LinearTransform::identity(), LinearInterpolator::new())
        .apply_volume(mask, device)
}
