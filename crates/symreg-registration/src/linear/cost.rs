//! Symmetric cost of a linear transform at one level.
//!
//! Both images are pulled into the midway space through the half transform
//! `H` of the current estimate: image 1 is sampled at `H(m)` and image 2 at
//! `H^-1(m)`. The midway sample points are chosen once per level (voxels
//! whose images land inside both images and both masks, thinned by the loop
//! density) and the images are sampled with clamped borders, so the cost is
//! continuous in the parameters.
//!
//! The cost is a burn forward on an autodiff backend. Gradients are taken
//! with `backward()` at zero perturbation of `H`, one region of the support
//! at a time, and the regions are reduced with the configured
//! [`GradientCombiner`].

use std::ops::Range;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use nalgebra::Vector3;
use rayon::prelude::*;
use symreg_core::interpolation::{Interpolator, LinearInterpolator};
use symreg_core::{Image, ImageGrid, LinearTransform, Volume};

use super::config::TransformModel;
use super::params::{parameters, perturbation, HalfFrame};
use crate::error::{RegistrationError, Result};
use crate::metric::SimilarityMetric;
use crate::optimizer::GradientCombiner;
use crate::reorient::Reorienter;
use crate::syn::midway_grid;

/// Support voxels per gradient region.
const REGION_VOXELS: usize = 1 << 14;
/// Regions a support is split into at least, so that the median combiner
/// has something to choose from.
const MIN_REGIONS: usize = 8;

/// Cost and gradient of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Mean cost over the support; infinite when it is empty or degenerate.
    pub cost: f64,
    /// Number of support voxels.
    pub count: usize,
    /// Gradient with respect to the radius-scaled parameters.
    pub gradient: Vec<f64>,
}

impl Evaluation {
    pub fn is_valid(&self) -> bool {
        self.count > 0 && self.cost.is_finite()
    }

    fn invalid(count: usize, parameters: usize) -> Self {
        Self {
            cost: f64::INFINITY,
            count,
            gradient: vec![0.0; parameters],
        }
    }
}

/// Level images and masks of a linear stage.
#[derive(Debug, Clone, Copy)]
pub struct LevelImages<'a> {
    pub im1: &'a Volume,
    pub im2: &'a Volume,
    pub mask1: Option<&'a Volume>,
    pub mask2: Option<&'a Volume>,
}

/// Host-side settings of a [`CostFunction`].
#[derive(Debug, Clone, Copy)]
pub struct CostOptions<'a> {
    pub model: TransformModel,
    pub reorienter: Option<&'a Reorienter>,
    pub combiner: GradientCombiner,
    /// Fraction of midway voxels kept.
    pub density: f64,
    /// Seeds the voxel subsample.
    pub level: usize,
    /// Divides rotation and matrix parameters.
    pub radius: f64,
}

/// Constants of one evaluation, derived from the half transform.
struct SampleFrame<A: AutodiffBackend> {
    half: HalfFrame,
    /// `(M^-1)^T`, for row-vector points.
    inverse: Tensor<A, 2>,
    /// Transposed SH reorientation of image 1 and image 2 samples.
    reorient: Option<(Tensor<A, 2>, Tensor<A, 2>)>,
}

/// Level cost of a linear stage on a fixed midway support.
pub struct CostFunction<'a, A: AutodiffBackend> {
    images1: Vec<Image<A, 3>>,
    images2: Vec<Image<A, 3>>,
    template: ImageGrid,
    metric: Box<dyn SimilarityMetric<A>>,
    options: CostOptions<'a>,
    interpolator: LinearInterpolator,
    /// World offsets of the metric neighbourhood.
    offsets: Vec<Vector3<f64>>,
    support: Vec<Vector3<f64>>,
    regions: Vec<Range<usize>>,
    device: A::Device,
}

impl<'a, A: AutodiffBackend> CostFunction<'a, A> {
    /// Build the level cost, choosing the support around `start`.
    pub fn new(
        images: LevelImages<'_>,
        metric: Box<dyn SimilarityMetric<A>>,
        options: CostOptions<'a>,
        start: &LinearTransform,
        device: &A::Device,
    ) -> Result<Self> {
        if images.im1.components() != images.im2.components() {
            return Err(RegistrationError::dimension_mismatch(format!(
                "image 1 has {} volumes, image 2 has {}",
                images.im1.components(),
                images.im2.components()
            )));
        }
        let midway = midway_grid(images.im1.grid(), images.im2.grid(), start)?;
        let support = select_support(&images, &midway, start, options.density, options.level);
        let regions = split_regions(support.len());
        tracing::debug!(
            "{} support: {} of {} midway voxels in {} regions",
            options.model.name(),
            support.len(),
            midway.num_voxels(),
            regions.len()
        );

        Ok(Self {
            images1: images.im1.to_images(device),
            images2: images.im2.to_images(device),
            template: images.im2.grid().clone(),
            offsets: neighbourhood(&midway, metric.extent()),
            metric,
            options,
            interpolator: LinearInterpolator::clamped(),
            support,
            regions,
            device: device.clone(),
        })
    }

    pub fn model(&self) -> TransformModel {
        self.options.model
    }

    pub fn radius(&self) -> f64 {
        self.options.radius
    }

    /// Grid of image 2 at this level.
    pub fn template(&self) -> &ImageGrid {
        &self.template
    }

    /// Number of midway support voxels.
    pub fn support_size(&self) -> usize {
        self.support.len()
    }

    /// Cost and gradient at `transform`.
    pub fn evaluate(&self, transform: &LinearTransform) -> Evaluation {
        let n = parameters(self.options.model);
        let count = self.support.len();
        let Some(frame) = self.frame(transform) else {
            return Evaluation::invalid(count, n);
        };
        if count == 0 {
            return Evaluation::invalid(count, n);
        }

        let mut total = 0.0;
        let mut regions = Vec::with_capacity(self.regions.len());
        for range in &self.regions {
            let params = Tensor::<A, 1>::zeros([n], &self.device).require_grad();
            let loss = self.forward(&frame, params.clone(), range.clone());
            let grads = loss.backward();
            total += loss.into_scalar().elem::<f64>();
            let gradient = params
                .grad(&grads)
                .map(|g| g.into_data().iter::<f64>().collect())
                .unwrap_or_else(|| vec![0.0; n]);
            regions.push(gradient);
        }

        let cost = total / count as f64;
        if !cost.is_finite() {
            return Evaluation::invalid(count, n);
        }
        let gradient = self
            .options
            .combiner
            .combine(&regions, n)
            .into_iter()
            .map(|g| g / count as f64)
            .collect();
        Evaluation { cost, count, gradient }
    }

    /// Cost alone at `transform`; infinite when undefined.
    pub fn cost(&self, transform: &LinearTransform) -> f64 {
        let count = self.support.len();
        let Some(frame) = self.frame(transform) else {
            return f64::INFINITY;
        };
        if count == 0 {
            return f64::INFINITY;
        }
        let params = Tensor::<A, 1>::zeros([parameters(self.options.model)], &self.device);
        let total: f64 = self
            .regions
            .iter()
            .map(|range| {
                self.forward(&frame, params.clone(), range.clone())
                    .into_scalar()
                    .elem::<f64>()
            })
            .sum();
        let cost = total / count as f64;
        if cost.is_finite() {
            cost
        } else {
            f64::INFINITY
        }
    }

    fn frame(&self, transform: &LinearTransform) -> Option<SampleFrame<A>> {
        let half = HalfFrame::of(transform);
        let inverse = half.matrix.try_inverse()?;
        let inverse_t = inverse.transpose();
        let reorient = self.options.reorienter.map(|r| {
            let m1 = r.matrix(&half.matrix);
            let m2 = r.matrix(&inverse);
            (
                matrix_tensor(m1.ncols(), m1.nrows(), |i, j| m1[(j, i)], &self.device),
                matrix_tensor(m2.ncols(), m2.nrows(), |i, j| m2[(j, i)], &self.device),
            )
        });
        Some(SampleFrame {
            inverse: matrix_tensor(3, 3, |i, j| inverse_t[(i, j)], &self.device),
            half,
            reorient,
        })
    }

    /// Summed cost (`[1]`) of the support voxels in `range`.
    fn forward(&self, frame: &SampleFrame<A>, params: Tensor<A, 1>, range: Range<usize>) -> Tensor<A, 1> {
        let voxels = range.len();
        let samples = self.offsets.len();
        let half = &frame.half;
        let (perturb, translation) = perturbation(self.options.model, params, self.options.radius);
        let perturb_t = perturb.transpose();
        let points: Vec<Vector3<f64>> = self.support[range]
            .iter()
            .flat_map(|m| self.offsets.iter().map(move |o| m + o))
            .collect();

        // H_p(m) = (I + P) M (m - c) + c + t + d
        let y = self.points(points.iter().map(|m| half.matrix * (m - half.centre)));
        let x1 = y.clone() + y.matmul(perturb_t.clone()) + self.row(&(half.centre + half.translation)) + translation.clone();

        // H_p^-1(m) = M^-1 (I - P)(m - c - t - d) + c, to first order in p
        let v = self.points(points.iter().map(|m| m - half.centre - half.translation)) - translation;
        let x2 = (v.clone() - v.matmul(perturb_t)).matmul(frame.inverse.clone()) + self.row(&half.centre);

        let (reorient1, reorient2) = match &frame.reorient {
            Some((r1, r2)) => (Some(r1.clone()), Some(r2.clone())),
            None => (None, None),
        };
        let moving = self.sample(&self.images1, x1, reorient1, voxels, samples);
        let fixed = self.sample(&self.images2, x2, reorient2, voxels, samples);
        self.metric.forward(moving, fixed).sum()
    }

    /// `[voxels, samples, components]` values of `images` at world points.
    fn sample(
        &self,
        images: &[Image<A, 3>],
        points: Tensor<A, 2>,
        reorient: Option<Tensor<A, 2>>,
        voxels: usize,
        samples: usize,
    ) -> Tensor<A, 3> {
        let index = images[0].world_to_index_tensor(points);
        let columns: Vec<Tensor<A, 1>> = images
            .iter()
            .map(|image| self.interpolator.interpolate(image.data(), index.clone()))
            .collect();
        let mut values: Tensor<A, 2> = Tensor::stack(columns, 1);
        if let Some(r) = reorient {
            values = values.matmul(r);
        }
        values.reshape([voxels, samples, images.len()])
    }

    fn points(&self, points: impl Iterator<Item = Vector3<f64>>) -> Tensor<A, 2> {
        let data: Vec<f32> = points.flat_map(|p| [p[0] as f32, p[1] as f32, p[2] as f32]).collect();
        let n = data.len() / 3;
        Tensor::from_data(TensorData::new(data, [n, 3]), &self.device)
    }

    fn row(&self, v: &Vector3<f64>) -> Tensor<A, 2> {
        matrix_tensor(1, 3, |_, j| v[j], &self.device)
    }
}

fn matrix_tensor<A: AutodiffBackend>(
    rows: usize,
    cols: usize,
    entry: impl Fn(usize, usize) -> f64,
    device: &A::Device,
) -> Tensor<A, 2> {
    let data: Vec<f32> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| (i, j)))
        .map(|(i, j)| entry(i, j) as f32)
        .collect();
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

/// Midway voxels that map inside both images and both masks under `start`,
/// in z-slab order.
fn select_support(
    images: &LevelImages<'_>,
    midway: &ImageGrid,
    start: &LinearTransform,
    density: f64,
    level: usize,
) -> Vec<Vector3<f64>> {
    let [nz, ny, nx] = midway.shape();
    let grid1 = images.im1.grid();
    let grid2 = images.im2.grid();
    let slabs: Vec<Vec<Vector3<f64>>> = (0..nz)
        .into_par_iter()
        .map(|z| {
            let mut slab = Vec::new();
            for y in 0..ny {
                for x in 0..nx {
                    if !keep(midway.offset(x, y, z), density, level) {
                        continue;
                    }
                    let m = midway.voxel_to_world(x, y, z);
                    let p1 = start.apply_half(&m);
                    let p2 = start.apply_half_inverse(&m);
                    if grid1.contains_index(&grid1.world_to_index(&p1))
                        && grid2.contains_index(&grid2.world_to_index(&p2))
                        && in_mask(images.mask1, &p1)
                        && in_mask(images.mask2, &p2)
                    {
                        slab.push(m);
                    }
                }
            }
            slab
        })
        .collect();
    slabs.concat()
}

fn in_mask(mask: Option<&Volume>, world: &Vector3<f64>) -> bool {
    match mask {
        None => true,
        Some(m) => matches!(m.sample_world(0, world), Some(v) if v > 0.5),
    }
}

/// Contiguous ranges of roughly equal size covering `n` support voxels.
fn split_regions(n: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return Vec::new();
    }
    let count = n.div_ceil(REGION_VOXELS).max(MIN_REGIONS).min(n);
    let size = n.div_ceil(count);
    (0..n).step_by(size).map(|start| start..(start + size).min(n)).collect()
}

/// World offsets of a cubic neighbourhood with side `extent` on `grid`.
fn neighbourhood(grid: &ImageGrid, extent: usize) -> Vec<Vector3<f64>> {
    let half = (extent / 2) as f64;
    let origin = grid.index_to_world(&Vector3::zeros());
    let mut out = Vec::with_capacity(extent.pow(3));
    for dz in 0..extent {
        for dy in 0..extent {
            for dx in 0..extent {
                let index = Vector3::new(dx as f64 - half, dy as f64 - half, dz as f64 - half);
                out.push(grid.index_to_world(&index) - origin);
            }
        }
    }
    out
}

fn keep(offset: usize, density: f64, level: usize) -> bool {
    if density >= 1.0 {
        return true;
    }
    let h = splitmix64(offset as u64 ^ ((level as u64 + 1) << 40));
    ((h >> 11) as f64 / (1u64 << 53) as f64) < density
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::params::apply_step;
    use crate::metric::{CrossCorrelation, MeanSquared};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use nalgebra::{Matrix3, Rotation3};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn grid() -> ImageGrid {
        ImageGrid::with_shape([12, 12, 12]).unwrap()
    }

    fn blob(shift: Vector3<f64>) -> Volume {
        Volume::from_fn(grid(), |p| {
            let d = p - Vector3::new(5.5, 5.5, 5.5) - shift;
            (-(d[0] * d[0] / 8.0 + d[1] * d[1] / 5.0 + d[2] * d[2] / 4.0)).exp()
        })
    }

    fn options(model: TransformModel, combiner: GradientCombiner, density: f64) -> CostOptions<'static> {
        CostOptions {
            model,
            reorienter: None,
            combiner,
            density,
            level: 0,
            radius: grid().radius(),
        }
    }

    fn cost_function(
        im1: &Volume,
        im2: &Volume,
        model: TransformModel,
        start: &LinearTransform,
    ) -> CostFunction<'static, TestBackend> {
        CostFunction::new(
            LevelImages {
                im1,
                im2,
                mask1: None,
                mask2: None,
            },
            Box::new(MeanSquared),
            options(model, GradientCombiner::Sum, 1.0),
            start,
            &Default::default(),
        )
        .unwrap()
    }

    fn translation(t: Vector3<f64>) -> LinearTransform {
        LinearTransform::new(Matrix3::identity(), t, grid().centre()).unwrap()
    }

    #[test]
    fn test_cost_is_minimal_at_true_translation() {
        let im1 = blob(Vector3::new(1.0, 0.0, 0.0));
        let im2 = blob(Vector3::zeros());
        let cost = cost_function(&im1, &im2, TransformModel::Rigid, &LinearTransform::identity());
        let truth = translation(Vector3::new(1.0, 0.0, 0.0));
        assert!(cost.cost(&truth) < 0.05 * cost.cost(&LinearTransform::identity()));

        let off = cost.evaluate(&translation(Vector3::new(0.5, 0.0, 0.0)));
        assert!(off.is_valid());
        assert!(off.cost > cost.cost(&truth));
        // Moving the half towards the blob lowers the cost.
        assert!(off.gradient[3] < 0.0);
    }

    #[test]
    fn test_cost_is_symmetric_in_the_images() {
        let im1 = blob(Vector3::new(1.0, -0.5, 0.0));
        let im2 = blob(Vector3::zeros());
        let t = LinearTransform::new(
            Rotation3::from_euler_angles(0.0, 0.0, 0.1).into_inner(),
            Vector3::new(0.4, -0.2, 0.0),
            grid().centre(),
        )
        .unwrap();
        let forward = cost_function(&im1, &im2, TransformModel::Rigid, &t);
        let inverse = t.inverse().unwrap();
        let backward = cost_function(&im2, &im1, TransformModel::Rigid, &inverse);
        assert_eq!(forward.support_size(), backward.support_size());
        let (a, b) = (forward.cost(&t), backward.cost(&inverse));
        assert!((a - b).abs() <= 1e-4 * a.max(1e-12), "{a} vs {b}");
    }

    /// Central differences of the cost through `apply_step`.
    fn numeric_gradient(cost: &CostFunction<'_, TestBackend>, t: &LinearTransform, h: f64) -> Vec<f64> {
        let n = parameters(cost.model());
        (0..n)
            .map(|k| {
                let mut step = vec![0.0; n];
                step[k] = h;
                let up = cost.cost(&apply_step(cost.model(), t, &step, cost.radius()).unwrap());
                step[k] = -h;
                let down = cost.cost(&apply_step(cost.model(), t, &step, cost.radius()).unwrap());
                (up - down) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let im1 = blob(Vector3::new(0.8, -0.6, 0.3));
        let im2 = blob(Vector3::zeros());
        let t = LinearTransform::new(
            Rotation3::from_euler_angles(0.05, -0.08, 0.12).into_inner(),
            Vector3::new(0.3, 0.2, -0.4),
            grid().centre(),
        )
        .unwrap();
        for model in [TransformModel::Rigid, TransformModel::Affine] {
            let cost = cost_function(&im1, &im2, model, &t);
            let analytic = cost.evaluate(&t);
            let numeric = numeric_gradient(&cost, &t, 1e-2);
            let scale = numeric.iter().fold(0.0f64, |m, g| m.max(g.abs()));
            assert!(scale > 0.0);
            for (a, b) in analytic.gradient.iter().zip(&numeric) {
                assert!((a - b).abs() <= 0.05 * scale, "{model:?}: {:?} vs {:?}", analytic.gradient, numeric);
            }
        }
    }

    #[test]
    fn test_gradient_at_identity_on_shared_grid() {
        // Samples sit on voxel centres here, where trilinear interpolation
        // is only one-sided differentiable.
        let im1 = blob(Vector3::new(1.5, 0.0, 0.0));
        let im2 = blob(Vector3::zeros());
        let identity = LinearTransform::identity();
        let cost = cost_function(&im1, &im2, TransformModel::Rigid, &identity);
        assert_eq!(cost.support_size(), grid().num_voxels());

        let analytic = cost.evaluate(&identity);
        let numeric = numeric_gradient(&cost, &identity, 1e-2);
        assert!(numeric[3] < 0.0, "{numeric:?}");
        assert!(analytic.gradient[3] < 0.0, "{:?}", analytic.gradient);
        assert!((analytic.gradient[3] - numeric[3]).abs() <= 0.3 * numeric[3].abs());

        // No jump when samples start to leave the field of view.
        let moved = cost.cost(&translation(Vector3::new(0.05, 0.0, 0.0)));
        assert!(moved < analytic.cost);
        assert!(analytic.cost - moved < 0.15 * analytic.cost);
    }

    #[test]
    fn test_subsampling_is_deterministic() {
        let im = blob(Vector3::zeros());
        let build = || {
            CostFunction::<TestBackend>::new(
                LevelImages {
                    im1: &im,
                    im2: &im,
                    mask1: None,
                    mask2: None,
                },
                Box::new(MeanSquared),
                CostOptions {
                    level: 1,
                    ..options(TransformModel::Affine, GradientCombiner::Median, 0.25)
                },
                &LinearTransform::identity(),
                &Default::default(),
            )
            .unwrap()
        };
        let (a, b) = (build(), build());
        assert_eq!(a.support_size(), b.support_size());
        assert!(a.support_size() > 200 && a.support_size() < 700, "count {}", a.support_size());
        let t = LinearTransform::identity();
        assert_eq!(a.evaluate(&t).gradient, b.evaluate(&t).gradient);
    }

    #[test]
    fn test_masks_restrict_support() {
        let im = blob(Vector3::zeros());
        let mask = Volume::from_fn(grid(), |p| if p[2] < 6.0 { 1.0 } else { 0.0 });
        let cost = CostFunction::<TestBackend>::new(
            LevelImages {
                im1: &im,
                im2: &im,
                mask1: None,
                mask2: Some(&mask),
            },
            Box::new(CrossCorrelation::new()),
            options(TransformModel::Rigid, GradientCombiner::Sum, 1.0),
            &LinearTransform::identity(),
            &Default::default(),
        )
        .unwrap();
        assert_eq!(cost.support_size(), 12 * 12 * 6);
        let eval = cost.evaluate(&LinearTransform::identity());
        assert!(eval.is_valid());
        assert!(eval.cost < 0.0);
        assert!(cost.cost(&translation(Vector3::new(1.0, 0.0, 0.0))) > eval.cost);
    }

    #[test]
    fn test_split_regions() {
        assert!(split_regions(0).is_empty());
        assert_eq!(split_regions(3), vec![0..1, 1..2, 2..3]);
        let regions = split_regions(100);
        assert_eq!(regions.len(), 8);
        assert_eq!(regions.last().map(|r| r.end), Some(100));
    }
}
