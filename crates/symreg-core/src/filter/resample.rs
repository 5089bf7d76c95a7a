//! Resample image filter.
//!
//! Resamples an image onto a new grid by mapping every output voxel through
//! a transform into input space and interpolating there.

use std::marker::PhantomData;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Shape, Tensor, TensorData};

use crate::error::Result;
use crate::image::{Image, ImageGrid, Volume};
use crate::interpolation::trait_::Interpolator;
use crate::spatial::{Direction3, Point3, Spacing3};
use crate::transform::trait_::Transform;

/// Resample image filter.
///
/// The transform maps output physical space to input physical space.
///
/// # Type Parameters
/// * `B` - The Burn backend
/// * `T` - The transform type
/// * `I` - The interpolator type
pub struct ResampleImageFilter<B, T, I>
where
    B: Backend,
    T: Transform<B, 3>,
    I: Interpolator<B>,
{
    size: [usize; 3],
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
    transform: T,
    interpolator: I,
    _phantom: PhantomData<B>,
}

impl<B, T, I> ResampleImageFilter<B, T, I>
where
    B: Backend,
    T: Transform<B, 3>,
    I: Interpolator<B>,
{
    /// Create a new resample filter.
    ///
    /// # Arguments
    /// * `size` - Output tensor shape `[Z, Y, X]`
    /// * `origin` - Output image origin (physical)
    /// * `spacing` - Output image spacing (physical)
    /// * `direction` - Output image direction (matrix)
    /// * `transform` - Transform from output space to input space
    /// * `interpolator` - Interpolator for input image sampling
    pub fn new(
        size: [usize; 3],
        origin: Point3,
        spacing: Spacing3,
        direction: Direction3,
        transform: T,
        interpolator: I,
    ) -> Self {
        Self {
            size,
            origin,
            spacing,
            direction,
            transform,
            interpolator,
            _phantom: PhantomData,
        }
    }

    /// Create with the geometry of an output grid.
    pub fn from_grid(grid: &ImageGrid, transform: T, interpolator: I) -> Self {
        Self::new(
            grid.shape(),
            *grid.origin(),
            *grid.spacing(),
            *grid.direction(),
            transform,
            interpolator,
        )
    }

    /// Apply filter to an input image.
    pub fn apply(&self, input: &Image<B, 3>) -> Image<B, 3> {
        let device = input.data().device();

        let output_indices = self.generate_grid_indices(&device);
        let output_points = self.indices_to_physical(output_indices, &device);
        let input_points = self.transform.transform_points(output_points);
        let input_indices = input.world_to_index_tensor(input_points);
        let output_flat = self.interpolator.interpolate(input.data(), input_indices);
        let output_data = output_flat.reshape(Shape::new(self.size));

        Image::new(output_data, self.origin, self.spacing, self.direction)
    }

    /// Resample every component of a host volume.
    pub fn apply_volume(&self, input: &Volume, device: &B::Device) -> Result<Volume> {
        let images: Vec<Image<B, 3>> = input
            .to_images::<B>(device)
            .iter()
            .map(|image| self.apply(image))
            .collect();
        Volume::from_images(&images)
    }

    fn generate_grid_indices(&self, device: &B::Device) -> Tensor<B, 2> {
        let [d, h, w] = self.size;

        let z_range = Tensor::<B, 1, Int>::arange(0..d as i64, device);
        let y_range = Tensor::<B, 1, Int>::arange(0..h as i64, device);
        let x_range = Tensor::<B, 1, Int>::arange(0..w as i64, device);

        let z_grid = z_range.reshape([d, 1, 1]).repeat(&[1, h, w]).reshape([d * h * w]).float();
        let y_grid = y_range.reshape([1, h, 1]).repeat(&[d, 1, w]).reshape([d * h * w]).float();
        let x_grid = x_range.reshape([1, 1, w]).repeat(&[d, h, 1]).reshape([d * h * w]).float();

        Tensor::cat(
            vec![
                x_grid.unsqueeze_dim(1),
                y_grid.unsqueeze_dim(1),
                z_grid.unsqueeze_dim(1),
            ],
            1,
        )
    }

    fn indices_to_physical(&self, indices: Tensor<B, 2>, device: &B::Device) -> Tensor<B, 2> {
        // point = origin + Direction * (index * spacing)
        let origin_vec: Vec<f32> = (0..3).map(|i| self.origin[i] as f32).collect();
        let origin_tensor =
            Tensor::<B, 2>::from_data(TensorData::new(origin_vec, Shape::new([1, 3])), device);

        let spacing_vec: Vec<f32> = (0..3).map(|i| self.spacing[i] as f32).collect();
        let spacing_tensor =
            Tensor::<B, 2>::from_data(TensorData::new(spacing_vec, Shape::new([1, 3])), device);

        let scaled_indices = indices * spacing_tensor;

        // Row vectors need D^T.
        let mut dir_data = Vec::with_capacity(9);
        for c in 0..3 {
            for r in 0..3 {
                dir_data.push(self.direction[(r, c)] as f32);
            }
        }
        let dir_t_tensor =
            Tensor::<B, 2>::from_data(TensorData::new(dir_data, Shape::new([3, 3])), device);

        origin_tensor + scaled_indices.matmul(dir_t_tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolation::LinearInterpolator;
    use crate::transform::LinearTransform;
    use burn_ndarray::NdArray;
    use nalgebra::{Matrix3, Vector3};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resample_translation() {
        let device = Default::default();
        let grid = ImageGrid::with_shape([1, 10, 10]).unwrap();
        let mut data = vec![0.0; 100];
        for (x, y) in [(4, 4), (5, 4), (4, 5), (5, 5)] {
            data[grid.offset(x, y, 0)] = 1.0;
        }
        let volume = Volume::new(grid.clone(), 1, data).unwrap();

        // Output (x, y) samples input (x - 2, y - 1).
        let transform =
            LinearTransform::new(Matrix3::identity(), Vector3::new(-2.0, -1.0, 0.0), Vector3::zeros())
                .unwrap();
        let filter = ResampleImageFilter::<TestBackend, _, _>::from_grid(
            &grid,
            transform,
            LinearInterpolator::new(),
        );
        let out = filter.apply_volume(&volume, &device).unwrap();

        assert!(out.value(0, 6, 5, 0) > 0.9);
        assert!(out.value(0, 7, 6, 0) > 0.9);
        assert!(out.value(0, 4, 4, 0) < 0.1);
        // Pulled from outside the input.
        assert_eq!(out.value(0, 0, 0, 0), 0.0);
    }
}
