//! Image type with physical metadata and coordinate transformations.
//!
//! `Image` pairs tensor data (on any burn backend) with the physical-space
//! metadata that describes how voxel indices map to world coordinates.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use crate::spatial::{Direction, Point, Spacing, Vector};

/// Image with physical metadata.
///
/// # Type Parameters
/// * `B` - The backend for tensor operations
/// * `D` - The dimensionality of the tensor
///
/// # Coordinate Systems
/// * **Index space**: continuous voxel indices ordered `(x, y, z)`; tensor
///   data is laid out `[Z, Y, X]`.
/// * **Physical space**: world coordinates in mm,
///   `point = origin + Direction * (index * spacing)`.
///
/// # Examples
/// ```rust
/// use symreg_core::Image;
/// use symreg_core::spatial::{Point3, Spacing3, Direction3};
/// use burn::tensor::Tensor;
/// use burn_ndarray::NdArray;
///
/// type Backend = NdArray<f32>;
///
/// let device = Default::default();
/// let data = Tensor::<Backend, 3>::zeros([10, 10, 10], &device);
/// let image = Image::new(
///     data,
///     Point3::new([0.0, 0.0, 0.0]),
///     Spacing3::new([1.0, 1.0, 1.0]),
///     Direction3::identity(),
/// );
/// assert_eq!(image.shape(), [10, 10, 10]);
/// ```
#[derive(Debug, Clone)]
pub struct Image<B: Backend, const D: usize> {
    data: Tensor<B, D>,
    origin: Point<D>,
    spacing: Spacing<D>,
    direction: Direction<D>,
}

impl<B: Backend, const D: usize> Image<B, D> {
    /// Create a new image with the given data and metadata.
    pub fn new(
        data: Tensor<B, D>,
        origin: Point<D>,
        spacing: Spacing<D>,
        direction: Direction<D>,
    ) -> Self {
        Self {
            data,
            origin,
            spacing,
            direction,
        }
    }

    /// Get the image data tensor.
    pub fn data(&self) -> &Tensor<B, D> {
        &self.data
    }

    /// Get the origin (physical coordinate of the first voxel).
    pub fn origin(&self) -> &Point<D> {
        &self.origin
    }

    /// Get the spacing.
    pub fn spacing(&self) -> &Spacing<D> {
        &self.spacing
    }

    /// Get the direction matrix.
    pub fn direction(&self) -> &Direction<D> {
        &self.direction
    }

    /// Tensor shape in `[Z, Y, X]` order.
    pub fn shape(&self) -> [usize; D] {
        self.data.dims()
    }

    fn inverse_direction(&self) -> Direction<D> {
        // Orthonormal directions invert by transposition.
        self.direction
            .try_inverse()
            .unwrap_or_else(|| Direction::from_matrix(self.direction.0.transpose()))
    }

    /// Convert a physical point to a continuous index.
    ///
    /// `index = (Direction^-1 * (point - origin)) / spacing`
    pub fn transform_physical_point_to_continuous_index(&self, point: &Point<D>) -> Point<D> {
        let rotated = self.inverse_direction() * (*point - self.origin);
        let mut index = Point::<D>::origin();
        for i in 0..D {
            index[i] = rotated[i] / self.spacing[i];
        }
        index
    }

    /// Convert a continuous index to a physical point.
    ///
    /// `point = origin + Direction * (index * spacing)`
    pub fn transform_continuous_index_to_physical_point(&self, index: &Point<D>) -> Point<D> {
        let mut scaled = Vector::<D>::zeros();
        for i in 0..D {
            scaled[i] = index[i] * self.spacing[i];
        }
        self.origin + self.direction * scaled
    }

    /// Batch map physical points `[N, D]` to continuous indices `[N, D]`.
    pub fn world_to_index_tensor(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = points.device();
        let origin = row_tensor::<B, D>(&self.origin.to_vec(), &device);

        // I = (P - O) @ T with T_rc = (D^-1)_cr / S_c
        let inv_dir = self.inverse_direction();
        let mut t_data = Vec::with_capacity(D * D);
        for r in 0..D {
            for c in 0..D {
                t_data.push((inv_dir[(c, r)] / self.spacing[c]) as f32);
            }
        }
        let t = Tensor::<B, 2>::from_data(TensorData::new(t_data, Shape::new([D, D])), &device);

        (points - origin).matmul(t)
    }

    /// Batch map continuous indices `[N, D]` to physical points `[N, D]`.
    pub fn index_to_world_tensor(&self, indices: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = indices.device();
        let origin = row_tensor::<B, D>(&self.origin.to_vec(), &device);

        // P = O + I @ M with M_rc = S_r * D_cr
        let mut m_data = Vec::with_capacity(D * D);
        for r in 0..D {
            for c in 0..D {
                m_data.push((self.spacing[r] * self.direction[(c, r)]) as f32);
            }
        }
        let m = Tensor::<B, 2>::from_data(TensorData::new(m_data, Shape::new([D, D])), &device);

        indices.matmul(m) + origin
    }
}

/// Build a `[1, D]` row tensor from host values.
pub(crate) fn row_tensor<B: Backend, const D: usize>(values: &[f64], device: &B::Device) -> Tensor<B, 2> {
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Tensor::<B, 1>::from_data(TensorData::new(data, Shape::new([D])), device).reshape([1, D])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type Backend = NdArray<f32>;

    fn image_with(origin: [f64; 3], spacing: [f64; 3]) -> Image<Backend, 3> {
        let device = Default::default();
        Image::new(
            Tensor::<Backend, 3>::zeros([10, 10, 10], &device),
            Point::new(origin),
            Spacing::new(spacing),
            Direction::identity(),
        )
    }

    #[test]
    fn test_non_unit_spacing_and_origin() {
        let image = image_with([10.0, 20.0, 30.0], [2.0, 2.0, 2.0]);
        let index = image.transform_physical_point_to_continuous_index(&Point::new([20.0, 30.0, 40.0]));
        for i in 0..3 {
            assert!((index[i] - 5.0).abs() < 1e-9);
        }
        let back = image.transform_continuous_index_to_physical_point(&index);
        assert!((back[0] - 20.0).abs() < 1e-9);
        assert!((back[2] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_tensor_mapping_matches_scalar_mapping() {
        let image = image_with([1.0, -2.0, 3.0], [1.5, 1.0, 0.5]);
        let device = Default::default();
        let indices = Tensor::<Backend, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let world = image.index_to_world_tensor(indices.clone());
        let back = image.world_to_index_tensor(world.clone());

        let world: Vec<f32> = world.into_data().iter::<f32>().collect();
        let expected = image.transform_continuous_index_to_physical_point(&Point::new([1.0, 2.0, 3.0]));
        for i in 0..3 {
            assert!((world[i] as f64 - expected[i]).abs() < 1e-5);
        }
        let back: Vec<f32> = back.into_data().iter::<f32>().collect();
        assert!((back[0] - 1.0).abs() < 1e-5);
        assert!((back[1] - 2.0).abs() < 1e-5);
        assert!((back[2] - 3.0).abs() < 1e-5);
    }
}
