//! Deformations built from linear halves and displacement fields.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use nalgebra::Vector3;

use super::displacement_field::DisplacementField;
use super::linear::LinearTransform;
use super::trait_::Transform;
use crate::image::ImageGrid;

/// Absolute position map sampled on a grid: `p -> position(p)`.
///
/// Stored as a displacement so that points off the grid extend the
/// boundary displacement rather than collapsing to the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationField {
    displacement: DisplacementField,
}

impl DeformationField {
    /// Sample `f` at every voxel of `grid`.
    pub fn from_fn<F>(grid: &ImageGrid, f: F) -> Self
    where
        F: Fn(&Vector3<f64>) -> Vector3<f64> + Sync,
    {
        let displacement = DisplacementField::zeros(grid.clone()).map_voxels(|world, _| f(&world) - world);
        Self { displacement }
    }

    pub fn grid(&self) -> &ImageGrid {
        self.displacement.grid()
    }

    pub fn displacement(&self) -> &DisplacementField {
        &self.displacement
    }

    pub fn position(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.displacement.apply(world)
    }

    /// Jacobian of the position map at voxel `(x, y, z)` by central
    /// differences (one-sided at the boundary), in world units.
    pub fn jacobian(&self, x: usize, y: usize, z: usize) -> nalgebra::Matrix3<f64> {
        let grid = self.grid();
        let size = grid.size();
        let idx = [x, y, z];
        let mut d_index = nalgebra::Matrix3::zeros();
        for axis in 0..3 {
            let n = size[axis];
            if n < 2 {
                continue;
            }
            let lo = idx[axis].saturating_sub(1);
            let hi = (idx[axis] + 1).min(n - 1);
            let mut a = idx;
            let mut b = idx;
            a[axis] = lo;
            b[axis] = hi;
            let pa = grid.voxel_to_world(a[0], a[1], a[2]) + self.displacement.get(a[0], a[1], a[2]);
            let pb = grid.voxel_to_world(b[0], b[1], b[2]) + self.displacement.get(b[0], b[1], b[2]);
            d_index.set_column(axis, &((pb - pa) / (hi - lo) as f64));
        }
        // d position / d world = d position / d index * M
        d_index * grid.world_to_index_matrix()
    }
}

impl<B: Backend> Transform<B, 3> for DeformationField {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = points.device();
        let [n, _] = points.dims();
        let host: Vec<f64> = points.into_data().iter::<f64>().collect();
        let mut out = Vec::with_capacity(n * 3);
        for p in host.chunks_exact(3) {
            let q = self.position(&Vector3::new(p[0], p[1], p[2]));
            out.extend([q[0] as f32, q[1] as f32, q[2] as f32]);
        }
        Tensor::<B, 2>::from_data(TensorData::new(out, [n, 3]), &device)
    }
}

/// `m -> H(m + u(m))` on the grid of `u`, where `H` is a linear half.
pub fn compose_linear_displacement(half: &LinearTransform, field: &DisplacementField) -> DeformationField {
    DeformationField::from_fn(field.grid(), |m| half.apply(&(m + field.sample(m))))
}

/// Full template-to-moving deformation on `grid`.
///
/// For a template point `p`, `H(p)` corrected by the inverse template field
/// is its midway position; the moving field and `H` then carry it into
/// moving space.
pub fn compose_halfway_transforms(
    linear: &LinearTransform,
    im1_forward: &DisplacementField,
    im2_inverse: &DisplacementField,
    grid: &ImageGrid,
) -> DeformationField {
    DeformationField::from_fn(grid, |p| {
        let m = linear.apply_half(p);
        let m1 = m + im2_inverse.sample(&m);
        let m2 = m1 + im1_forward.sample(&m1);
        linear.apply_half(&m2)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;
    use nalgebra::{Matrix3, Rotation3};

    fn linear() -> LinearTransform {
        let r = Rotation3::from_euler_angles(0.1, 0.05, -0.2).into_inner();
        LinearTransform::new(r, Vector3::new(2.0, -1.0, 0.5), Vector3::new(4.0, 4.0, 4.0)).unwrap()
    }

    #[test]
    fn test_zero_fields_reduce_to_linear() {
        let grid = ImageGrid::with_shape([9, 9, 9]).unwrap();
        let zero = DisplacementField::zeros(grid.clone());
        let t = linear();
        let deform = compose_halfway_transforms(&t, &zero, &zero, &grid);
        let p = grid.voxel_to_world(3, 5, 2);
        assert_relative_eq!(deform.position(&p), t.apply(&p), epsilon = 1e-9);

        let mid = compose_linear_displacement(&t, &zero);
        assert_relative_eq!(mid.position(&p), t.apply_half(&p), epsilon = 1e-9);
    }

    #[test]
    fn test_jacobian_of_linear_map() {
        let grid = ImageGrid::with_shape([6, 6, 6]).unwrap();
        let a = Matrix3::new(1.1, 0.1, 0.0, 0.0, 0.9, 0.2, 0.05, 0.0, 1.0);
        let deform = DeformationField::from_fn(&grid, |p| a * p);
        assert_relative_eq!(deform.jacobian(2, 3, 4), a, epsilon = 1e-9);
        assert_relative_eq!(deform.jacobian(0, 5, 0), a, epsilon = 1e-9);
    }

    #[test]
    fn test_tensor_transform_adds_displacement() {
        let grid = ImageGrid::with_shape([4, 4, 4]).unwrap();
        let deform = DeformationField::from_fn(&grid, |p| p + Vector3::new(1.0, 0.0, -1.0));
        let device = Default::default();
        let points = Tensor::<NdArray<f32>, 2>::from_floats([[1.0, 1.0, 1.0], [9.0, 0.0, 0.0]], &device);
        let out: Vec<f32> = Transform::<NdArray<f32>, 3>::transform_points(&deform, points)
            .into_data()
            .iter::<f32>()
            .collect();
        assert_eq!(&out[0..3], &[2.0, 1.0, 0.0]);
        assert_eq!(&out[3..6], &[10.0, 0.0, -1.0]);
    }
}
