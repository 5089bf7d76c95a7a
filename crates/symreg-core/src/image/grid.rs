//! Voxel grids: index generation and host-side geometry.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use nalgebra::{Matrix3, Vector3};

use crate::error::{CoreError, Result};
use crate::image::Image;
use crate::spatial::{Direction3, Point3, Spacing3};

/// Generate a grid of continuous indices for a 3D image shape.
///
/// Returns a tensor of shape `[N, 3]` holding `(x, y, z)` for every voxel
/// of a `[Z, Y, X]` volume, in storage order.
pub fn generate_grid_3d<B>(shape: [usize; 3], device: &B::Device) -> Tensor<B, 2>
where
    B: Backend,
{
    let [d, h, w] = shape;
    let total = d * h * w;

    let mut grid = Vec::with_capacity(total * 3);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                grid.push(x as f32);
                grid.push(y as f32);
                grid.push(z as f32);
            }
        }
    }

    Tensor::<B, 1>::from_data(TensorData::new(grid, Shape::new([total * 3])), device)
        .reshape([total, 3])
}

/// Geometry of a 3D voxel grid.
///
/// `shape` is stored `[Z, Y, X]` to match tensor layout; indices and world
/// points are `(x, y, z)`. The index-to-world matrix `D * diag(s)` and its
/// inverse are cached since every sampling loop needs them.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGrid {
    shape: [usize; 3],
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
    index_to_world: Matrix3<f64>,
    world_to_index: Matrix3<f64>,
}

impl ImageGrid {
    /// Create a grid, rejecting empty shapes, non-positive spacing and
    /// singular directions.
    pub fn new(
        shape: [usize; 3],
        origin: Point3,
        spacing: Spacing3,
        direction: Direction3,
    ) -> Result<Self> {
        if shape.iter().any(|&n| n == 0) {
            return Err(CoreError::invalid_geometry(format!("empty grid shape {shape:?}")));
        }
        if (0..3).any(|i| !(spacing[i] > 0.0) || !spacing[i].is_finite()) {
            return Err(CoreError::invalid_geometry(format!(
                "spacing must be positive, got {:?}",
                spacing.to_vec()
            )));
        }
        let index_to_world = direction.0 * Matrix3::from_diagonal(&spacing.0);
        let world_to_index = index_to_world
            .try_inverse()
            .ok_or_else(|| CoreError::singular("image direction matrix"))?;

        Ok(Self {
            shape,
            origin,
            spacing,
            direction,
            index_to_world,
            world_to_index,
        })
    }

    /// Unit-spaced, axis-aligned grid at the origin.
    pub fn with_shape(shape: [usize; 3]) -> Result<Self> {
        Self::new(shape, Point3::origin(), Spacing3::uniform(1.0), Direction3::identity())
    }

    /// Geometry of a burn image.
    pub fn from_image<B: Backend>(image: &Image<B, 3>) -> Result<Self> {
        Self::new(image.shape(), *image.origin(), *image.spacing(), *image.direction())
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Size along `(x, y, z)`.
    pub fn size(&self) -> [usize; 3] {
        [self.shape[2], self.shape[1], self.shape[0]]
    }

    pub fn num_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn origin(&self) -> &Point3 {
        &self.origin
    }

    pub fn spacing(&self) -> &Spacing3 {
        &self.spacing
    }

    pub fn direction(&self) -> &Direction3 {
        &self.direction
    }

    pub fn mean_spacing(&self) -> f64 {
        self.spacing.mean_spacing()
    }

    pub fn index_to_world_matrix(&self) -> &Matrix3<f64> {
        &self.index_to_world
    }

    /// `M = S^-1 D^-1`; world-space gradients are `M^T * g_index`.
    pub fn world_to_index_matrix(&self) -> &Matrix3<f64> {
        &self.world_to_index
    }

    pub fn index_to_world(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin.coords() + self.index_to_world * index
    }

    pub fn world_to_index(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.world_to_index * (world - self.origin.coords())
    }

    pub fn voxel_to_world(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        self.index_to_world(&Vector3::new(x as f64, y as f64, z as f64))
    }

    /// Linear storage offset of voxel `(x, y, z)`.
    #[inline]
    pub fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.shape[1] + y) * self.shape[2] + x
    }

    /// Inverse of [`offset`](Self::offset).
    #[inline]
    pub fn coords(&self, offset: usize) -> (usize, usize, usize) {
        let nx = self.shape[2];
        let ny = self.shape[1];
        (offset % nx, (offset / nx) % ny, offset / (nx * ny))
    }

    /// Geometric centre of the voxel centres.
    pub fn centre(&self) -> Vector3<f64> {
        let size = self.size();
        let half = Vector3::new(
            (size[0] - 1) as f64 / 2.0,
            (size[1] - 1) as f64 / 2.0,
            (size[2] - 1) as f64 / 2.0,
        );
        self.index_to_world(&half)
    }

    /// World positions of the eight corner voxel centres.
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        let size = self.size();
        let mut out = [Vector3::zeros(); 8];
        for (i, corner) in out.iter_mut().enumerate() {
            let idx = Vector3::new(
                if i & 1 == 0 { 0.0 } else { (size[0] - 1) as f64 },
                if i & 2 == 0 { 0.0 } else { (size[1] - 1) as f64 },
                if i & 4 == 0 { 0.0 } else { (size[2] - 1) as f64 },
            );
            *corner = self.index_to_world(&idx);
        }
        out
    }

    /// Half the diagonal of the field of view, in mm.
    pub fn radius(&self) -> f64 {
        let corners = self.corners();
        0.5 * (corners[7] - corners[0]).norm()
    }

    /// Same shape and, within `tolerance`, the same geometry.
    pub fn same_geometry(&self, other: &ImageGrid, tolerance: f64) -> bool {
        self.shape == other.shape
            && (self.origin.coords() - other.origin.coords()).abs().max() <= tolerance
            && (self.spacing.0 - other.spacing.0).abs().max() <= tolerance
            && (self.direction.0 - other.direction.0).abs().max() <= tolerance
    }

    /// Grid resampled by a fractional scale factor.
    ///
    /// Each axis gets `max(1, round(n * factor))` voxels; spacing grows so the
    /// field of view is kept, and the origin moves by half the change in
    /// voxel size so the extent stays centred.
    pub fn scaled(&self, factor: f64) -> Result<Self> {
        if !(factor > 0.0) || !factor.is_finite() {
            return Err(CoreError::invalid_geometry(format!(
                "scale factor must be positive, got {factor}"
            )));
        }
        let size = self.size();
        let mut new_size = [0usize; 3];
        let mut new_spacing = Spacing3::zeros();
        let mut shift = Vector3::zeros();
        for axis in 0..3 {
            let n = size[axis];
            let m = ((n as f64 * factor).round() as usize).max(1);
            new_size[axis] = m;
            new_spacing[axis] = self.spacing[axis] * n as f64 / m as f64;
            shift[axis] = 0.5 * (new_spacing[axis] - self.spacing[axis]);
        }
        let origin = Point3::from_coords(self.origin.coords() + self.direction.0 * shift);
        Self::new(
            [new_size[2], new_size[1], new_size[0]],
            origin,
            new_spacing,
            self.direction,
        )
    }

    /// Axis-aligned grid covering `points` with isotropic `spacing`.
    pub fn bounding(points: &[Vector3<f64>], spacing: f64) -> Result<Self> {
        if points.is_empty() {
            return Err(CoreError::invalid_geometry("no points to bound"));
        }
        let mut lo = points[0];
        let mut hi = points[0];
        for p in &points[1..] {
            lo = lo.inf(p);
            hi = hi.sup(p);
        }
        let extent = hi - lo;
        let mut size = [0usize; 3];
        for axis in 0..3 {
            size[axis] = (extent[axis] / spacing - 1e-6).ceil().max(0.0) as usize + 1;
        }
        Self::new(
            [size[2], size[1], size[0]],
            Point3::from_coords(lo),
            Spacing3::uniform(spacing),
            Direction3::identity(),
        )
    }

    /// Whether a continuous index lies within the sampled field of view.
    pub fn contains_index(&self, index: &Vector3<f64>) -> bool {
        let size = self.size();
        (0..3).all(|axis| axis_weights(index[axis], size[axis]).is_some())
    }
}

/// Trilinear support along one axis: lower index, upper index and the
/// weight of the upper sample.
///
/// Valid indices span `[0, n - 1]`; a single-voxel axis accepts `[-0.5, 0.5]`.
#[inline]
pub(crate) fn axis_weights(x: f64, n: usize) -> Option<(usize, usize, f64)> {
    const TOL: f64 = 1e-6;
    if !x.is_finite() {
        return None;
    }
    if n == 1 {
        return if x.abs() <= 0.5 { Some((0, 0, 0.0)) } else { None };
    }
    let upper = (n - 1) as f64;
    if x < -TOL || x > upper + TOL {
        return None;
    }
    let clamped = x.clamp(0.0, upper);
    let i0 = (clamped.floor() as usize).min(n - 2);
    Some((i0, i0 + 1, clamped - i0 as f64))
}
