//! Dense displacement fields on a voxel grid.
//!
//! A field stores one world-space vector (mm) per voxel and represents the
//! mapping `x -> x + u(x)`. Sampling between voxels is trilinear; queries
//! outside the grid use the nearest boundary displacement.

use burn::tensor::backend::Backend;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::error::{CoreError, Result};
use crate::filter::GaussianFilter;
use crate::image::{ImageGrid, Volume};

#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    grid: ImageGrid,
    data: Vec<Vector3<f64>>,
}

impl DisplacementField {
    pub fn zeros(grid: ImageGrid) -> Self {
        let data = vec![Vector3::zeros(); grid.num_voxels()];
        Self { grid, data }
    }

    pub fn new(grid: ImageGrid, data: Vec<Vector3<f64>>) -> Result<Self> {
        if data.len() != grid.num_voxels() {
            return Err(CoreError::ShapeMismatch {
                expected: grid.shape().to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self { grid, data })
    }

    /// Build from a 3-component volume holding `(x, y, z)` displacements.
    pub fn from_volume(volume: &Volume) -> Result<Self> {
        if volume.components() != 3 {
            let s = volume.grid().shape();
            return Err(CoreError::ShapeMismatch {
                expected: vec![3, s[0], s[1], s[2]],
                actual: vec![volume.components(), s[0], s[1], s[2]],
            });
        }
        let (ux, uy, uz) = (volume.component(0), volume.component(1), volume.component(2));
        let data = (0..volume.grid().num_voxels())
            .map(|i| Vector3::new(ux[i], uy[i], uz[i]))
            .collect();
        Self::new(volume.grid().clone(), data)
    }

    /// Three-component volume, component-major.
    pub fn to_volume(&self) -> Result<Volume> {
        let n = self.data.len();
        let mut out = vec![0.0; 3 * n];
        for (i, u) in self.data.iter().enumerate() {
            out[i] = u[0];
            out[n + i] = u[1];
            out[2 * n + i] = u[2];
        }
        Volume::new(self.grid.clone(), 3, out)
    }

    pub fn grid(&self) -> &ImageGrid {
        &self.grid
    }

    pub fn data(&self) -> &[Vector3<f64>] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Vector3<f64>] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        self.data[self.grid.offset(x, y, z)]
    }

    /// Largest displacement magnitude.
    pub fn max_norm(&self) -> f64 {
        self.data.iter().map(|u| u.norm()).fold(0.0, f64::max)
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|u| *u *= factor);
    }

    /// Displacement at a world point.
    pub fn sample(&self, world: &Vector3<f64>) -> Vector3<f64> {
        self.sample_index(&self.grid.world_to_index(world))
    }

    /// Displacement at a continuous index, clamped to the grid.
    pub fn sample_index(&self, index: &Vector3<f64>) -> Vector3<f64> {
        let size = self.grid.size();
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut frac = [0.0; 3];
        for axis in 0..3 {
            let n = size[axis];
            let c = if index[axis].is_finite() {
                index[axis].clamp(0.0, (n - 1) as f64)
            } else {
                0.0
            };
            let i0 = (c.floor() as usize).min(n.saturating_sub(2));
            lo[axis] = i0;
            hi[axis] = (i0 + 1).min(n - 1);
            frac[axis] = c - i0 as f64;
        }
        let mut out = Vector3::zeros();
        for k in 0..8 {
            let (xi, wx) = if k & 1 == 0 { (lo[0], 1.0 - frac[0]) } else { (hi[0], frac[0]) };
            let (yi, wy) = if k & 2 == 0 { (lo[1], 1.0 - frac[1]) } else { (hi[1], frac[1]) };
            let (zi, wz) = if k & 4 == 0 { (lo[2], 1.0 - frac[2]) } else { (hi[2], frac[2]) };
            let w = wx * wy * wz;
            if w != 0.0 {
                out += self.get(xi, yi, zi) * w;
            }
        }
        out
    }

    /// Apply the mapping `x + u(x)`.
    pub fn apply(&self, world: &Vector3<f64>) -> Vector3<f64> {
        world + self.sample(world)
    }

    /// Fill a new field on the same grid from `f(world, index_offset)`, in
    /// parallel over z-slabs.
    pub fn map_voxels<F>(&self, f: F) -> Self
    where
        F: Fn(Vector3<f64>, usize) -> Vector3<f64> + Sync,
    {
        let grid = &self.grid;
        let [_, ny, nx] = grid.shape();
        let slab = nx * ny;
        let mut data = vec![Vector3::zeros(); grid.num_voxels()];
        data.par_chunks_mut(slab).enumerate().for_each(|(z, chunk)| {
            for (i, out) in chunk.iter_mut().enumerate() {
                let offset = z * slab + i;
                let (x, y, _) = grid.coords(offset);
                *out = f(grid.voxel_to_world(x, y, z), offset);
            }
        });
        Self {
            grid: self.grid.clone(),
            data,
        }
    }

    /// Compose an update into this field: `u'(x) = d(x) + u(x + d(x))`.
    pub fn compose_update(&self, update: &DisplacementField) -> Result<Self> {
        self.check_same_grid(update)?;
        Ok(self.map_voxels(|world, offset| {
            let d = update.data[offset];
            d + self.sample(&(world + d))
        }))
    }

    /// Invert by fixed-point iteration `v(y) = -u(y + v(y))`, starting from
    /// `initial` or from `-u`.
    pub fn invert(&self, initial: Option<&DisplacementField>, iterations: usize) -> Result<Self> {
        let mut inverse = match initial {
            Some(v) => {
                self.check_same_grid(v)?;
                v.clone()
            }
            None => {
                let mut v = self.clone();
                v.scale(-1.0);
                v
            }
        };
        for _ in 0..iterations.max(1) {
            inverse = inverse.map_voxels(|world, offset| {
                let v = inverse.data[offset];
                -self.sample(&(world + v))
            });
        }
        Ok(inverse)
    }

    /// Mean and maximum of `|u(x) + v(x + u(x))|` over the grid, where `v`
    /// is this field's inverse.
    pub fn round_trip_error(&self, inverse: &DisplacementField) -> (f64, f64) {
        let n = self.data.len().max(1) as f64;
        let errors: Vec<f64> = self
            .map_voxels(|world, offset| {
                let u = self.data[offset];
                u + inverse.sample(&(world + u))
            })
            .data
            .iter()
            .map(|e| e.norm())
            .collect();
        let mean = errors.iter().sum::<f64>() / n;
        let max = errors.iter().copied().fold(0.0, f64::max);
        (mean, max)
    }

    /// Resample onto another grid; displacements stay in mm.
    pub fn resample_to(&self, grid: &ImageGrid) -> Self {
        let target = Self::zeros(grid.clone());
        target.map_voxels(|world, _| self.sample(&world))
    }

    /// Gaussian smoothing with `sigma` in voxels of this grid.
    pub fn smoothed<B: Backend>(&self, sigma_voxels: f64, device: &B::Device) -> Result<Self> {
        if sigma_voxels <= 0.0 {
            return Ok(self.clone());
        }
        let sigmas: Vec<f64> = (0..3).map(|axis| sigma_voxels * self.grid.spacing()[axis]).collect();
        let filter = GaussianFilter::<B>::new(sigmas);
        let images: Vec<_> = self
            .to_volume()?
            .to_images::<B>(device)
            .iter()
            .map(|image| filter.apply(image))
            .collect();
        Self::from_volume(&Volume::from_images(&images)?)
    }

    fn check_same_grid(&self, other: &DisplacementField) -> Result<()> {
        if self.grid.shape() != other.grid.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: self.grid.shape().to_vec(),
                actual: other.grid.shape().to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;

    fn smooth_field() -> DisplacementField {
        let grid = ImageGrid::with_shape([12, 12, 12]).unwrap();
        let zero = DisplacementField::zeros(grid);
        zero.map_voxels(|p, _| {
            let s = (p[0] * 0.3).sin() * (p[1] * 0.2).cos();
            Vector3::new(0.8 * s, -0.5 * s, 0.3 * (p[2] * 0.25).sin())
        })
    }

    #[test]
    fn test_sample_at_voxel_centres() {
        let field = smooth_field();
        let world = field.grid().voxel_to_world(3, 4, 5);
        assert_relative_eq!(field.sample(&world), field.get(3, 4, 5), epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip_is_small() {
        let field = smooth_field();
        let inverse = field.invert(None, 20).unwrap();
        let (mean, _max) = field.round_trip_error(&inverse);
        assert!(mean < 0.05, "mean round trip error {mean}");
    }

    #[test]
    fn test_compose_with_zero_update_is_identity() {
        let field = smooth_field();
        let zero = DisplacementField::zeros(field.grid().clone());
        let composed = field.compose_update(&zero).unwrap();
        for (a, b) in composed.data().iter().zip(field.data()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_volume_roundtrip_and_smoothing() {
        let field = smooth_field();
        let back = DisplacementField::from_volume(&field.to_volume().unwrap()).unwrap();
        assert_eq!(back, field);

        let device = Default::default();
        let smoothed = field.smoothed::<NdArray<f32>>(1.0, &device).unwrap();
        assert!(smoothed.max_norm() <= field.max_norm() + 1e-4);
        assert!(DisplacementField::from_volume(&Volume::zeros(field.grid().clone(), 1)).is_err());
    }

    #[test]
    fn test_resample_preserves_constant_field() {
        let grid = ImageGrid::with_shape([4, 4, 4]).unwrap();
        let mut field = DisplacementField::zeros(grid.clone());
        field.data_mut().iter_mut().for_each(|u| *u = Vector3::new(1.0, 2.0, 3.0));
        let fine = field.resample_to(&grid.scaled(2.0).unwrap());
        assert_eq!(fine.grid().shape(), [8, 8, 8]);
        for u in fine.data() {
            assert_relative_eq!(*u, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        }
    }
}
