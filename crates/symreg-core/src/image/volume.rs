//! Host-side multi-component volume with trilinear sampling.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use nalgebra::Vector3;

use super::grid::{axis_weights, ImageGrid};
use crate::error::{CoreError, Result};
use crate::image::Image;

/// Scalar or multi-component image stored component-major, matching a
/// `[C, Z, Y, X]` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    grid: ImageGrid,
    components: usize,
    data: Vec<f64>,
}

/// Eight trilinear corner offsets and weights.
struct Stencil {
    offsets: [usize; 8],
    weights: [f64; 8],
}

impl Volume {
    pub fn new(grid: ImageGrid, components: usize, data: Vec<f64>) -> Result<Self> {
        let expected = grid.num_voxels() * components;
        if components == 0 || data.len() != expected {
            let s = grid.shape();
            return Err(CoreError::ShapeMismatch {
                expected: vec![components, s[0], s[1], s[2]],
                actual: vec![data.len()],
            });
        }
        Ok(Self { grid, components, data })
    }

    pub fn zeros(grid: ImageGrid, components: usize) -> Self {
        let len = grid.num_voxels() * components.max(1);
        Self {
            grid,
            components: components.max(1),
            data: vec![0.0; len],
        }
    }

    /// Build a volume by evaluating `f(world)` at every voxel centre.
    pub fn from_fn(grid: ImageGrid, mut f: impl FnMut(Vector3<f64>) -> f64) -> Self {
        let mut data = Vec::with_capacity(grid.num_voxels());
        let [nz, ny, nx] = grid.shape();
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    data.push(f(grid.voxel_to_world(x, y, z)));
                }
            }
        }
        Self { grid, components: 1, data }
    }

    /// Stack single-component burn images (all on the same grid) into a volume.
    pub fn from_images<B: Backend>(images: &[Image<B, 3>]) -> Result<Self> {
        let first = images
            .first()
            .ok_or_else(|| CoreError::invalid_geometry("no image components"))?;
        let grid = ImageGrid::from_image(first)?;
        let mut data = Vec::with_capacity(grid.num_voxels() * images.len());
        for image in images {
            if image.shape() != grid.shape() {
                return Err(CoreError::ShapeMismatch {
                    expected: grid.shape().to_vec(),
                    actual: image.shape().to_vec(),
                });
            }
            data.extend(image.data().clone().into_data().iter::<f64>());
        }
        Self::new(grid, images.len(), data)
    }

    /// One burn image per component.
    pub fn to_images<B: Backend>(&self, device: &B::Device) -> Vec<Image<B, 3>> {
        (0..self.components).map(|c| self.component_image(c, device)).collect()
    }

    pub fn component_image<B: Backend>(&self, component: usize, device: &B::Device) -> Image<B, 3> {
        let values: Vec<f32> = self.component(component).iter().map(|&v| v as f32).collect();
        let tensor = Tensor::<B, 3>::from_data(TensorData::new(values, self.grid.shape()), device);
        Image::new(
            tensor,
            *self.grid.origin(),
            *self.grid.spacing(),
            *self.grid.direction(),
        )
    }

    pub fn grid(&self) -> &ImageGrid {
        &self.grid
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn component(&self, c: usize) -> &[f64] {
        let n = self.grid.num_voxels();
        &self.data[c * n..(c + 1) * n]
    }

    pub fn component_mut(&mut self, c: usize) -> &mut [f64] {
        let n = self.grid.num_voxels();
        &mut self.data[c * n..(c + 1) * n]
    }

    #[inline]
    pub fn value(&self, c: usize, x: usize, y: usize, z: usize) -> f64 {
        self.data[c * self.grid.num_voxels() + self.grid.offset(x, y, z)]
    }

    /// Keep only the first `n` components.
    pub fn truncated(&self, n: usize) -> Result<Self> {
        if n == 0 || n > self.components {
            return Err(CoreError::invalid_geometry(format!(
                "cannot keep {n} of {} components",
                self.components
            )));
        }
        let len = n * self.grid.num_voxels();
        Self::new(self.grid.clone(), n, self.data[..len].to_vec())
    }

    /// Same data placed on a new grid of identical shape.
    pub fn with_grid(self, grid: ImageGrid) -> Result<Self> {
        if grid.shape() != self.grid.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: self.grid.shape().to_vec(),
                actual: grid.shape().to_vec(),
            });
        }
        Ok(Self { grid, ..self })
    }

    fn stencil(&self, index: &Vector3<f64>) -> Option<Stencil> {
        let size = self.grid.size();
        let (x0, x1, fx) = axis_weights(index[0], size[0])?;
        let (y0, y1, fy) = axis_weights(index[1], size[1])?;
        let (z0, z1, fz) = axis_weights(index[2], size[2])?;

        let mut s = Stencil {
            offsets: [0; 8],
            weights: [0.0; 8],
        };
        for k in 0..8 {
            let (xi, wx) = if k & 1 == 0 { (x0, 1.0 - fx) } else { (x1, fx) };
            let (yi, wy) = if k & 2 == 0 { (y0, 1.0 - fy) } else { (y1, fy) };
            let (zi, wz) = if k & 4 == 0 { (z0, 1.0 - fz) } else { (z1, fz) };
            s.offsets[k] = self.grid.offset(xi, yi, zi);
            s.weights[k] = wx * wy * wz;
        }
        Some(s)
    }

    /// Trilinear value of component `c` at a continuous index; `None` outside.
    pub fn sample(&self, c: usize, index: &Vector3<f64>) -> Option<f64> {
        let s = self.stencil(index)?;
        let base = c * self.grid.num_voxels();
        Some((0..8).map(|k| s.weights[k] * self.data[base + s.offsets[k]]).sum())
    }

    /// Sample every component into `out`. Returns `false` outside the grid.
    pub fn sample_all(&self, index: &Vector3<f64>, out: &mut [f64]) -> bool {
        let Some(s) = self.stencil(index) else {
            return false;
        };
        let n = self.grid.num_voxels();
        for (c, value) in out.iter_mut().enumerate().take(self.components) {
            let base = c * n;
            *value = (0..8).map(|k| s.weights[k] * self.data[base + s.offsets[k]]).sum();
        }
        true
    }

    /// Trilinear value at a world point; `None` outside.
    pub fn sample_world(&self, c: usize, world: &Vector3<f64>) -> Option<f64> {
        self.sample(c, &self.grid.world_to_index(world))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{Direction3, Point3, Spacing3};
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;

    fn ramp() -> Volume {
        let grid = ImageGrid::new(
            [4, 5, 6],
            Point3::new([1.0, 2.0, 3.0]),
            Spacing3::new([2.0, 1.0, 0.5]),
            Direction3::identity(),
        )
        .unwrap();
        Volume::from_fn(grid, |p| 3.0 * p[0] - p[1] + 2.0 * p[2])
    }

    #[test]
    fn test_sample_reproduces_linear_function() {
        let vol = ramp();
        let world = Vector3::new(4.3, 3.7, 4.1);
        let value = vol.sample_world(0, &world).unwrap();
        assert_relative_eq!(value, 3.0 * 4.3 - 3.7 + 2.0 * 4.1, epsilon = 1e-9);
    }

    #[test]
    fn test_sample_outside_is_none() {
        let vol = ramp();
        assert!(vol.sample(0, &Vector3::new(-0.5, 0.0, 0.0)).is_none());
        assert!(vol.sample(0, &Vector3::new(0.0, 0.0, 3.5)).is_none());
        let mut out = [0.0];
        assert!(!vol.sample_all(&Vector3::new(10.0, 0.0, 0.0), &mut out));
    }

    #[test]
    fn test_image_roundtrip_and_truncation() {
        let device = Default::default();
        let vol = ramp();
        let images = vol.to_images::<NdArray<f32>>(&device);
        let back = Volume::from_images(&images).unwrap();
        assert_eq!(back.components(), 1);
        for (a, b) in back.data().iter().zip(vol.data()) {
            assert!((a - b).abs() < 1e-4);
        }

        let mut data = vol.data().to_vec();
        data.extend(vol.data().iter().map(|v| -v));
        let two = Volume::new(vol.grid().clone(), 2, data).unwrap();
        let one = two.truncated(1).unwrap();
        assert_eq!(one.data(), vol.data());
        assert!(two.truncated(3).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let grid = ImageGrid::with_shape([2, 2, 2]).unwrap();
        assert!(matches!(
            Volume::new(grid, 2, vec![0.0; 8]),
            Err(CoreError::ShapeMismatch { .. })
        ));
    }
}
