//! Trilinear interpolation on burn tensors.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};

use super::trait_::Interpolator;

/// Value returned for indices outside the volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    /// Zero background.
    #[default]
    Zero,
    /// Indices are clamped onto the volume, repeating the border voxels.
    Clamp,
}

/// Trilinear interpolator.
///
/// With [`Boundary::Clamp`] the sampled value is continuous in the index
/// everywhere, so a cost built on it does not jump when a point leaves the
/// volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinearInterpolator {
    boundary: Boundary,
}

impl LinearInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clamped() -> Self {
        Self {
            boundary: Boundary::Clamp,
        }
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    fn clamp_axis<B: Backend>(coord: Tensor<B, 1>, n: usize) -> Tensor<B, 1> {
        coord.clamp(0.0, (n - 1) as f64)
    }

    fn gather_3d<B: Backend>(
        flat_data: &Tensor<B, 1>,
        xi: &Tensor<B, 1, Int>,
        yi: &Tensor<B, 1, Int>,
        zi: &Tensor<B, 1, Int>,
        stride_y: i32,
        stride_z: i32,
    ) -> Tensor<B, 1> {
        let idx = zi.clone() * stride_z + yi.clone() * stride_y + xi.clone();
        flat_data.clone().gather(0, idx)
    }

    /// 1 inside the sampled extent of an axis of length `n`, 0 outside.
    fn inside<B: Backend>(coord: &Tensor<B, 1>, n: usize) -> Tensor<B, 1> {
        let (lo, hi) = if n == 1 {
            (-0.5, 0.5)
        } else {
            (-1e-4, (n - 1) as f64 + 1e-4)
        };
        coord.clone().greater_equal_elem(lo).float() * coord.clone().lower_equal_elem(hi).float()
    }
}

impl<B: Backend> Interpolator<B> for LinearInterpolator {
    fn interpolate(&self, data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
        let [d0, d1, d2] = data.dims(); // Z, Y, X
        let batch_size = indices.dims()[0];
        let device = indices.device();

        let mut x = indices.clone().narrow(1, 0, 1).squeeze::<1>(1);
        let mut y = indices.clone().narrow(1, 1, 1).squeeze::<1>(1);
        let mut z = indices.narrow(1, 2, 1).squeeze::<1>(1);

        let mask = match self.boundary {
            Boundary::Zero => Some(Self::inside(&x, d2) * Self::inside(&y, d1) * Self::inside(&z, d0)),
            Boundary::Clamp => {
                x = Self::clamp_axis(x, d2);
                y = Self::clamp_axis(y, d1);
                z = Self::clamp_axis(z, d0);
                None
            }
        };

        // Cell corners carry no gradient; the weights do.
        let x0 = x.clone().detach().floor();
        let y0 = y.clone().detach().floor();
        let z0 = z.clone().detach().floor();

        let wx = x - x0.clone();
        let wy = y - y0.clone();
        let wz = z - z0.clone();

        let x1 = x0.clone() + 1.0;
        let y1 = y0.clone() + 1.0;
        let z1 = z0.clone() + 1.0;

        let x0_i = x0.clamp(0.0, (d2 - 1) as f64).int();
        let y0_i = y0.clamp(0.0, (d1 - 1) as f64).int();
        let z0_i = z0.clamp(0.0, (d0 - 1) as f64).int();

        let x1_i = x1.clamp(0.0, (d2 - 1) as f64).int();
        let y1_i = y1.clamp(0.0, (d1 - 1) as f64).int();
        let z1_i = z1.clamp(0.0, (d0 - 1) as f64).int();

        let stride_z = (d1 * d2) as i32;
        let stride_y = d2 as i32;

        let flat_data = data.clone().reshape([d0 * d1 * d2]);

        let v000 = Self::gather_3d(&flat_data, &x0_i, &y0_i, &z0_i, stride_y, stride_z);
        let v001 = Self::gather_3d(&flat_data, &x0_i, &y0_i, &z1_i, stride_y, stride_z);
        let v010 = Self::gather_3d(&flat_data, &x0_i, &y1_i, &z0_i, stride_y, stride_z);
        let v011 = Self::gather_3d(&flat_data, &x0_i, &y1_i, &z1_i, stride_y, stride_z);
        let v100 = Self::gather_3d(&flat_data, &x1_i, &y0_i, &z0_i, stride_y, stride_z);
        let v101 = Self::gather_3d(&flat_data, &x1_i, &y0_i, &z1_i, stride_y, stride_z);
        let v110 = Self::gather_3d(&flat_data, &x1_i, &y1_i, &z0_i, stride_y, stride_z);
        let v111 = Self::gather_3d(&flat_data, &x1_i, &y1_i, &z1_i, stride_y, stride_z);

        let one = Tensor::<B, 1>::ones([batch_size], &device);
        let one_minus_wx = one.clone() - wx.clone();
        let one_minus_wy = one.clone() - wy.clone();
        let one_minus_wz = one - wz.clone();

        let c00 = v000 * one_minus_wx.clone() + v100 * wx.clone();
        let c01 = v001 * one_minus_wx.clone() + v101 * wx.clone();
        let c10 = v010 * one_minus_wx.clone() + v110 * wx.clone();
        let c11 = v011 * one_minus_wx + v111 * wx;

        let c0 = c00 * one_minus_wy.clone() + c10 * wy.clone();
        let c1 = c01 * one_minus_wy + c11 * wy;

        let out = c0 * one_minus_wz + c1 * wz;
        match mask {
            Some(mask) => out * mask,
            None => out,
        }
    }
}
