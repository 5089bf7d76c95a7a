//! The four midway displacement fields of a symmetric warp and the linear
//! halves they are attached to.

use nalgebra::{Matrix3x4, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use symreg_core::transform::{compose_halfway_transforms, compose_linear_displacement};
use symreg_core::{DeformationField, DisplacementField, ImageGrid, LinearTransform, Volume};

use crate::error::{RegistrationError, Result};

/// Number of fields in a bundle.
pub const BUNDLE_FIELDS: usize = 4;

/// Field order within a bundle volume: component `3 * field + axis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleField {
    Im1Forward = 0,
    Im1Inverse = 1,
    Im2Forward = 2,
    Im2Inverse = 3,
}

/// Linear halves stored alongside the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    /// `H`: midway to image 1.
    pub im1_linear: [[f64; 4]; 3],
    /// `H^-1`: midway to image 2.
    pub im2_linear: [[f64; 4]; 3],
    /// Centre of the full transform.
    #[serde(default)]
    pub centre: [f64; 3],
}

/// Midway warps of both images.
///
/// All four fields live on the midway grid. `im1_forward` carries midway
/// points towards image 1 before the half `H` is applied, `im2_forward`
/// likewise towards image 2 before `H^-1`; the inverse fields undo them.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpBundle {
    linear: LinearTransform,
    im1_forward: DisplacementField,
    im1_inverse: DisplacementField,
    im2_forward: DisplacementField,
    im2_inverse: DisplacementField,
}

impl WarpBundle {
    /// Assemble a bundle; every field must share one grid.
    pub fn new(
        linear: LinearTransform,
        im1_forward: DisplacementField,
        im1_inverse: DisplacementField,
        im2_forward: DisplacementField,
        im2_inverse: DisplacementField,
    ) -> Result<Self> {
        let grid = im1_forward.grid();
        for (name, field) in [
            ("im1 inverse", &im1_inverse),
            ("im2 forward", &im2_forward),
            ("im2 inverse", &im2_inverse),
        ] {
            if !field.grid().same_geometry(grid, 1e-6) {
                return Err(RegistrationError::malformed_bundle(format!(
                    "{name} field grid {:?} differs from im1 forward grid {:?}",
                    field.grid().shape(),
                    grid.shape()
                )));
            }
        }
        Ok(Self {
            linear,
            im1_forward,
            im1_inverse,
            im2_forward,
            im2_inverse,
        })
    }

    /// Zero fields on `grid`.
    pub fn identity(linear: LinearTransform, grid: &ImageGrid) -> Self {
        let zero = DisplacementField::zeros(grid.clone());
        Self {
            linear,
            im1_forward: zero.clone(),
            im1_inverse: zero.clone(),
            im2_forward: zero.clone(),
            im2_inverse: zero,
        }
    }

    pub fn grid(&self) -> &ImageGrid {
        self.im1_forward.grid()
    }

    /// The full linear transform `T = H * H`.
    pub fn linear(&self) -> &LinearTransform {
        &self.linear
    }

    pub fn im1_forward(&self) -> &DisplacementField {
        &self.im1_forward
    }

    pub fn im1_inverse(&self) -> &DisplacementField {
        &self.im1_inverse
    }

    pub fn im2_forward(&self) -> &DisplacementField {
        &self.im2_forward
    }

    pub fn im2_inverse(&self) -> &DisplacementField {
        &self.im2_inverse
    }

    pub fn field(&self, which: BundleField) -> &DisplacementField {
        match which {
            BundleField::Im1Forward => &self.im1_forward,
            BundleField::Im1Inverse => &self.im1_inverse,
            BundleField::Im2Forward => &self.im2_forward,
            BundleField::Im2Inverse => &self.im2_inverse,
        }
    }

    /// Midway to image 1: `m -> H(m + u1(m))`.
    pub fn midway_to_im1(&self) -> Result<DeformationField> {
        Ok(compose_linear_displacement(&self.linear.half()?, &self.im1_forward))
    }

    /// Midway to image 2: `m -> H^-1(m + u2(m))`.
    pub fn midway_to_im2(&self) -> Result<DeformationField> {
        Ok(compose_linear_displacement(&self.linear.half_inverse()?, &self.im2_forward))
    }

    /// Template (image 2) to moving (image 1) deformation sampled on `grid`.
    pub fn template_to_moving(&self, grid: &ImageGrid) -> DeformationField {
        compose_halfway_transforms(&self.linear, &self.im1_forward, &self.im2_inverse, grid)
    }

    /// The larger of the two mean forward/inverse round-trip errors, in mm.
    pub fn round_trip_error(&self) -> f64 {
        let (e1, _) = self.im1_forward.round_trip_error(&self.im1_inverse);
        let (e2, _) = self.im2_forward.round_trip_error(&self.im2_inverse);
        e1.max(e2)
    }

    pub fn header(&self) -> BundleHeader {
        BundleHeader {
            im1_linear: rows(&self.linear.transform_half()),
            im2_linear: rows(&self.linear.transform_half_inverse()),
            centre: (*self.linear.centre()).into(),
        }
    }

    /// Twelve-component volume on the midway grid.
    pub fn to_volume(&self) -> Result<Volume> {
        let grid = self.grid().clone();
        let n = grid.num_voxels();
        let mut data = vec![0.0; BUNDLE_FIELDS * 3 * n];
        for (f, field) in [&self.im1_forward, &self.im1_inverse, &self.im2_forward, &self.im2_inverse]
            .into_iter()
            .enumerate()
        {
            for (i, u) in field.data().iter().enumerate() {
                for axis in 0..3 {
                    data[(3 * f + axis) * n + i] = u[axis];
                }
            }
        }
        Ok(Volume::new(grid, BUNDLE_FIELDS * 3, data)?)
    }

    /// Rebuild from a twelve-component volume and its header.
    pub fn from_volume(volume: &Volume, header: &BundleHeader) -> Result<Self> {
        if volume.components() != BUNDLE_FIELDS * 3 {
            return Err(RegistrationError::malformed_bundle(format!(
                "expected {} components (4 fields of 3), found {}",
                BUNDLE_FIELDS * 3,
                volume.components()
            )));
        }
        let linear = linear_from_header(header)?;
        let grid = volume.grid().clone();
        let field = |f: usize| {
            let (ux, uy, uz) = (
                volume.component(3 * f),
                volume.component(3 * f + 1),
                volume.component(3 * f + 2),
            );
            let data = (0..grid.num_voxels())
                .map(|i| Vector3::new(ux[i], uy[i], uz[i]))
                .collect();
            DisplacementField::new(grid.clone(), data)
        };
        Self::new(
            linear,
            field(BundleField::Im1Forward as usize)?,
            field(BundleField::Im1Inverse as usize)?,
            field(BundleField::Im2Forward as usize)?,
            field(BundleField::Im2Inverse as usize)?,
        )
    }
}

fn rows(m: &Matrix3x4<f64>) -> [[f64; 4]; 3] {
    let mut out = [[0.0; 4]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    out
}

fn homogeneous(rows: &[[f64; 4]; 3]) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    for (r, row) in rows.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            m[(r, c)] = *v;
        }
    }
    m
}

/// Recover `T = H * H` and check the stored `H^-1` against it.
pub fn linear_from_header(header: &BundleHeader) -> Result<LinearTransform> {
    let half = homogeneous(&header.im1_linear);
    let half_inverse = homogeneous(&header.im2_linear);
    let residual = (half * half_inverse - Matrix4::identity()).abs().max();
    if !(residual < 1e-4) {
        return Err(RegistrationError::malformed_bundle(format!(
            "stored linear halves are not inverse to each other (residual {residual:.3e})"
        )));
    }
    let full = half * half;
    let full: Matrix3x4<f64> = full.fixed_view::<3, 4>(0, 0).into_owned();
    let mut linear = LinearTransform::identity();
    linear.set_centre_and_transform(Vector3::from(header.centre), &full)?;
    Ok(linear)
}
