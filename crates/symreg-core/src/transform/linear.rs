//! Centred linear transform with symmetric half transforms.
//!
//! `T(x) = A(x - c) + c + t`. The transform maps template (image 2) points
//! into moving (image 1) space. Its principal square root `H` satisfies
//! `H ∘ H = T`; `H` carries template space to the midway space and the
//! midway space on to moving space, while `H^-1` carries midway back to
//! template space.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use super::trait_::Transform;
use crate::error::{CoreError, Result};

const SQRT_MAX_ITERATIONS: usize = 100;
const SQRT_TOLERANCE: f64 = 1e-13;

/// Affine transform about a centre, caching its offset and half transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LinearTransformRecord", into = "LinearTransformRecord")]
pub struct LinearTransform {
    matrix: Matrix3<f64>,
    translation: Vector3<f64>,
    centre: Vector3<f64>,
    offset: Vector3<f64>,
    half: Matrix4<f64>,
    half_inverse: Matrix4<f64>,
}

#[derive(Serialize, Deserialize)]
struct LinearTransformRecord {
    transform: [[f64; 4]; 3],
    centre: [f64; 3],
}

impl TryFrom<LinearTransformRecord> for LinearTransform {
    type Error = CoreError;

    fn try_from(record: LinearTransformRecord) -> Result<Self> {
        let t = &record.transform;
        let full = Matrix3x4::from_fn(|r, c| t[r][c]);
        let mut out = Self::identity();
        out.set_centre_and_transform(Vector3::from(record.centre), &full)?;
        Ok(out)
    }
}

impl From<LinearTransform> for LinearTransformRecord {
    fn from(value: LinearTransform) -> Self {
        let full = value.transform();
        let mut transform = [[0.0; 4]; 3];
        for (r, row) in transform.iter_mut().enumerate() {
            for (c, entry) in row.iter_mut().enumerate() {
                *entry = full[(r, c)];
            }
        }
        Self {
            transform,
            centre: value.centre.into(),
        }
    }
}

impl Default for LinearTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl LinearTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
            translation: Vector3::zeros(),
            centre: Vector3::zeros(),
            offset: Vector3::zeros(),
            half: Matrix4::identity(),
            half_inverse: Matrix4::identity(),
        }
    }

    /// Build from linear part, translation and centre.
    pub fn new(matrix: Matrix3<f64>, translation: Vector3<f64>, centre: Vector3<f64>) -> Result<Self> {
        let mut out = Self::identity();
        out.matrix = matrix;
        out.translation = translation;
        out.centre = centre;
        out.update()?;
        Ok(out)
    }

    /// Build from a homogeneous 3x4 or the top rows of a 4x4, centred at the origin.
    pub fn from_matrix3x4(transform: &Matrix3x4<f64>) -> Result<Self> {
        let mut out = Self::identity();
        out.set_transform(transform)?;
        Ok(out)
    }

    pub fn set_matrix(&mut self, matrix: Matrix3<f64>) -> Result<()> {
        let mut next = self.clone();
        next.matrix = matrix;
        next.update()?;
        *self = next;
        Ok(())
    }

    pub fn set_translation(&mut self, translation: Vector3<f64>) -> Result<()> {
        let mut next = self.clone();
        next.translation = translation;
        next.update()?;
        *self = next;
        Ok(())
    }

    /// Move the centre keeping the translation, which changes the mapping.
    pub fn set_centre(&mut self, centre: Vector3<f64>) -> Result<()> {
        let mut next = self.clone();
        next.centre = centre;
        next.update()?;
        *self = next;
        Ok(())
    }

    /// Set the full 3x4 transform; the translation is recovered against the
    /// current centre as `offset - c + A c`.
    pub fn set_transform(&mut self, transform: &Matrix3x4<f64>) -> Result<()> {
        let centre = self.centre;
        self.set_centre_and_transform(centre, transform)
    }

    /// Move the centre keeping the mapping, adjusting the translation.
    pub fn set_centre_and_transform(
        &mut self,
        centre: Vector3<f64>,
        transform: &Matrix3x4<f64>,
    ) -> Result<()> {
        let matrix: Matrix3<f64> = transform.fixed_view::<3, 3>(0, 0).into_owned();
        let offset: Vector3<f64> = transform.column(3).into_owned();
        let mut next = self.clone();
        next.matrix = matrix;
        next.centre = centre;
        next.translation = offset - centre + matrix * centre;
        next.update()?;
        *self = next;
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.offset = self.translation + self.centre - self.matrix * self.centre;
        let full = self.homogeneous();
        let half = matrix_sqrt(&full)?;
        let half_inverse = half
            .try_inverse()
            .ok_or_else(|| CoreError::singular("half transform"))?;

        debug_assert!(
            relative_residual(&(half * half), &full) < 1e-8,
            "half transform does not square to the transform"
        );
        debug_assert!(
            full.try_inverse()
                .map(|inv| relative_residual(&(half_inverse * half_inverse), &inv) < 1e-8)
                .unwrap_or(true),
            "half inverse does not square to the inverse transform"
        );

        self.half = half;
        self.half_inverse = half_inverse;
        Ok(())
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn centre(&self) -> &Vector3<f64> {
        &self.centre
    }

    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    pub fn homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.matrix);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.offset);
        m
    }

    pub fn transform(&self) -> Matrix3x4<f64> {
        self.homogeneous().fixed_view::<3, 4>(0, 0).into_owned()
    }

    pub fn transform_half(&self) -> Matrix3x4<f64> {
        self.half.fixed_view::<3, 4>(0, 0).into_owned()
    }

    pub fn transform_half_inverse(&self) -> Matrix3x4<f64> {
        self.half_inverse.fixed_view::<3, 4>(0, 0).into_owned()
    }

    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * point + self.offset
    }

    pub fn apply_half(&self, point: &Vector3<f64>) -> Vector3<f64> {
        apply_homogeneous(&self.half, point)
    }

    pub fn apply_half_inverse(&self, point: &Vector3<f64>) -> Vector3<f64> {
        apply_homogeneous(&self.half_inverse, point)
    }

    /// Inverse about the image of the centre: `(A^-1, -t, c + t)`.
    pub fn inverse(&self) -> Result<Self> {
        let inv = self
            .matrix
            .try_inverse()
            .ok_or_else(|| CoreError::singular("linear transform"))?;
        Self::new(inv, -self.translation, self.centre + self.translation)
    }

    /// Linear transform for the half (`H`), as a standalone transform.
    pub fn half(&self) -> Result<Self> {
        let mut out = Self::identity();
        out.set_transform(&self.transform_half())?;
        Ok(out)
    }

    /// Linear transform for the half inverse (`H^-1`).
    pub fn half_inverse(&self) -> Result<Self> {
        let mut out = Self::identity();
        out.set_transform(&self.transform_half_inverse())?;
        Ok(out)
    }
}

pub fn apply_homogeneous(m: &Matrix4<f64>, point: &Vector3<f64>) -> Vector3<f64> {
    m.fixed_view::<3, 3>(0, 0) * point + m.fixed_view::<3, 1>(0, 3)
}

fn relative_residual(a: &Matrix4<f64>, b: &Matrix4<f64>) -> f64 {
    (a - b).norm() / b.norm().max(f64::MIN_POSITIVE)
}

/// Principal square root of a homogeneous 4x4 by scaled Denman–Beavers
/// iteration.
///
/// Fails on a non-positive determinant, and when the iteration does not
/// converge, which includes rotations by pi.
pub fn matrix_sqrt(m: &Matrix4<f64>) -> Result<Matrix4<f64>> {
    let det = m.determinant();
    if !(det > 0.0) || !det.is_finite() {
        return Err(CoreError::NonPositiveDeterminant { determinant: det });
    }

    let mut y = *m;
    let mut z: Matrix4<f64> = Matrix4::identity();
    let mut residual = f64::INFINITY;
    for _ in 0..SQRT_MAX_ITERATIONS {
        let scale = (y.determinant() * z.determinant()).abs().powf(-1.0 / 8.0);
        let (y_inv, z_inv) = match (y.try_inverse(), z.try_inverse()) {
            (Some(yi), Some(zi)) => (yi, zi),
            _ => break,
        };
        let next_y = 0.5 * (y * scale + z_inv / scale);
        let next_z = 0.5 * (z * scale + y_inv / scale);
        y = next_y;
        z = next_z;

        residual = relative_residual(&(y * y), m);
        if !residual.is_finite() {
            break;
        }
        if residual < SQRT_TOLERANCE {
            return Ok(y);
        }
    }

    // Accept a root that settled at rounding level above the tolerance.
    if residual < 1e-10 {
        return Ok(y);
    }
    Err(CoreError::SquareRootNotConverged {
        iterations: SQRT_MAX_ITERATIONS,
        residual,
    })
}

impl<B: Backend> Transform<B, 3> for LinearTransform {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        // Row vectors: y = x @ A^T + offset
        let device = points.device();
        let mut a_t = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                a_t.push(self.matrix[(c, r)] as f32);
            }
        }
        let a_t = Tensor::<B, 2>::from_data(TensorData::new(a_t, [3, 3]), &device);
        let offset: Vec<f32> = self.offset.iter().map(|&v| v as f32).collect();
        let offset = Tensor::<B, 2>::from_data(TensorData::new(offset, [1, 3]), &device);
        points.matmul(a_t) + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn_ndarray::NdArray;
    use nalgebra::Rotation3;

    fn sample() -> LinearTransform {
        let r = Rotation3::from_euler_angles(0.3, -0.2, 0.5).into_inner();
        LinearTransform::new(r * 1.1, Vector3::new(4.0, -2.0, 1.0), Vector3::new(10.0, 20.0, 5.0))
            .unwrap()
    }

    #[test]
    fn test_offset_factorisation() {
        let t = sample();
        let x = Vector3::new(1.0, 2.0, 3.0);
        let expected = t.matrix() * (x - t.centre()) + t.centre() + t.translation();
        assert_relative_eq!(t.apply(&x), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_half_squares_to_transform() {
        let t = sample();
        let x = Vector3::new(-3.0, 7.0, 0.5);
        assert_relative_eq!(t.apply_half(&t.apply_half(&x)), t.apply(&x), epsilon = 1e-9);
        let inv = t.inverse().unwrap();
        assert_relative_eq!(
            t.apply_half_inverse(&t.apply_half_inverse(&x)),
            inv.apply(&x),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_set_transform_recovers_translation() {
        let t = sample();
        let mut u = LinearTransform::identity();
        u.set_centre(*t.centre()).unwrap();
        u.set_transform(&t.transform()).unwrap();
        assert_relative_eq!(u.translation(), t.translation(), epsilon = 1e-12);
        assert_relative_eq!(u.offset(), t.offset(), epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_transforms_fail() {
        let mut reflect = Matrix3::identity();
        reflect[(0, 0)] = -1.0;
        assert!(matches!(
            LinearTransform::new(reflect, Vector3::zeros(), Vector3::zeros()),
            Err(CoreError::NonPositiveDeterminant { .. })
        ));

        let half_turn = Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::PI);
        let err = LinearTransform::new(half_turn.into_inner(), Vector3::zeros(), Vector3::zeros())
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::SquareRootNotConverged { .. } | CoreError::SingularMatrix(_)
        ));
    }

    #[test]
    fn test_failed_update_leaves_state_unchanged() {
        let mut t = sample();
        let before = t.clone();
        assert!(t.set_matrix(Matrix3::zeros()).is_err());
        assert_eq!(t, before);
    }

    #[test]
    fn test_serde_roundtrip() {
        let t = sample();
        let json = serde_json::to_string(&t).unwrap();
        let back: LinearTransform = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transform(), t.transform());
        assert_relative_eq!(back.translation(), t.translation(), epsilon = 1e-12);
    }

    #[test]
    fn test_tensor_transform_matches_host() {
        let t = sample();
        let device = Default::default();
        let points = Tensor::<NdArray<f32>, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let out: Vec<f32> = Transform::<NdArray<f32>, 3>::transform_points(&t, points)
            .into_data()
            .iter::<f32>()
            .collect();
        let expected = t.apply(&Vector3::new(1.0, 2.0, 3.0));
        for i in 0..3 {
            assert!((out[i] as f64 - expected[i]).abs() < 1e-3);
        }
    }
}
