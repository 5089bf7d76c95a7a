//! Parameterisation of rigid and affine updates.
//!
//! The optimisation state is the half transform `H(m) = M(m - c) + c + t`,
//! with `H ∘ H = T`. Free parameters perturb `H` on the left: a rotation
//! vector `w` (rigid) or a matrix change `D` (affine), plus a translation
//! `d`. Rotation and matrix parameters are divided by the object radius so
//! that a unit step moves the boundary of the field of view by roughly one
//! millimetre.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use nalgebra::{Matrix3, Rotation3, Vector3};
use symreg_core::LinearTransform;

use super::config::TransformModel;

/// Number of free parameters of `model`.
pub fn parameters(model: TransformModel) -> usize {
    linear_parameters(model) + 3
}

fn linear_parameters(model: TransformModel) -> usize {
    match model {
        TransformModel::Rigid => 3,
        TransformModel::Affine => 9,
    }
}

/// Centred form of the half transform of a linear transform.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfFrame {
    pub matrix: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub centre: Vector3<f64>,
}

impl HalfFrame {
    /// Half of `transform`, about the transform's own centre.
    pub fn of(transform: &LinearTransform) -> Self {
        let half = transform.transform_half();
        let matrix: Matrix3<f64> = half.fixed_view::<3, 3>(0, 0).into_owned();
        let offset: Vector3<f64> = half.column(3).into_owned();
        let centre = *transform.centre();
        Self {
            matrix,
            translation: matrix * centre + offset - centre,
            centre,
        }
    }

    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * (point - self.centre) + self.centre + self.translation
    }

    /// `H ∘ H`, about the same centre.
    pub fn square(&self) -> symreg_core::Result<LinearTransform> {
        let identity = Matrix3::identity();
        LinearTransform::new(
            self.matrix * self.matrix,
            (self.matrix + identity) * self.translation,
            self.centre,
        )
    }
}

/// Left perturbation `P` (`[3, 3]`) and translation `d` (`[1, 3]`) encoded
/// by a scaled parameter vector, such that `H_p(m) = (I + P) M (m - c) + c
/// + t + d`.
pub fn perturbation<B: Backend>(
    model: TransformModel,
    params: Tensor<B, 1>,
    radius: f64,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let n = linear_parameters(model);
    let device = params.device();
    let linear = params.clone().narrow(0, 0, n) / radius;
    let translation = params.narrow(0, n, 3).reshape([1, 3]);

    let matrix = match model {
        TransformModel::Rigid => {
            let w = |i: usize| linear.clone().narrow(0, i, 1);
            let zero = || Tensor::<B, 1>::zeros([1], &device);
            // [w]x
            Tensor::cat(
                vec![
                    zero(),
                    w(2).neg(),
                    w(1),
                    w(2),
                    zero(),
                    w(0).neg(),
                    w(1).neg(),
                    w(0),
                    zero(),
                ],
                0,
            )
            .reshape([3, 3])
        }
        TransformModel::Affine => linear.reshape([3, 3]),
    };
    (matrix, translation)
}

/// Apply a step given in scaled parameters to the half of `transform` and
/// return the squared result.
pub fn apply_step(
    model: TransformModel,
    transform: &LinearTransform,
    step: &[f64],
    radius: f64,
) -> symreg_core::Result<LinearTransform> {
    let n = linear_parameters(model);
    let mut half = HalfFrame::of(transform);
    let update = match model {
        TransformModel::Rigid => {
            let w = Vector3::new(step[0], step[1], step[2]) / radius;
            Rotation3::new(w).into_inner()
        }
        TransformModel::Affine => Matrix3::identity() + Matrix3::from_row_slice(&step[..9]) / radius,
    };
    half.matrix = update * half.matrix;
    half.translation += Vector3::new(step[n], step[n + 1], step[n + 2]);
    half.square()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn transform() -> LinearTransform {
        LinearTransform::new(
            Rotation3::from_euler_angles(0.1, -0.2, 0.05).into_inner() * Matrix3::new(1.1, 0.05, 0.0, 0.0, 0.9, 0.0, 0.0, 0.0, 1.0),
            Vector3::new(1.0, 2.0, -1.0),
            Vector3::new(3.0, 3.0, 3.0),
        )
        .unwrap()
    }

    #[test]
    fn test_half_frame_squares_to_transform() {
        let t = transform();
        let half = HalfFrame::of(&t);
        let p = Vector3::new(5.0, -2.0, 7.0);
        assert_relative_eq!(half.apply(&half.apply(&p)), t.apply(&p), epsilon = 1e-9);
        assert_relative_eq!(half.apply(&p), t.apply_half(&p), epsilon = 1e-9);

        let squared = half.square().unwrap();
        assert_relative_eq!(squared.transform(), t.transform(), epsilon = 1e-9);
    }

    #[test]
    fn test_zero_step_keeps_transform() {
        for model in [TransformModel::Rigid, TransformModel::Affine] {
            let t = transform();
            let out = apply_step(model, &t, &vec![0.0; parameters(model)], 10.0).unwrap();
            assert_relative_eq!(out.transform(), t.transform(), epsilon = 1e-9);
        }
    }

    /// The tensor perturbation is the first-order expansion of `apply_step`.
    fn check_first_order(model: TransformModel) {
        let t = transform();
        let radius = 10.0;
        let half = HalfFrame::of(&t);
        let p = Vector3::new(5.0, -2.0, 7.0);
        let h = 1e-4;
        let device = Default::default();

        for k in 0..parameters(model) {
            let mut step = vec![0.0; parameters(model)];
            step[k] = h;
            let expected = HalfFrame::of(&apply_step(model, &t, &step, radius).unwrap()).apply(&p);

            let params = Tensor::<TestBackend, 1>::from_data(
                TensorData::new(step.iter().map(|&v| v as f32).collect::<Vec<_>>(), [step.len()]),
                &device,
            );
            let (matrix, translation) = perturbation(model, params, radius);
            let m: Vec<f64> = matrix.into_data().iter::<f64>().collect();
            let d: Vec<f64> = translation.into_data().iter::<f64>().collect();
            let perturb = Matrix3::from_row_slice(&m);
            let y = half.matrix * (p - half.centre);
            let actual = y + perturb * y + half.centre + half.translation + Vector3::from_row_slice(&d);
            assert_relative_eq!(actual, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rigid_perturbation_is_first_order_step() {
        check_first_order(TransformModel::Rigid);
    }

    #[test]
    fn test_affine_perturbation_is_first_order_step() {
        check_first_order(TransformModel::Affine);
    }

    #[test]
    fn test_rigid_step_stays_rigid() {
        let t = LinearTransform::identity();
        let out = apply_step(TransformModel::Rigid, &t, &[1.0, 0.5, -0.2, 0.0, 0.0, 0.0], 5.0).unwrap();
        let a = out.matrix();
        assert_relative_eq!(a.transpose() * a, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(a.determinant(), 1.0, epsilon = 1e-12);
    }
}
