use nalgebra::{Matrix3x4, Rotation3, Vector3};
use proptest::prelude::*;
use symreg_core::LinearTransform;

fn close(a: &Vector3<f64>, b: &Vector3<f64>, rel: f64) -> bool {
    (a - b).norm() <= rel * (1.0 + b.norm())
}

proptest! {
    #[test]
    fn test_halves_square_to_transform(
        ax in -1.0f64..1.0, ay in -1.0f64..1.0, az in -1.0f64..1.0,
        tx in -20.0f64..20.0, ty in -20.0f64..20.0, tz in -20.0f64..20.0,
        cx in -50.0f64..50.0, cy in -50.0f64..50.0, cz in -50.0f64..50.0,
        px in -60.0f64..60.0, py in -60.0f64..60.0, pz in -60.0f64..60.0,
    ) {
        let r = Rotation3::from_euler_angles(ax, ay, az).into_inner();
        let t = LinearTransform::new(r, Vector3::new(tx, ty, tz), Vector3::new(cx, cy, cz)).unwrap();
        let inv = t.inverse().unwrap();
        let p = Vector3::new(px, py, pz);

        prop_assert!(close(&t.apply_half(&t.apply_half(&p)), &t.apply(&p), 1e-9));
        prop_assert!(close(&t.apply_half_inverse(&t.apply_half_inverse(&p)), &inv.apply(&p), 1e-9));
        prop_assert!(close(&t.apply_half_inverse(&t.apply_half(&p)), &p, 1e-9));
        prop_assert!(close(&inv.apply(&t.apply(&p)), &p, 1e-9));
    }

    #[test]
    fn test_affine_halves_square_to_transform(
        s0 in 0.7f64..1.4, s1 in 0.7f64..1.4, s2 in 0.7f64..1.4,
        shear in -0.2f64..0.2, angle in -1.2f64..1.2,
        tx in -10.0f64..10.0,
    ) {
        let r = Rotation3::from_euler_angles(0.0, angle, 0.3).into_inner();
        let mut a = r * nalgebra::Matrix3::from_diagonal(&Vector3::new(s0, s1, s2));
        a[(0, 1)] += shear;
        let t = LinearTransform::new(a, Vector3::new(tx, 0.0, -tx), Vector3::new(5.0, 5.0, 5.0)).unwrap();
        let p = Vector3::new(3.0, -7.0, 11.0);
        prop_assert!(close(&t.apply_half(&t.apply_half(&p)), &t.apply(&p), 1e-9));
    }
}

#[test]
fn test_identity_halves_are_identity() {
    let t = LinearTransform::identity();
    assert_eq!(t.transform_half(), Matrix3x4::identity());
    assert_eq!(t.transform_half_inverse(), Matrix3x4::identity());
}

#[test]
fn test_saved_text_reloads_bit_exact() {
    let r = Rotation3::from_euler_angles(0.123456789, -0.3, 0.7).into_inner();
    let t = LinearTransform::new(r * 1.05, Vector3::new(1.0 / 3.0, -2.5, 7.1), Vector3::zeros()).unwrap();
    let m = t.transform();
    let text: Vec<String> = m.iter().map(|v| format!("{v}")).collect();
    let parsed: Vec<f64> = text.iter().map(|s| s.parse().unwrap()).collect();
    let reloaded = Matrix3x4::from_column_slice(&parsed);
    assert_eq!(reloaded, m);
    let u = LinearTransform::from_matrix3x4(&reloaded).unwrap();
    assert_eq!(u.transform(), m);
}
