use approx::assert_relative_eq;
use nalgebra::{DMatrix, Matrix3, Rotation3, Vector3};
use proptest::prelude::*;
use symreg_core::{DeformationField, ImageGrid, Volume};
use symreg_registration::reorient::sh::basis;
use symreg_registration::reorient::{is_sh_count, l_for_n, n_for_l, DirectionSet, Reorienter};

#[test]
fn test_sh_count_tables() {
    let table = [(0, 1), (2, 6), (4, 15), (6, 28), (8, 45)];
    for (l, n) in table {
        assert_eq!(n_for_l(l), n);
        assert_eq!(l_for_n(n), l);
        assert!(is_sh_count(n));
    }
    for n in [2, 3, 7, 14, 16, 44] {
        assert!(!is_sh_count(n), "{n}");
    }
    // Partial series round down to the highest complete order.
    assert_eq!(l_for_n(20), 4);
}

#[test]
fn test_constant_term() {
    let y = basis(4, &Vector3::new(0.3, -0.4, 0.866).normalize());
    assert_eq!(y.len(), 15);
    assert_relative_eq!(y[0], 0.5 / std::f64::consts::PI.sqrt(), epsilon = 1e-12);
}

#[test]
fn test_identity_reorientation_is_identity() {
    let r = Reorienter::new(4, DirectionSet::default()).unwrap();
    let m = r.matrix(&Matrix3::identity());
    assert_relative_eq!(m, DMatrix::identity(15, 15), epsilon = 1e-9);

    let grid = ImageGrid::with_shape([3, 3, 3]).unwrap();
    let data: Vec<f64> = (0..15 * 27).map(|i| (i as f64 * 0.37).sin()).collect();
    let original = Volume::new(grid.clone(), 15, data).unwrap();
    let mut volume = original.clone();
    r.reorient_volume(&mut volume, &Matrix3::identity()).unwrap();
    for (a, b) in volume.data().iter().zip(original.data()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-9);
    }

    let mut warped = original.clone();
    r.reorient_warp(&mut warped, &DeformationField::from_fn(&grid, |p| *p)).unwrap();
    for (a, b) in warped.data().iter().zip(original.data()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-9);
    }
}

#[test]
fn test_odd_lmax_and_sparse_directions_are_rejected() {
    assert!(Reorienter::new(3, DirectionSet::default()).is_err());
    assert!(Reorienter::new(8, DirectionSet::hemisphere(30)).is_err());
}

proptest! {
    #[test]
    fn prop_rotation_then_inverse_is_identity(
        a in -3.0f64..3.0,
        b in -1.5f64..1.5,
        c in -3.0f64..3.0,
    ) {
        let r = Reorienter::new(4, DirectionSet::default()).unwrap();
        let rot = Rotation3::from_euler_angles(a, b, c).into_inner();
        let product = r.matrix(&rot) * r.matrix(&rot.transpose());
        let err = (product - DMatrix::<f64>::identity(15, 15)).abs().max();
        prop_assert!(err < 1e-8, "residual {}", err);
    }
}
