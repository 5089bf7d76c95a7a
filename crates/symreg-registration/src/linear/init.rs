//! Starting transforms for linear stages.
//!
//! Every policy rotates about the template (image 2) centre or centroid and
//! translates it onto the corresponding point of the moving image (image 1).

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use symreg_core::{LinearTransform, Volume};

use super::config::InitPolicy;
use crate::error::{RegistrationError, Result};

/// Eigenvalue ratio below which a covariance counts as singular.
const SINGULAR_RATIO: f64 = 1e-10;

/// Intensity-weighted first and second moments of component 0.
#[derive(Debug, Clone)]
pub struct Moments {
    pub mass: f64,
    pub centroid: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

/// Moments over voxels with positive intensity and (when given) a mask
/// value above one half.
pub fn moments(volume: &Volume, mask: Option<&Volume>) -> Option<Moments> {
    let grid = volume.grid();
    let values = volume.component(0);
    let mut mass = 0.0;
    let mut sum = Vector3::zeros();
    let mut outer = Matrix3::zeros();
    for (offset, &v) in values.iter().enumerate() {
        if !(v > 0.0) {
            continue;
        }
        if let Some(m) = mask {
            if m.component(0)[offset] <= 0.5 {
                continue;
            }
        }
        let (x, y, z) = grid.coords(offset);
        let p = grid.voxel_to_world(x, y, z);
        mass += v;
        sum += v * p;
        outer += v * p * p.transpose();
    }
    if !(mass > 0.0) {
        return None;
    }
    let centroid = sum / mass;
    let covariance = outer / mass - centroid * centroid.transpose();
    Some(Moments {
        mass,
        centroid,
        covariance,
    })
}

/// Build the starting transform for `policy`.
///
/// `seed` is only consulted for [`InitPolicy::None`]; without one the stage
/// starts from the identity about the template centre.
pub fn initialise(
    policy: InitPolicy,
    seed: Option<&LinearTransform>,
    im1: &Volume,
    im2: &Volume,
    mask1: Option<&Volume>,
    mask2: Option<&Volume>,
) -> Result<LinearTransform> {
    let centre2 = im2.grid().centre();
    let transform = match policy {
        InitPolicy::None => match seed {
            Some(t) => return Ok(t.clone()),
            None => LinearTransform::new(Matrix3::identity(), Vector3::zeros(), centre2)?,
        },
        InitPolicy::Identity => LinearTransform::new(Matrix3::identity(), Vector3::zeros(), centre2)?,
        InitPolicy::Geometric => {
            let centre1 = im1.grid().centre();
            LinearTransform::new(Matrix3::identity(), centre1 - centre2, centre2)?
        }
        InitPolicy::Mass => {
            let (m1, m2) = both_moments(im1, im2, mask1, mask2)?;
            LinearTransform::new(Matrix3::identity(), m1.centroid - m2.centroid, m2.centroid)?
        }
        InitPolicy::Moments => {
            let (m1, m2) = both_moments(im1, im2, mask1, mask2)?;
            let rotation = principal_axes_rotation(&m1.covariance, &m2.covariance)?;
            LinearTransform::new(rotation, m1.centroid - m2.centroid, m2.centroid)?
        }
    };
    tracing::debug!(
        "{} initialisation: centre {:?}, translation {:?}",
        policy,
        transform.centre().as_slice(),
        transform.translation().as_slice()
    );
    Ok(transform)
}

fn both_moments(
    im1: &Volume,
    im2: &Volume,
    mask1: Option<&Volume>,
    mask2: Option<&Volume>,
) -> Result<(Moments, Moments)> {
    let m1 = moments(im1, mask1)
        .ok_or_else(|| RegistrationError::numerical_degeneracy("image 1 has no positive intensity under its mask"))?;
    let m2 = moments(im2, mask2)
        .ok_or_else(|| RegistrationError::numerical_degeneracy("image 2 has no positive intensity under its mask"))?;
    Ok((m1, m2))
}

/// Eigenvectors sorted by decreasing eigenvalue, as matrix columns.
fn principal_axes(covariance: &Matrix3<f64>, which: &str) -> Result<Matrix3<f64>> {
    let SymmetricEigen {
        eigenvalues: values,
        eigenvectors: vectors,
    } = SymmetricEigen::new(*covariance);

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    let largest = values[order[0]];
    let smallest = values[order[2]];
    if !(largest > 0.0) || smallest <= SINGULAR_RATIO * largest {
        return Err(RegistrationError::numerical_degeneracy(format!(
            "{which} intensity covariance is singular (eigenvalues {:.3e}..{:.3e})",
            smallest, largest
        )));
    }
    let mut axes = Matrix3::zeros();
    for (col, &k) in order.iter().enumerate() {
        axes.set_column(col, &vectors.column(k));
    }
    Ok(axes)
}

/// Rotation taking the template principal axes onto the moving ones, with
/// axis signs chosen for the smallest proper rotation.
pub fn principal_axes_rotation(cov1: &Matrix3<f64>, cov2: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let v1 = principal_axes(cov1, "image 1")?;
    let v2 = principal_axes(cov2, "image 2")?;

    let mut best: Option<(f64, Matrix3<f64>)> = None;
    for signs in 0..8u32 {
        let s = Matrix3::from_diagonal(&Vector3::new(
            if signs & 1 == 0 { 1.0 } else { -1.0 },
            if signs & 2 == 0 { 1.0 } else { -1.0 },
            if signs & 4 == 0 { 1.0 } else { -1.0 },
        ));
        let r = v1 * s * v2.transpose();
        if r.determinant() <= 0.0 {
            continue;
        }
        let trace = r.trace();
        if best.as_ref().map_or(true, |(t, _)| trace > *t) {
            best = Some((trace, r));
        }
    }
    best.map(|(_, r)| r)
        .ok_or_else(|| RegistrationError::numerical_degeneracy("no proper rotation between principal axes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use symreg_core::ImageGrid;

    fn blob(centre: Vector3<f64>) -> Volume {
        let grid = ImageGrid::with_shape([16, 16, 16]).unwrap();
        Volume::from_fn(grid, |p| {
            let d = p - centre;
            (-(d[0] * d[0] / 8.0 + d[1] * d[1] / 4.0 + d[2] * d[2] / 2.0)).exp()
        })
    }

    #[test]
    fn test_mass_aligns_centroids() {
        let im1 = blob(Vector3::new(8.0, 7.0, 6.5));
        let im2 = blob(Vector3::new(7.0, 7.5, 7.5));
        let t = initialise(InitPolicy::Mass, None, &im1, &im2, None, None).unwrap();
        assert_relative_eq!(*t.translation(), Vector3::new(1.0, -0.5, -1.0), epsilon = 1e-2);
        let c2 = moments(&im2, None).unwrap().centroid;
        assert_relative_eq!(t.apply(&c2), moments(&im1, None).unwrap().centroid, epsilon = 1e-9);
    }

    #[test]
    fn test_geometric_and_identity() {
        let im = blob(Vector3::new(7.5, 7.5, 7.5));
        let t = initialise(InitPolicy::Geometric, None, &im, &im, None, None).unwrap();
        assert_eq!(*t.translation(), Vector3::zeros());
        assert_eq!(*t.centre(), im.grid().centre());
        let t = initialise(InitPolicy::Identity, None, &im, &im, None, None).unwrap();
        assert_eq!(*t.matrix(), Matrix3::identity());
    }

    #[test]
    fn test_seed_is_used_for_none() {
        let im = blob(Vector3::new(7.5, 7.5, 7.5));
        let seed = LinearTransform::new(Matrix3::identity() * 1.1, Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()).unwrap();
        let t = initialise(InitPolicy::None, Some(&seed), &im, &im, None, None).unwrap();
        assert_eq!(t, seed);
    }

    #[test]
    fn test_moments_of_line_is_singular() {
        let grid = ImageGrid::with_shape([8, 8, 8]).unwrap();
        // A single bright line: zero spread across two axes.
        let line = Volume::from_fn(grid, |p| if p[1] == 3.0 && p[2] == 4.0 { 1.0 } else { 0.0 });
        let err = initialise(InitPolicy::Moments, None, &line, &line, None, None).unwrap_err();
        assert!(err.is_numerical_degeneracy());
    }

    #[test]
    fn test_masked_out_image_is_degenerate() {
        let im = blob(Vector3::new(7.5, 7.5, 7.5));
        let mask = Volume::zeros(im.grid().clone(), 1);
        assert!(initialise(InitPolicy::Mass, None, &im, &im, Some(&mask), None).is_err());
    }
}
