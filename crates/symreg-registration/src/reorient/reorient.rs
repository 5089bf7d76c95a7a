//! Reorientation of SH coefficient vectors under linear maps and warps.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rayon::prelude::*;
use symreg_core::{DeformationField, Volume};

use super::directions::DirectionSet;
use super::sh;
use crate::error::{RegistrationError, Result};

/// Reorients SH coefficients by sampling the function at a direction set.
///
/// For a linear part `A`, the new coefficients are
/// `P * B(normalize(A d_k)) * c`, where `B(d)` holds the basis at each
/// direction and `P` is the pseudo-inverse of `B(d_k)`.
#[derive(Debug, Clone)]
pub struct Reorienter {
    lmax: usize,
    directions: DirectionSet,
    projector: DMatrix<f64>,
}

impl Reorienter {
    pub fn new(lmax: usize, directions: DirectionSet) -> Result<Self> {
        if lmax % 2 != 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "lmax must be even, got {lmax}"
            )));
        }
        let n = sh::n_for_l(lmax);
        if n > directions.len() {
            return Err(RegistrationError::invalid_configuration(format!(
                "{} directions cannot resolve the {n} coefficients of lmax {lmax}",
                directions.len()
            )));
        }
        let basis = basis_matrix(lmax, directions.directions().iter().copied());
        let projector = basis
            .pseudo_inverse(1e-12)
            .map_err(|e| RegistrationError::numerical_degeneracy(format!("SH basis pseudo-inverse: {e}")))?;
        Ok(Self {
            lmax,
            directions,
            projector,
        })
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    /// Coefficients per voxel.
    pub fn coefficients(&self) -> usize {
        sh::n_for_l(self.lmax)
    }

    pub fn directions(&self) -> &DirectionSet {
        &self.directions
    }

    /// Reorientation matrix for linear part `linear`.
    pub fn matrix(&self, linear: &Matrix3<f64>) -> DMatrix<f64> {
        let rotated = self
            .directions
            .directions()
            .iter()
            .map(|d| (linear * d).try_normalize(1e-12).unwrap_or(*d));
        &self.projector * basis_matrix(self.lmax, rotated)
    }

    /// Reorient every voxel of `volume` by the same linear part.
    pub fn reorient_volume(&self, volume: &mut Volume, linear: &Matrix3<f64>) -> Result<()> {
        let m = self.matrix(linear);
        self.reorient_voxels(volume, |_, coeffs, out| apply(&m, coeffs, out))
    }

    /// Reorient every voxel by the local Jacobian of `deformation`, which
    /// must share the volume's grid.
    pub fn reorient_warp(&self, volume: &mut Volume, deformation: &DeformationField) -> Result<()> {
        if volume.grid().shape() != deformation.grid().shape() {
            return Err(RegistrationError::ShapeMismatch {
                expected: volume.grid().shape().to_vec(),
                actual: deformation.grid().shape().to_vec(),
            });
        }
        let grid = deformation.grid().clone();
        self.reorient_voxels(volume, |offset, coeffs, out| {
            let (x, y, z) = grid.coords(offset);
            apply(&self.matrix(&deformation.jacobian(x, y, z)), coeffs, out)
        })
    }

    fn reorient_voxels<F>(&self, volume: &mut Volume, reorient: F) -> Result<()>
    where
        F: Fn(usize, &[f64], &mut [f64]) + Sync,
    {
        let n = self.coefficients();
        if volume.components() != n {
            return Err(RegistrationError::dimension_mismatch(format!(
                "expected {n} SH volumes for lmax {}, got {}",
                self.lmax,
                volume.components()
            )));
        }
        let voxels = volume.grid().num_voxels();
        let source = volume.data();
        let mut reoriented = vec![0.0; voxels * n];
        reoriented
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(offset, out)| {
                let coeffs: Vec<f64> = (0..n).map(|c| source[c * voxels + offset]).collect();
                reorient(offset, &coeffs, out);
            });
        let data = volume.data_mut();
        for (offset, coeffs) in reoriented.chunks_exact(n).enumerate() {
            for (c, value) in coeffs.iter().enumerate() {
                data[c * voxels + offset] = *value;
            }
        }
        Ok(())
    }
}

/// `out = matrix * coeffs`.
#[inline]
pub fn apply(matrix: &DMatrix<f64>, coeffs: &[f64], out: &mut [f64]) {
    for (r, o) in out.iter_mut().enumerate() {
        *o = (0..coeffs.len()).map(|c| matrix[(r, c)] * coeffs[c]).sum();
    }
}

fn basis_matrix(lmax: usize, directions: impl Iterator<Item = Vector3<f64>>) -> DMatrix<f64> {
    let rows: Vec<Vec<f64>> = directions.map(|d| sh::basis(lmax, &d)).collect();
    let n = sh::n_for_l(lmax);
    DMatrix::from_fn(rows.len(), n, |r, c| rows[r][c])
}
