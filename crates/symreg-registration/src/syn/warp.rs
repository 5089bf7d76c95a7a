//! Pulling images through deformations and differentiating the result.

use nalgebra::Vector3;
use rayon::prelude::*;
use symreg_core::{DeformationField, Volume};

use crate::error::Result;

/// A volume resampled onto a deformation's grid with per-voxel validity.
#[derive(Debug, Clone)]
pub struct Warped {
    pub volume: Volume,
    /// Whether the voxel landed inside the source and its mask.
    pub valid: Vec<bool>,
}

/// Sample `source` at every position of `deformation`.
///
/// Voxels mapping outside the source, or onto mask values of one half or
/// less, are zero and invalid.
pub fn warp_volume(source: &Volume, mask: Option<&Volume>, deformation: &DeformationField) -> Result<Warped> {
    let grid = deformation.grid();
    let n = grid.num_voxels();
    let components = source.components();
    let displacement = deformation.displacement().data();

    let mut samples = vec![0.0; n * components];
    let mut valid = vec![false; n];
    samples
        .par_chunks_mut(components)
        .zip(valid.par_iter_mut())
        .enumerate()
        .for_each(|(offset, (out, ok))| {
            let (x, y, z) = grid.coords(offset);
            let p = grid.voxel_to_world(x, y, z) + displacement[offset];
            let masked_in = mask.map_or(true, |m| matches!(m.sample_world(0, &p), Some(v) if v > 0.5));
            *ok = masked_in && source.sample_all(&source.grid().world_to_index(&p), out);
            if !*ok {
                out.fill(0.0);
            }
        });

    let mut data = vec![0.0; n * components];
    for (i, voxel) in samples.chunks_exact(components).enumerate() {
        for (c, v) in voxel.iter().enumerate() {
            data[c * n + i] = *v;
        }
    }
    Ok(Warped {
        volume: Volume::new(grid.clone(), components, data)?,
        valid,
    })
}

/// World-space gradient of component `c` by central differences, one-sided
/// at the boundary and zero along single-voxel axes.
pub fn gradient(volume: &Volume, c: usize) -> Vec<Vector3<f64>> {
    let grid = volume.grid();
    let size = grid.size();
    let values = volume.component(c);
    let m_t = grid.world_to_index_matrix().transpose();
    (0..grid.num_voxels())
        .into_par_iter()
        .map(|offset| {
            let (x, y, z) = grid.coords(offset);
            let idx = [x, y, z];
            let mut d = Vector3::zeros();
            for axis in 0..3 {
                let n = size[axis];
                if n < 2 {
                    continue;
                }
                let lo = idx[axis].saturating_sub(1);
                let hi = (idx[axis] + 1).min(n - 1);
                let mut a = idx;
                let mut b = idx;
                a[axis] = lo;
                b[axis] = hi;
                d[axis] = (values[grid.offset(b[0], b[1], b[2])] - values[grid.offset(a[0], a[1], a[2])])
                    / (hi - lo) as f64;
            }
            m_t * d
        })
        .collect()
}
