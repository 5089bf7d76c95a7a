//! Deterministic coarse search over rotations and translations.

use burn::tensor::backend::AutodiffBackend;
use nalgebra::{Rotation3, Vector3};
use symreg_core::LinearTransform;

use super::cost::CostFunction;
use crate::error::Result;

/// Euler angles tried about each axis, in degrees.
const ANGLES_DEG: [f64; 3] = [-30.0, 0.0, 30.0];
/// Translation offsets as a fraction of the template extent per axis.
const TRANSLATION_FRACTION: f64 = 0.125;

/// Candidate transforms around `start`: every Euler rotation from
/// [`ANGLES_DEG`] about the centre, combined with no offset or one offset of
/// `±extent/8` along a single axis.
pub fn candidates(start: &LinearTransform, extent: &Vector3<f64>) -> Vec<LinearTransform> {
    let mut offsets = vec![Vector3::zeros()];
    for axis in 0..3 {
        for sign in [-1.0, 1.0] {
            let mut v = Vector3::zeros();
            v[axis] = sign * TRANSLATION_FRACTION * extent[axis];
            offsets.push(v);
        }
    }

    let mut out = Vec::with_capacity(27 * offsets.len());
    for &rx in &ANGLES_DEG {
        for &ry in &ANGLES_DEG {
            for &rz in &ANGLES_DEG {
                let rotation = Rotation3::from_euler_angles(rx.to_radians(), ry.to_radians(), rz.to_radians());
                let matrix = rotation.into_inner() * start.matrix();
                for offset in &offsets {
                    // Candidates that cannot be rooted are simply skipped.
                    if let Ok(t) = LinearTransform::new(matrix, start.translation() + offset, *start.centre()) {
                        out.push(t);
                    }
                }
            }
        }
    }
    out
}

/// Score every candidate and return the cheapest, or `start` when none
/// overlaps the images.
pub fn global_search<A: AutodiffBackend>(cost: &CostFunction<'_, A>, start: &LinearTransform) -> Result<LinearTransform> {
    let grid = cost.template();
    let size = grid.size();
    let extent = Vector3::new(
        size[0] as f64 * grid.spacing()[0],
        size[1] as f64 * grid.spacing()[1],
        size[2] as f64 * grid.spacing()[2],
    );

    let start_cost = cost.cost(start);
    let mut best = (start_cost, start.clone());
    let candidates = candidates(start, &extent);
    let total = candidates.len();
    for candidate in candidates {
        let value = cost.cost(&candidate);
        if value.is_finite() && value < best.0 {
            best = (value, candidate);
        }
    }
    tracing::info!(
        "Global search over {} candidates: cost {:.6} -> {:.6}",
        total,
        start_cost,
        best.0
    );
    Ok(best.1)
}
