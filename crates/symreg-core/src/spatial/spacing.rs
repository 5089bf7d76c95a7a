//! Spacing between adjacent voxels along each axis.

use super::Vector;

/// Physical distance between adjacent voxels along each axis (mm).
pub type Spacing<const D: usize> = Vector<D>;

impl<const D: usize> Spacing<D> {
    /// Same spacing along every axis.
    pub fn uniform(value: f64) -> Self {
        Self::new([value; D])
    }

    /// Smallest spacing component.
    pub fn min_spacing(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Mean spacing, used as the voxel size of isotropic grids and step units.
    pub fn mean_spacing(&self) -> f64 {
        self.0.iter().sum::<f64>() / D as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spacing_summaries() {
        let s = Spacing::<3>::new([1.0, 2.0, 3.0]);
        assert_eq!(s.min_spacing(), 1.0);
        assert!((s.mean_spacing() - 2.0).abs() < 1e-12);
        assert_eq!(Spacing::<3>::uniform(1.5), Spacing::new([1.5, 1.5, 1.5]));
    }
}
