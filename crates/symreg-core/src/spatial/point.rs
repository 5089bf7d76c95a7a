//! Point type for physical-space positions.

use nalgebra::{Point as NaPoint, SVector};
use serde::{Deserialize, Serialize};
use super::Vector;

/// A position in D-dimensional physical space (mm).
///
/// Used for image origins and for the centres of linear transforms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point<const D: usize>(pub NaPoint<f64, D>);

impl<const D: usize> Point<D> {
    /// Create a new point from coordinates.
    pub fn new(coords: [f64; D]) -> Self {
        Self(NaPoint::from(coords))
    }

    /// The point with all coordinates zero.
    pub fn origin() -> Self {
        Self(NaPoint::origin())
    }

    /// Build a point from a raw nalgebra coordinate vector.
    pub fn from_coords(coords: SVector<f64, D>) -> Self {
        Self(NaPoint::from(coords))
    }

    /// The raw coordinate vector.
    pub fn coords(&self) -> SVector<f64, D> {
        self.0.coords
    }

    /// Coordinates as a `Vec`.
    pub fn to_vec(&self) -> Vec<f64> {
        self.0.coords.iter().copied().collect()
    }
}

impl<const D: usize> std::ops::Index<usize> for Point<D> {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0.coords[index]
    }
}

impl<const D: usize> std::ops::IndexMut<usize> for Point<D> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0.coords[index]
    }
}

impl<const D: usize> std::ops::Sub for Point<D> {
    type Output = Vector<D>;

    fn sub(self, other: Self) -> Self::Output {
        Vector(self.0.coords - other.0.coords)
    }
}

impl<const D: usize> std::ops::Add<Vector<D>> for Point<D> {
    type Output = Self;

    fn add(self, vector: Vector<D>) -> Self::Output {
        Self(self.0 + vector.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_arithmetic() {
        let p1 = Point::<3>::new([5.0, 5.0, 5.0]);
        let p2 = Point::<3>::new([2.0, 3.0, 4.0]);
        let diff = p1 - p2;
        assert_eq!(diff, Vector::new([3.0, 2.0, 1.0]));
        assert_eq!(p2 + diff, p1);
    }

    #[test]
    fn test_point_coords_roundtrip() {
        let p = Point::<3>::new([1.0, -2.0, 3.5]);
        assert_eq!(Point::from_coords(p.coords()), p);
        assert_eq!(p.to_vec(), vec![1.0, -2.0, 3.5]);
    }
}
