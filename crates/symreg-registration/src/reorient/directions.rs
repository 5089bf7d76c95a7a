//! Direction sets used to sample SH functions for reorientation.

use nalgebra::Vector3;

use crate::error::{RegistrationError, Result};

/// Size of the built-in hemisphere set.
pub const DEFAULT_DIRECTION_COUNT: usize = 60;

/// An ordered set of unit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionSet {
    directions: Vec<Vector3<f64>>,
}

impl Default for DirectionSet {
    fn default() -> Self {
        Self::hemisphere(DEFAULT_DIRECTION_COUNT)
    }
}

impl DirectionSet {
    /// `n` deterministic, roughly uniform directions on the upper
    /// hemisphere (golden-angle spiral, equal-area in `z`).
    pub fn hemisphere(n: usize) -> Self {
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        let directions = (0..n)
            .map(|i| {
                let z = 1.0 - (i as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).max(0.0).sqrt();
                let phi = golden * i as f64;
                Vector3::new(r * phi.cos(), r * phi.sin(), z)
            })
            .collect();
        Self { directions }
    }

    /// Build from numeric rows: `[azimuth elevation]` in radians or
    /// `[x y z]`.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        if rows.is_empty() {
            return Err(RegistrationError::invalid_configuration("direction set is empty"));
        }
        let directions = rows
            .iter()
            .enumerate()
            .map(|(i, row)| match row.as_slice() {
                &[az, el] => Ok(Vector3::new(el.sin() * az.cos(), el.sin() * az.sin(), el.cos())),
                &[x, y, z] => {
                    let v = Vector3::new(x, y, z);
                    let norm = v.norm();
                    if norm > 0.0 && norm.is_finite() {
                        Ok(v / norm)
                    } else {
                        Err(RegistrationError::invalid_configuration(format!(
                            "direction {i} has zero length"
                        )))
                    }
                }
                other => Err(RegistrationError::invalid_configuration(format!(
                    "direction {i} has {} values, expected 2 or 3",
                    other.len()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { directions })
    }

    pub fn directions(&self) -> &[Vector3<f64>] {
        &self.directions
    }

    pub fn len(&self) -> usize {
        self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_set_is_unit_hemisphere() {
        let set = DirectionSet::default();
        assert_eq!(set.len(), DEFAULT_DIRECTION_COUNT);
        for d in set.directions() {
            assert_relative_eq!(d.norm(), 1.0, epsilon = 1e-12);
            assert!(d[2] > 0.0);
        }
        assert_eq!(set, DirectionSet::default());
    }

    #[test]
    fn test_from_rows() {
        let set = DirectionSet::from_rows(&[
            vec![0.0, 0.0],
            vec![std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2],
            vec![2.0, 0.0, 0.0],
        ])
        .unwrap();
        assert_relative_eq!(set.directions()[0], Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(set.directions()[1], Vector3::y(), epsilon = 1e-12);
        assert_relative_eq!(set.directions()[2], Vector3::x(), epsilon = 1e-12);

        assert!(DirectionSet::from_rows(&[vec![1.0]]).is_err());
        assert!(DirectionSet::from_rows(&[vec![0.0, 0.0, 0.0]]).is_err());
        assert!(DirectionSet::from_rows(&[]).is_err());
    }
}
