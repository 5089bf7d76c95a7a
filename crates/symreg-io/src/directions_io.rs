use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use symreg_registration::reorient::DirectionSet;

/// Read a direction set: one direction per line, either `az el` in radians
/// or `x y z`, separated by whitespace or commas. `#` starts a comment.
pub fn read_directions<P: AsRef<Path>>(path: P) -> Result<DirectionSet> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read directions {}", path.display()))?;
    parse_directions(&text).with_context(|| format!("Failed to parse directions {}", path.display()))
}

pub fn parse_directions(text: &str) -> Result<DirectionSet> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|ch: char| ch.is_whitespace() || ch == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f64>()
                    .with_context(|| format!("line {}: invalid number '{}'", lineno + 1, s))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(DirectionSet::from_rows(&rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_spherical_and_cartesian_rows() -> Result<()> {
        let text = format!("# az el\n0 0\n{} {}\n", FRAC_PI_2, FRAC_PI_2);
        let set = parse_directions(&text)?;
        assert_eq!(set.len(), 2);
        assert_relative_eq!(set.directions()[0], Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(set.directions()[1], Vector3::y(), epsilon = 1e-12);

        let set = parse_directions("0, 0, 2\n3 4 0 # unnormalised\n")?;
        assert_relative_eq!(set.directions()[1], Vector3::new(0.6, 0.8, 0.0), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_rows() {
        assert!(parse_directions("").is_err());
        assert!(parse_directions("1 2 3 4\n").is_err());
        assert!(parse_directions("0 0 0\n").is_err());
        assert!(parse_directions("a b\n").is_err());
    }

    #[test]
    fn test_reads_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dirs.txt");
        fs::write(&path, "0 0 1\n1 0 0\n0 1 0\n")?;
        assert_eq!(read_directions(&path)?.len(), 3);
        Ok(())
    }
}
