//! Plain-text linear transforms.
//!
//! A transform is three rows of four numbers (a trailing `0 0 0 1` row is
//! accepted on input). Numbers are written in Rust's shortest round-trip
//! form, so reloading reproduces every bit. Lines starting with `#` are
//! comments; a `#centre x y z` comment records the rotation centre.

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3x4, Vector3};
use std::fs;
use std::path::Path;
use symreg_core::LinearTransform;

const CENTRE_TAG: &str = "#centre";

fn format_rows(matrix: &Matrix3x4<f64>) -> String {
    (0..3)
        .map(|r| {
            let row: Vec<String> = (0..4).map(|c| matrix[(r, c)].to_string()).collect();
            row.join(" ") + "\n"
        })
        .collect()
}

/// Save a bare 3x4 matrix.
pub fn save_matrix<P: AsRef<Path>>(path: P, matrix: &Matrix3x4<f64>) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_rows(matrix)).with_context(|| format!("Failed to write transform {}", path.display()))
}

/// Save a linear transform with its centre.
pub fn save_linear<P: AsRef<Path>>(path: P, transform: &LinearTransform) -> Result<()> {
    let path = path.as_ref();
    let c = transform.centre();
    let out = format!("{CENTRE_TAG} {} {} {}\n{}", c[0], c[1], c[2], format_rows(&transform.transform()));
    fs::write(path, out).with_context(|| format!("Failed to write transform {}", path.display()))?;
    tracing::debug!("Saved transform {}", path.display());
    Ok(())
}

/// Parse matrix text and an optional centre.
pub fn parse_matrix(text: &str) -> Result<(Matrix3x4<f64>, Option<Vector3<f64>>)> {
    let mut centre = None;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(CENTRE_TAG) {
            let values = parse_numbers(rest, lineno)?;
            if values.len() != 3 {
                bail!("line {}: centre needs 3 values, found {}", lineno + 1, values.len());
            }
            centre = Some(Vector3::new(values[0], values[1], values[2]));
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rows.push(parse_numbers(line, lineno)?);
    }

    match rows.len() {
        3 => {}
        4 => {
            let last = &rows[3];
            if last.len() != 4 || last[..3].iter().any(|v| *v != 0.0) || last[3] != 1.0 {
                bail!("fourth row of a 4x4 transform must be 0 0 0 1");
            }
        }
        n => bail!("expected a 3x4 or 4x4 matrix, found {n} rows"),
    }
    if let Some(row) = rows.iter().take(3).find(|r| r.len() != 4) {
        bail!("expected 4 columns per row, found {}", row.len());
    }
    Ok((Matrix3x4::from_fn(|r, c| rows[r][c]), centre))
}

fn parse_numbers(line: &str, lineno: usize) -> Result<Vec<f64>> {
    line.split(|ch: char| ch.is_whitespace() || ch == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .with_context(|| format!("line {}: invalid number '{}'", lineno + 1, s))
        })
        .collect()
}

pub fn load_matrix<P: AsRef<Path>>(path: P) -> Result<Matrix3x4<f64>> {
    Ok(load(path.as_ref())?.0)
}

/// Load a linear transform; without a recorded centre the centre is the
/// origin.
pub fn load_linear<P: AsRef<Path>>(path: P) -> Result<LinearTransform> {
    let path = path.as_ref();
    let (matrix, centre) = load(path)?;
    let mut transform = LinearTransform::identity();
    transform
        .set_centre_and_transform(centre.unwrap_or_else(Vector3::zeros), &matrix)
        .with_context(|| format!("{}: not a valid linear transform", path.display()))?;
    Ok(transform)
}

fn load(path: &Path) -> Result<(Matrix3x4<f64>, Option<Vector3<f64>>)> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read transform {}", path.display()))?;
    parse_matrix(&text).with_context(|| format!("Failed to parse transform {}", path.display()))
}
