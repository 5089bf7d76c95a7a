//! Warp bundles on disk: a 5-D NIfTI `[X, Y, Z, 3, 4]` holding the four
//! midway fields, and a JSON sidecar holding the linear halves.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use symreg_registration::syn::{BundleHeader, WarpBundle, BUNDLE_FIELDS};
use symreg_registration::RegistrationError;

use crate::nifti_io::{read_volume, write_with_trailing};

/// `<warp>.json` next to `<warp>.nii[.gz]`.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    path.with_file_name(format!("{stem}.json"))
}

pub fn write_warp<P: AsRef<Path>>(path: P, bundle: &WarpBundle) -> Result<()> {
    let path = path.as_ref();
    let volume = bundle.to_volume()?;
    write_with_trailing(path, &volume, &[3, BUNDLE_FIELDS])?;

    let sidecar = sidecar_path(path);
    let json = serde_json::to_string_pretty(&bundle.header()).context("Failed to serialise warp header")?;
    fs::write(&sidecar, json).with_context(|| format!("Failed to write {}", sidecar.display()))?;
    tracing::info!("Saved warp bundle {} (+ {})", path.display(), sidecar.display());
    Ok(())
}

pub fn read_warp<P: AsRef<Path>>(path: P) -> Result<WarpBundle> {
    let path = path.as_ref();
    let image = read_volume(path)?;
    if image.trailing != [3, BUNDLE_FIELDS] {
        return Err(RegistrationError::malformed_bundle(format!(
            "{}: expected a 5D image with trailing dimensions [3, {}], found {} dimensions {:?}",
            path.display(),
            BUNDLE_FIELDS,
            image.trailing.len() + 3,
            image.trailing
        ))
        .into());
    }

    let sidecar = sidecar_path(path);
    let text = fs::read_to_string(&sidecar).map_err(|e| {
        RegistrationError::malformed_bundle(format!(
            "missing linear halves sidecar {}: {}",
            sidecar.display(),
            e
        ))
    })?;
    let header: BundleHeader =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", sidecar.display()))?;
    Ok(WarpBundle::from_volume(&image.volume, &header)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::write_volume;
    use nalgebra::{Matrix3, Vector3};
    use symreg_core::{DisplacementField, ImageGrid, LinearTransform, Volume};
    use tempfile::tempdir;

    #[test]
    fn test_sidecar_naming() {
        assert_eq!(sidecar_path(Path::new("/tmp/w.nii.gz")), PathBuf::from("/tmp/w.json"));
        assert_eq!(sidecar_path(Path::new("w.nii")), PathBuf::from("w.json"));
        assert_eq!(sidecar_path(Path::new("w.mif")), PathBuf::from("w.mif.json"));
    }

    #[test]
    fn test_bundle_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("warp.nii");
        let grid = ImageGrid::with_shape([3, 4, 5])?;
        let field = |s: f64| {
            DisplacementField::zeros(grid.clone()).map_voxels(|p, _| Vector3::new(s * p[0], 0.25, -s * p[2]))
        };
        let linear = LinearTransform::new(
            Matrix3::new(1.0, 0.1, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0),
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(2.0, 1.5, 1.0),
        )?;
        let bundle = WarpBundle::new(linear, field(0.5), field(-0.5), field(0.25), field(-0.25))?;

        write_warp(&path, &bundle)?;
        let back = read_warp(&path)?;
        assert_eq!(back.grid().shape(), grid.shape());
        assert_eq!(back.im1_forward(), bundle.im1_forward());
        assert_eq!(back.im2_inverse(), bundle.im2_inverse());
        let err = (back.linear().transform() - bundle.linear().transform()).abs().max();
        assert!(err < 1e-9, "{err}");
        Ok(())
    }

    #[test]
    fn test_rejects_non_bundle_image() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("plain.nii");
        write_volume(&path, &Volume::zeros(ImageGrid::with_shape([2, 2, 2])?, 3))?;
        let err = read_warp(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistrationError>(),
            Some(RegistrationError::MalformedBundle(_))
        ));
        Ok(())
    }
}
