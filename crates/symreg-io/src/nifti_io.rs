use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use ndarray::{ArrayD, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;
use symreg_core::spatial::{Direction3, Point3, Spacing3};
use symreg_core::{ImageGrid, Volume};
use symreg_registration::pipeline::InputDims;

/// A volume read from disk with its on-disk dimensionality.
#[derive(Debug, Clone)]
pub struct NiftiVolume {
    pub volume: Volume,
    pub dims: InputDims,
    /// Extents beyond the three spatial axes, as stored.
    pub trailing: Vec<usize>,
}

/// Origin, spacing and direction from the sform, the qform, or pixdim alone.
fn header_geometry(header: &NiftiHeader) -> (Point3, Spacing3, Direction3) {
    let affine = if header.sform_code > 0 {
        [header.srow_x, header.srow_y, header.srow_z]
    } else if header.qform_code > 0 {
        let b = header.quatern_b;
        let c = header.quatern_c;
        let d = header.quatern_d;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] == 0.0 { 1.0 } else { header.pixdim[0] };

        let r11 = a * a + b * b - c * c - d * d;
        let r12 = 2.0 * b * c - 2.0 * a * d;
        let r13 = 2.0 * b * d + 2.0 * a * c;
        let r21 = 2.0 * b * c + 2.0 * a * d;
        let r22 = a * a + c * c - b * b - d * d;
        let r23 = 2.0 * c * d - 2.0 * a * b;
        let r31 = 2.0 * b * d - 2.0 * a * c;
        let r32 = 2.0 * c * d + 2.0 * a * b;
        let r33 = a * a + d * d - c * c - b * b;

        let dx = header.pixdim[1];
        let dy = header.pixdim[2];
        let dz = header.pixdim[3] * qfac;
        [
            [r11 * dx, r12 * dy, r13 * dz, header.quatern_x],
            [r21 * dx, r22 * dy, r23 * dz, header.quatern_y],
            [r31 * dx, r32 * dy, r33 * dz, header.quatern_z],
        ]
    } else {
        let spacing = |i: usize| if header.pixdim[i] > 0.0 { header.pixdim[i] } else { 1.0 };
        [
            [spacing(1), 0.0, 0.0, 0.0],
            [0.0, spacing(2), 0.0, 0.0],
            [0.0, 0.0, spacing(3), 0.0],
        ]
    };

    let m = Matrix3::from_fn(|r, c| affine[r][c] as f64);
    let origin = Point3::new([affine[0][3] as f64, affine[1][3] as f64, affine[2][3] as f64]);
    let mut spacing = [1.0; 3];
    let mut columns = [Vector3::x(), Vector3::y(), Vector3::z()];
    for axis in 0..3 {
        let col: Vector3<f64> = m.column(axis).into_owned();
        let norm = col.norm();
        if norm > 1e-9 {
            spacing[axis] = norm;
            columns[axis] = col / norm;
        }
    }
    (
        origin,
        Spacing3::new(spacing),
        Direction3::from_matrix(Matrix3::from_columns(&columns)),
    )
}

/// Header carrying the grid's geometry as an sform.
fn geometry_header(grid: &ImageGrid) -> NiftiHeader {
    let m = grid.index_to_world_matrix();
    let o = grid.origin().coords();
    let row = |r: usize| [m[(r, 0)] as f32, m[(r, 1)] as f32, m[(r, 2)] as f32, o[r] as f32];
    let spacing = grid.spacing();
    let mut header = NiftiHeader::default();
    header.sform_code = 1;
    header.qform_code = 0;
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header.pixdim[0] = 1.0;
    for axis in 0..3 {
        header.pixdim[axis + 1] = spacing[axis] as f32;
    }
    header
}

/// Read a NIfTI image of three or more dimensions.
///
/// Axes beyond the third are flattened into components, the first trailing
/// axis varying fastest.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<NiftiVolume> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    let (origin, spacing, direction) = header_geometry(obj.header());
    let array = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert volume to ndarray")?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        bail!(
            "{}: expected at least 3 dimensions, found {}",
            path.display(),
            shape.len()
        );
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let trailing = shape[3..].to_vec();
    let components: usize = trailing.iter().product();
    let grid = ImageGrid::new([nz, ny, nx], origin, spacing, direction)
        .with_context(|| format!("{}: invalid image geometry", path.display()))?;

    let n = grid.num_voxels();
    let mut data = vec![0.0; n * components];
    for (idx, value) in array.indexed_iter() {
        let mut c = 0;
        let mut stride = 1;
        for (k, &extent) in trailing.iter().enumerate() {
            c += idx[3 + k] * stride;
            stride *= extent;
        }
        data[c * n + grid.offset(idx[0], idx[1], idx[2])] = *value as f64;
    }

    let ndim = shape.len();
    tracing::debug!("Read {} ({} dims, {} volumes)", path.display(), ndim, components);
    Ok(NiftiVolume {
        volume: Volume::new(grid, components, data)?,
        dims: InputDims::new(ndim, if ndim == 3 { 1 } else { shape[3] }),
        trailing,
    })
}

/// Read a mask; it must be a single volume on `grid`'s voxel lattice.
pub fn read_mask<P: AsRef<Path>>(path: P, grid: &ImageGrid) -> Result<Volume> {
    let path = path.as_ref();
    let mask = read_volume(path)?.volume;
    if mask.components() != 1 {
        bail!("{}: mask must be a single 3D volume", path.display());
    }
    if mask.grid().shape() != grid.shape() {
        bail!(
            "{}: mask shape {:?} does not match image shape {:?}",
            path.display(),
            mask.grid().size(),
            grid.size()
        );
    }
    Ok(mask)
}

/// Write a volume as 3D (one component) or 4D.
pub fn write_volume<P: AsRef<Path>>(path: P, volume: &Volume) -> Result<()> {
    let trailing: Vec<usize> = if volume.components() == 1 {
        Vec::new()
    } else {
        vec![volume.components()]
    };
    write_with_trailing(path, volume, &trailing)
}

/// Write a volume whose components are laid out over `trailing` axes,
/// the first varying fastest.
pub fn write_with_trailing<P: AsRef<Path>>(path: P, volume: &Volume, trailing: &[usize]) -> Result<()> {
    let path = path.as_ref();
    let components: usize = trailing.iter().product();
    if components != volume.components() {
        bail!(
            "cannot lay out {} components over axes {:?}",
            volume.components(),
            trailing
        );
    }
    let [nx, ny, nz] = volume.grid().size();
    let mut shape = vec![nx, ny, nz];
    shape.extend_from_slice(trailing);

    let array = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
        let mut c = 0;
        let mut stride = 1;
        for (k, &extent) in trailing.iter().enumerate() {
            c += idx[3 + k] * stride;
            stride *= extent;
        }
        volume.value(c, idx[0], idx[1], idx[2]) as f32
    });

    let header = geometry_header(volume.grid());
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    tracing::debug!("Wrote {} {:?}", path.display(), shape);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use tempfile::tempdir;

    fn oblique_grid() -> ImageGrid {
        let r = Rotation3::from_euler_angles(0.0, 0.0, 0.3).into_inner();
        ImageGrid::new(
            [4, 5, 6],
            Point3::new([10.0, -5.0, 2.5]),
            Spacing3::new([1.5, 2.0, 2.5]),
            Direction3::from_matrix(r),
        )
        .unwrap()
    }

    #[test]
    fn test_read_nifti_basic() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.nii");

        // X=3, Y=4, Z=5 written without geometry.
        let array = ndarray::Array3::from_shape_fn((3, 4, 5), |(x, y, z)| (x + 10 * y + 100 * z) as f32);
        WriterOptions::new(&file_path).write_nifti(&array)?;

        let image = read_volume(&file_path)?;
        assert_eq!(image.volume.grid().shape(), [5, 4, 3]);
        assert_eq!(image.dims, InputDims::new(3, 1));
        assert_eq!(image.volume.value(0, 2, 1, 3), 312.0);
        Ok(())
    }

    #[test]
    fn test_geometry_and_components_survive_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("multi.nii");
        let grid = oblique_grid();
        let n = grid.num_voxels();
        let data: Vec<f64> = (0..3 * n).map(|i| (i % 97) as f64 * 0.5).collect();
        let volume = Volume::new(grid.clone(), 3, data)?;

        write_volume(&file_path, &volume)?;
        let back = read_volume(&file_path)?;
        assert_eq!(back.dims, InputDims::new(4, 3));
        assert_eq!(back.volume.data(), volume.data());
        let g = back.volume.grid();
        assert_relative_eq!(g.index_to_world_matrix(), grid.index_to_world_matrix(), epsilon = 1e-5);
        assert_relative_eq!(g.origin().coords(), grid.origin().coords(), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_mask_must_match_grid() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("mask.nii");
        let grid = ImageGrid::with_shape([3, 3, 3])?;
        write_volume(&file_path, &Volume::zeros(grid.clone(), 1))?;
        assert!(read_mask(&file_path, &grid).is_ok());
        let other = ImageGrid::with_shape([3, 3, 4])?;
        assert!(read_mask(&file_path, &other).is_err());
        Ok(())
    }
}
