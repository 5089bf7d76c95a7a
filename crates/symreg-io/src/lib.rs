pub mod nifti_io;
pub mod transform_io;
pub mod warp_io;
pub mod directions_io;

pub use nifti_io::{read_mask, read_volume, write_volume, NiftiVolume};
pub use transform_io::{load_linear, load_matrix, save_linear, save_matrix};
pub use warp_io::{read_warp, write_warp};
pub use directions_io::read_directions;
