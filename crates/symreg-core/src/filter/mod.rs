pub mod gaussian;
pub mod pyramid;
pub mod resample;

pub use gaussian::GaussianFilter;
pub use pyramid::{downsample, resample_mask, MultiResolutionPyramid};
pub use resample::ResampleImageFilter;
