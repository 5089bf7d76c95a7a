use anyhow::{Context, Result};
use clap::{Args, Parser};
use std::path::PathBuf;
use symreg_io::{load_linear, read_directions, read_warp};
use symreg_registration::pipeline::{
    AffineOptions, FodOptions, OutputRequest, PipelineConfig, RegistrationType, RigidOptions, SynOptions,
};
use symreg_registration::{Estimator, InitPolicy, MetricKind};

#[derive(Parser, Debug)]
#[command(name = "symreg")]
#[command(about = "Symmetric rigid, affine and nonlinear registration of 3D/4D images")]
#[command(version)]
pub struct Cli {
    /// Moving image (image 1)
    pub image1: PathBuf,

    /// Template image (image 2)
    pub image2: PathBuf,

    /// Registration stages to run
    #[arg(long = "type", default_value_t = RegistrationType::AffineSyn)]
    pub registration_type: RegistrationType,

    /// Write image 1 resampled into the space of image 2
    #[arg(long)]
    pub transformed: Option<PathBuf>,

    /// Write both images resampled into midway space (two paths)
    #[arg(long, num_args = 2, value_names = ["IMAGE1", "IMAGE2"])]
    pub transformed_midway: Option<Vec<PathBuf>>,

    /// Mask for image 1
    #[arg(long)]
    pub mask1: Option<PathBuf>,

    /// Mask for image 2
    #[arg(long)]
    pub mask2: Option<PathBuf>,

    /// Disable progress bars
    #[arg(long)]
    pub quiet: bool,

    #[command(flatten)]
    pub rigid: RigidArgs,

    #[command(flatten)]
    pub affine: AffineArgs,

    #[command(flatten)]
    pub syn: SynArgs,

    #[command(flatten)]
    pub fod: FodArgs,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Rigid registration")]
pub struct RigidArgs {
    /// Write the rigid transform
    #[arg(id = "rigid", long = "rigid")]
    pub output: Option<PathBuf>,

    /// Initial rigid transform (text matrix)
    #[arg(id = "rigid-init", long = "rigid-init")]
    pub init: Option<PathBuf>,

    /// Centre initialisation: mass, geometric, moments or none
    #[arg(id = "rigid-centre", long = "rigid-centre")]
    pub centre: Option<InitPolicy>,

    /// Pyramid scale factors
    #[arg(id = "rigid-scale", long = "rigid-scale", value_delimiter = ',')]
    pub scale: Option<Vec<f64>>,

    /// Iterations per level
    #[arg(id = "rigid-niter", long = "rigid-niter", value_delimiter = ',')]
    pub niter: Option<Vec<usize>>,

    /// Similarity metric: diff or ncc
    #[arg(id = "rigid-metric", long = "rigid-metric")]
    pub metric: Option<MetricKind>,

    /// Search a grid of rotations before optimising
    #[arg(id = "rigid-global-search", long = "rigid-global-search")]
    pub global_search: bool,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Affine registration")]
pub struct AffineArgs {
    /// Write the affine transform
    #[arg(id = "affine", long = "affine")]
    pub output: Option<PathBuf>,

    /// Write the half transform resampling image 1 into midway space
    #[arg(id = "affine-1tomidway", long = "affine-1tomidway")]
    pub half: Option<PathBuf>,

    /// Write the half transform resampling image 2 into midway space
    #[arg(id = "affine-2tomidway", long = "affine-2tomidway")]
    pub half_inverse: Option<PathBuf>,

    /// Initial affine transform (text matrix)
    #[arg(id = "affine-init", long = "affine-init")]
    pub init: Option<PathBuf>,

    /// Centre initialisation: mass, geometric, moments or none
    #[arg(id = "affine-centre", long = "affine-centre")]
    pub centre: Option<InitPolicy>,

    /// Pyramid scale factors
    #[arg(id = "affine-scale", long = "affine-scale", value_delimiter = ',')]
    pub scale: Option<Vec<f64>>,

    /// Iterations per level
    #[arg(id = "affine-niter", long = "affine-niter", value_delimiter = ',')]
    pub niter: Option<Vec<usize>>,

    /// Similarity metric: diff or ncc
    #[arg(id = "affine-metric", long = "affine-metric")]
    pub metric: Option<MetricKind>,

    /// Robust estimator: l1, l2 or lp
    #[arg(id = "affine-metric-estimator", long = "affine-metric-estimator")]
    pub estimator: Option<Estimator>,

    /// Fraction of voxels sampled per repetition, per level
    #[arg(id = "affine-loop-density", long = "affine-loop-density", value_delimiter = ',')]
    pub loop_density: Option<Vec<f64>>,

    /// Gradient repetitions per level
    #[arg(id = "affine-repetitions", long = "affine-repetitions", value_delimiter = ',')]
    pub repetitions: Option<Vec<usize>>,

    /// Combine repeated gradient estimates with the median
    #[arg(id = "affine-robust-median", long = "affine-robust-median")]
    pub robust_median: bool,

    /// Search a grid of rotations before optimising
    #[arg(id = "affine-global-search", long = "affine-global-search")]
    pub global_search: bool,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "Nonlinear (SyN) registration")]
pub struct SynArgs {
    /// Write the warp bundle (5D NIfTI plus JSON sidecar)
    #[arg(id = "syn-warp", long = "syn-warp")]
    pub output: Option<PathBuf>,

    /// Resume from a saved warp bundle
    #[arg(id = "syn-init", long = "syn-init")]
    pub init: Option<PathBuf>,

    /// Pyramid scale factors
    #[arg(id = "syn-scale", long = "syn-scale", value_delimiter = ',')]
    pub scale: Option<Vec<f64>>,

    /// Iterations per level
    #[arg(id = "syn-niter", long = "syn-niter", value_delimiter = ',')]
    pub niter: Option<Vec<usize>>,

    /// Gaussian sigma (voxels) applied to each update field
    #[arg(id = "syn-update-smooth", long = "syn-update-smooth")]
    pub update_smooth: Option<f64>,

    /// Gaussian sigma (voxels) applied to the displacement fields
    #[arg(id = "syn-disp-smooth", long = "syn-disp-smooth")]
    pub disp_smooth: Option<f64>,

    /// Gradient step, as a fraction of the mean voxel size
    #[arg(id = "syn-grad-step", long = "syn-grad-step")]
    pub grad_step: Option<f64>,
}

#[derive(Args, Debug, Default)]
#[command(next_help_heading = "FOD registration")]
pub struct FodArgs {
    /// Maximum harmonic degree used for registration
    #[arg(long)]
    pub lmax: Option<usize>,

    /// Direction set for reorientation (az el or x y z per line)
    #[arg(long)]
    pub directions: Option<PathBuf>,

    /// Treat 4D inputs as plain volume series
    #[arg(long)]
    pub no_reorientation: bool,
}

impl Cli {
    /// Load referenced transforms and bundles and build the pipeline options.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let rigid_init = self
            .rigid
            .init
            .as_ref()
            .map(|p| load_linear(p).with_context(|| format!("rigid-init {}", p.display())))
            .transpose()?;
        let affine_init = self
            .affine
            .init
            .as_ref()
            .map(|p| load_linear(p).with_context(|| format!("affine-init {}", p.display())))
            .transpose()?;
        let syn_init = self
            .syn
            .init
            .as_ref()
            .map(|p| read_warp(p).with_context(|| format!("syn-init {}", p.display())))
            .transpose()?;
        let directions = self.fod.directions.as_ref().map(read_directions).transpose()?;

        Ok(PipelineConfig {
            registration_type: self.registration_type,
            rigid: RigidOptions {
                scale: self.rigid.scale.clone(),
                niter: self.rigid.niter.clone(),
                metric: self.rigid.metric,
                centre: self.rigid.centre,
                init: rigid_init,
                global_search: self.rigid.global_search,
                save_transform: self.rigid.output.is_some(),
            },
            affine: AffineOptions {
                scale: self.affine.scale.clone(),
                niter: self.affine.niter.clone(),
                metric: self.affine.metric,
                centre: self.affine.centre,
                init: affine_init,
                global_search: self.affine.global_search,
                loop_density: self.affine.loop_density.clone(),
                repetitions: self.affine.repetitions.clone(),
                estimator: self.affine.estimator,
                robust_median: self.affine.robust_median,
                save_transform: self.affine.output.is_some(),
                save_half: self.affine.half.is_some(),
                save_half_inverse: self.affine.half_inverse.is_some(),
            },
            syn: SynOptions {
                scale: self.syn.scale.clone(),
                niter: self.syn.niter.clone(),
                update_smooth: self.syn.update_smooth,
                disp_smooth: self.syn.disp_smooth,
                grad_step: self.syn.grad_step,
                init: syn_init,
                save_warp: self.syn.output.is_some(),
            },
            fod: FodOptions {
                lmax: self.fod.lmax,
                directions,
                no_reorientation: self.fod.no_reorientation,
            },
            outputs: OutputRequest {
                transformed: self.transformed.is_some(),
                transformed_midway: self.transformed_midway.is_some(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("symreg").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["a.nii", "b.nii"]);
        assert_eq!(cli.registration_type, RegistrationType::AffineSyn);
        let config = cli.pipeline_config().unwrap();
        assert!(config.rigid.scale.is_none());
        assert!(!config.outputs.transformed);
        assert!(!config.syn.save_warp);
    }

    #[test]
    fn test_stage_flags_map_onto_options() {
        let cli = parse(&[
            "a.nii",
            "b.nii",
            "--type",
            "rigid_affine",
            "--rigid-scale",
            "0.5,1",
            "--affine-niter",
            "100,50",
            "--affine-metric",
            "ncc",
            "--affine-metric-estimator",
            "l1",
            "--affine-1tomidway",
            "half.txt",
            "--transformed-midway",
            "m1.nii",
            "m2.nii",
        ]);
        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.registration_type, RegistrationType::RigidAffine);
        assert_eq!(config.rigid.scale, Some(vec![0.5, 1.0]));
        assert_eq!(config.affine.niter, Some(vec![100, 50]));
        assert_eq!(config.affine.metric, Some(MetricKind::Ncc));
        assert_eq!(config.affine.estimator, Some(Estimator::L1));
        assert!(config.affine.save_half);
        assert!(!config.affine.save_half_inverse);
        assert!(config.outputs.transformed_midway);
    }

    #[test]
    fn test_rejects_unknown_values() {
        let args = ["symreg", "a.nii", "b.nii", "--type", "bspline"];
        assert!(Cli::try_parse_from(args).is_err());
        let args = ["symreg", "a.nii", "b.nii", "--rigid-metric", "mi"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_missing_init_file_is_reported() {
        let cli = parse(&["a.nii", "b.nii", "--rigid-init", "/nonexistent/rigid.txt"]);
        let err = cli.pipeline_config().unwrap_err();
        assert!(format!("{err:#}").contains("rigid-init"));
    }
}
