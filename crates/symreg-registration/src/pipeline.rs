//! Stage selection, option validation and sequencing of a full registration.
//!
//! A [`PipelineConfig`] holds the user-facing options of every stage.
//! [`PipelineConfig::validate`] checks them against the selected stages and
//! the input dimensions, producing a [`RegistrationPipeline`] with one
//! validated configuration per stage plus any [`ConfigWarning`]s. Running the
//! pipeline chains rigid, affine and SyN stages and builds the requested
//! output images.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use symreg_core::filter::ResampleImageFilter;
use symreg_core::interpolation::LinearInterpolator;
use symreg_core::transform::compose_linear_displacement;
use symreg_core::{ImageGrid, LinearTransform, Volume};

use crate::error::{RegistrationError, Result};
use crate::linear::{InitPolicy, LinearConfig, LinearRegistration, LinearResult};
use crate::metric::{Estimator, MetricKind};
use crate::optimizer::GradientCombiner;
use crate::progress::ProgressTracker;
use crate::reorient::{is_sh_count, l_for_n, n_for_l, DirectionSet, Reorienter};
use crate::syn::{midway_grid, warp_volume, SynConfig, SynRegistration, SynResult, WarpBundle};

/// Highest dimensionality accepted for inputs.
pub const MAX_INPUT_DIMENSIONS: usize = 4;
/// Default SH order when registering FODs.
pub const DEFAULT_LMAX: usize = 4;

/// Which stages run, in fixed rigid, affine, SyN order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationType {
    Rigid,
    Affine,
    Syn,
    RigidAffine,
    RigidSyn,
    #[default]
    AffineSyn,
    RigidAffineSyn,
}

impl RegistrationType {
    pub fn runs_rigid(self) -> bool {
        matches!(self, Self::Rigid | Self::RigidAffine | Self::RigidSyn | Self::RigidAffineSyn)
    }

    pub fn runs_affine(self) -> bool {
        matches!(self, Self::Affine | Self::RigidAffine | Self::AffineSyn | Self::RigidAffineSyn)
    }

    pub fn runs_syn(self) -> bool {
        matches!(self, Self::Syn | Self::RigidSyn | Self::AffineSyn | Self::RigidAffineSyn)
    }
}

impl FromStr for RegistrationType {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rigid" => Ok(Self::Rigid),
            "affine" => Ok(Self::Affine),
            "syn" => Ok(Self::Syn),
            "rigid_affine" => Ok(Self::RigidAffine),
            "rigid_syn" => Ok(Self::RigidSyn),
            "affine_syn" => Ok(Self::AffineSyn),
            "rigid_affine_syn" => Ok(Self::RigidAffineSyn),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown registration type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RegistrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rigid => "rigid",
            Self::Affine => "affine",
            Self::Syn => "syn",
            Self::RigidAffine => "rigid_affine",
            Self::RigidSyn => "rigid_syn",
            Self::AffineSyn => "affine_syn",
            Self::RigidAffineSyn => "rigid_affine_syn",
        };
        f.write_str(name)
    }
}

/// Rigid stage options; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct RigidOptions {
    pub scale: Option<Vec<f64>>,
    pub niter: Option<Vec<usize>>,
    pub metric: Option<MetricKind>,
    pub centre: Option<InitPolicy>,
    pub init: Option<LinearTransform>,
    pub global_search: bool,
    pub save_transform: bool,
}

impl RigidOptions {
    /// Names of the options that were given.
    fn given(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.save_transform {
            out.push("rigid");
        }
        if self.init.is_some() {
            out.push("rigid_init");
        }
        if self.centre.is_some() {
            out.push("rigid_centre");
        }
        if self.scale.is_some() {
            out.push("rigid_scale");
        }
        if self.niter.is_some() {
            out.push("rigid_niter");
        }
        if self.metric.is_some() {
            out.push("rigid_metric");
        }
        if self.global_search {
            out.push("rigid_global_search");
        }
        out
    }
}

/// Affine stage options.
#[derive(Debug, Clone, Default)]
pub struct AffineOptions {
    pub scale: Option<Vec<f64>>,
    pub niter: Option<Vec<usize>>,
    pub metric: Option<MetricKind>,
    pub centre: Option<InitPolicy>,
    pub init: Option<LinearTransform>,
    pub global_search: bool,
    pub loop_density: Option<Vec<f64>>,
    pub repetitions: Option<Vec<usize>>,
    pub estimator: Option<Estimator>,
    pub robust_median: bool,
    pub save_transform: bool,
    pub save_half: bool,
    pub save_half_inverse: bool,
}

impl AffineOptions {
    fn given(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (flag, name) in [
            (self.save_transform, "affine"),
            (self.save_half, "affine_1tomidway"),
            (self.save_half_inverse, "affine_2tomidway"),
            (self.init.is_some(), "affine_init"),
            (self.centre.is_some(), "affine_centre"),
            (self.scale.is_some(), "affine_scale"),
            (self.niter.is_some(), "affine_niter"),
            (self.metric.is_some(), "affine_metric"),
            (self.global_search, "affine_global_search"),
            (self.loop_density.is_some(), "affine_loop_density"),
            (self.repetitions.is_some(), "affine_repetitions"),
            (self.estimator.is_some(), "affine_metric_estimator"),
            (self.robust_median, "affine_robust_median"),
        ] {
            if flag {
                out.push(name);
            }
        }
        out
    }
}

/// SyN stage options.
#[derive(Debug, Clone, Default)]
pub struct SynOptions {
    pub scale: Option<Vec<f64>>,
    pub niter: Option<Vec<usize>>,
    pub update_smooth: Option<f64>,
    pub disp_smooth: Option<f64>,
    pub grad_step: Option<f64>,
    /// A previously saved warp bundle to resume from.
    pub init: Option<WarpBundle>,
    pub save_warp: bool,
}

impl SynOptions {
    fn given(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (flag, name) in [
            (self.save_warp, "syn_warp"),
            (self.init.is_some(), "syn_init"),
            (self.scale.is_some(), "syn_scale"),
            (self.niter.is_some(), "syn_niter"),
            (self.update_smooth.is_some(), "syn_update_smooth"),
            (self.disp_smooth.is_some(), "syn_disp_smooth"),
            (self.grad_step.is_some(), "syn_grad_step"),
        ] {
            if flag {
                out.push(name);
            }
        }
        out
    }
}

/// SH (FOD) handling.
#[derive(Debug, Clone, Default)]
pub struct FodOptions {
    pub lmax: Option<usize>,
    /// Overrides the default 60-direction hemisphere.
    pub directions: Option<DirectionSet>,
    pub no_reorientation: bool,
}

/// Which transformed images to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputRequest {
    /// Image 1 resampled into image 2 space.
    pub transformed: bool,
    /// Both images resampled into midway space.
    pub transformed_midway: bool,
}

/// Shape of one input as read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDims {
    pub ndim: usize,
    /// Extent of the 4th axis; 1 for 3-D images.
    pub volumes: usize,
}

impl InputDims {
    pub fn new(ndim: usize, volumes: usize) -> Self {
        Self { ndim, volumes }
    }

    /// Dimensions of an in-memory volume: 4-D whenever it has more than one
    /// component.
    pub fn of(volume: &Volume) -> Self {
        let volumes = volume.components();
        Self {
            ndim: if volumes > 1 { 4 } else { 3 },
            volumes,
        }
    }
}

/// A non-fatal configuration issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub option: &'static str,
    pub message: String,
}

impl ConfigWarning {
    fn new(option: &'static str, message: impl Into<String>) -> Self {
        let warning = Self {
            option,
            message: message.into(),
        };
        tracing::warn!("{}", warning);
        warning
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.option, self.message)
    }
}

/// All user options of a registration run.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub registration_type: RegistrationType,
    pub rigid: RigidOptions,
    pub affine: AffineOptions,
    pub syn: SynOptions,
    pub fod: FodOptions,
    pub outputs: OutputRequest,
}

impl PipelineConfig {
    /// Check every option against the selected stages and the inputs.
    pub fn validate(self, dims1: InputDims, dims2: InputDims) -> Result<RegistrationPipeline> {
        let mut warnings = Vec::new();

        if dims1.ndim != dims2.ndim {
            return Err(RegistrationError::dimension_mismatch(
                "input images do not have the same number of dimensions",
            ));
        }
        if dims2.ndim > MAX_INPUT_DIMENSIONS {
            return Err(RegistrationError::dimension_mismatch(format!(
                "image dimensions larger than {MAX_INPUT_DIMENSIONS} are not supported"
            )));
        }
        if dims2.ndim == 4 && dims1.volumes != dims2.volumes {
            return Err(RegistrationError::dimension_mismatch(
                "input images do not have the same number of volumes in the 4th dimension",
            ));
        }

        let (reorienter, volumes) = self.fod_plan(dims2)?;

        let kind = self.registration_type;
        let mut do_rigid = kind.runs_rigid();
        let mut do_affine = kind.runs_affine();
        let do_syn = kind.runs_syn();

        if !do_rigid {
            reject_unselected("rigid", &self.rigid.given())?;
        }
        if self.rigid.init.is_some() && self.rigid.centre.is_some() {
            return Err(RegistrationError::invalid_configuration(
                "options rigid_init and rigid_centre are mutually exclusive",
            ));
        }
        if !do_affine {
            reject_unselected("affine", &self.affine.given())?;
        }
        if self.affine.init.is_some() {
            if self.rigid.init.is_some() {
                return Err(RegistrationError::invalid_configuration(
                    "affine_init: cannot initialise with both a rigid and an affine transform",
                ));
            }
            if do_rigid {
                return Err(RegistrationError::invalid_configuration(
                    "affine_init: cannot initialise the affine stage while a rigid registration is performed",
                ));
            }
            if self.affine.centre.is_some() {
                return Err(RegistrationError::invalid_configuration(
                    "options affine_init and affine_centre are mutually exclusive",
                ));
            }
        }
        if !do_syn {
            reject_unselected("syn", &self.syn.given())?;
        }

        let resuming = self.syn.init.is_some();
        if resuming {
            if do_affine {
                warnings.push(ConfigWarning::new(
                    "syn_init",
                    "no affine registration will be performed when initialising with a SyN warp",
                ));
                do_affine = false;
            }
            if do_rigid {
                warnings.push(ConfigWarning::new(
                    "syn_init",
                    "no rigid registration will be performed when initialising with a SyN warp",
                ));
                do_rigid = false;
            }
            if self.affine.init.is_some() {
                warnings.push(ConfigWarning::new(
                    "affine_init",
                    "has no effect since the SyN init warp also contains the linear transform",
                ));
            }
            if self.rigid.init.is_some() {
                warnings.push(ConfigWarning::new(
                    "rigid_init",
                    "has no effect since the SyN init warp also contains the linear transform",
                ));
            }
            if self.syn.scale.as_ref().is_some_and(|s| s.len() > 1) {
                warnings.push(ConfigWarning::new(
                    "syn_scale",
                    "ignored since only the full resolution is run when initialising with a SyN warp",
                ));
            }
        }

        let rigid = do_rigid
            .then(|| self.rigid_config(volumes))
            .transpose()?;
        let affine = do_affine
            .then(|| self.affine_config(volumes))
            .transpose()?;
        let syn = do_syn
            .then(|| self.syn_config(resuming))
            .transpose()?;

        Ok(RegistrationPipeline {
            rigid,
            affine,
            syn,
            syn_init: self.syn.init,
            reorienter,
            volumes,
            outputs: self.outputs,
            warnings,
            tracker: ProgressTracker::new(),
        })
    }

    /// SH detection: reorienter and the number of volumes to register.
    fn fod_plan(&self, dims: InputDims) -> Result<(Option<Reorienter>, usize)> {
        let n = dims.volumes;
        let is_sh = dims.ndim == 4 && n > 1 && is_sh_count(n) && !self.fod.no_reorientation;
        if !is_sh {
            return Ok((None, n));
        }
        let lmax = match self.fod.lmax {
            Some(l) if l % 2 == 1 => {
                return Err(RegistrationError::invalid_configuration("the input lmax must be even"));
            }
            Some(l) => l,
            None => DEFAULT_LMAX.min(l_for_n(n)),
        };
        let coefficients = n_for_l(lmax);
        if coefficients > n {
            return Err(RegistrationError::invalid_configuration(format!(
                "lmax: not enough SH coefficients for lmax {lmax} ({coefficients} needed, {n} present)"
            )));
        }
        tracing::info!("SH series detected, registering FOD images using lmax = {}", lmax);
        let directions = self.fod.directions.clone().unwrap_or_default();
        Ok((Some(Reorienter::new(lmax, directions)?), coefficients))
    }

    fn rigid_config(&self, components: usize) -> Result<LinearConfig> {
        let o = &self.rigid;
        let mut config = LinearConfig::rigid();
        if let Some(s) = &o.scale {
            config.scale_factors = s.clone();
        }
        if let Some(n) = &o.niter {
            config.iterations = n.clone();
        }
        if let Some(m) = o.metric {
            config.metric = m;
        }
        config.global_search = o.global_search;
        if let Some(init) = &o.init {
            config.seed = Some(init.clone());
            config.init = InitPolicy::None;
        } else if let Some(c) = o.centre {
            config.init = c;
        }
        config.validate(components)
    }

    fn affine_config(&self, components: usize) -> Result<LinearConfig> {
        let o = &self.affine;
        let mut config = LinearConfig::affine();
        if let Some(s) = &o.scale {
            config.scale_factors = s.clone();
        }
        if let Some(n) = &o.niter {
            config.iterations = n.clone();
        }
        if let Some(m) = o.metric {
            config.metric = m;
        }
        if let Some(d) = &o.loop_density {
            config.loop_density = d.clone();
        }
        if let Some(r) = &o.repetitions {
            config.repetitions = r.clone();
        }
        config.estimator = o.estimator;
        if o.robust_median {
            config.combiner = GradientCombiner::Median;
        }
        config.global_search = o.global_search;
        if let Some(init) = &o.init {
            config.seed = Some(init.clone());
            config.init = InitPolicy::None;
        } else if let Some(c) = o.centre {
            config.init = c;
        }
        config.validate(components)
    }

    fn syn_config(&self, resuming: bool) -> Result<SynConfig> {
        let o = &self.syn;
        let mut config = SynConfig::default();
        if let Some(s) = &o.scale {
            config.scale_factors = s.clone();
        }
        if let Some(n) = &o.niter {
            config.iterations = n.clone();
        }
        if let Some(v) = o.update_smooth {
            config.update_smooth = v;
        }
        if let Some(v) = o.disp_smooth {
            config.disp_smooth = v;
        }
        if let Some(v) = o.grad_step {
            config.grad_step = v;
        }
        config.validate(resuming)
    }
}

fn reject_unselected(stage: &str, given: &[&'static str]) -> Result<()> {
    match given.first() {
        Some(option) => Err(RegistrationError::invalid_configuration(format!(
            "{option}: option given when no {stage} registration is requested"
        ))),
        None => Ok(()),
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub rigid: Option<LinearResult>,
    pub affine: Option<LinearResult>,
    pub syn: Option<SynResult>,
    /// Image 1 in image 2 space.
    pub transformed: Option<Volume>,
    /// Image 1 and image 2 in midway space.
    pub transformed_midway: Option<(Volume, Volume)>,
    pub warnings: Vec<ConfigWarning>,
}

impl PipelineResult {
    /// The last linear transform estimated, if any stage ran.
    pub fn linear(&self) -> Option<&LinearTransform> {
        self.affine
            .as_ref()
            .or(self.rigid.as_ref())
            .map(|r| &r.transform)
            .or_else(|| self.syn.as_ref().map(|s| s.bundle.linear()))
    }
}

/// Validated stages ready to run.
#[derive(Debug)]
pub struct RegistrationPipeline {
    rigid: Option<LinearConfig>,
    affine: Option<LinearConfig>,
    syn: Option<SynConfig>,
    syn_init: Option<WarpBundle>,
    reorienter: Option<Reorienter>,
    volumes: usize,
    outputs: OutputRequest,
    warnings: Vec<ConfigWarning>,
    tracker: ProgressTracker,
}

impl RegistrationPipeline {
    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn warnings(&self) -> &[ConfigWarning] {
        &self.warnings
    }

    pub fn rigid(&self) -> Option<&LinearConfig> {
        self.rigid.as_ref()
    }

    pub fn affine(&self) -> Option<&LinearConfig> {
        self.affine.as_ref()
    }

    pub fn syn(&self) -> Option<&SynConfig> {
        self.syn.as_ref()
    }

    pub fn reorienter(&self) -> Option<&Reorienter> {
        self.reorienter.as_ref()
    }

    /// Number of volumes registered after SH truncation.
    pub fn volumes(&self) -> usize {
        self.volumes
    }

    /// Run every selected stage in order and build the requested outputs.
    pub fn run<B: Backend>(
        self,
        im1: &Volume,
        im2: &Volume,
        mask1: Option<&Volume>,
        mask2: Option<&Volume>,
        device: &B::Device,
    ) -> Result<PipelineResult> {
        let im1 = truncate(im1, self.volumes)?;
        let im2 = truncate(im2, self.volumes)?;

        let rigid = match self.rigid.clone() {
            Some(config) => {
                tracing::info!("Running rigid registration");
                let mut stage = self.linear_stage(config);
                Some(stage.execute::<B>(&im1, &im2, mask1, mask2, device)?)
            }
            None => None,
        };

        let affine = match self.affine.clone() {
            Some(mut config) => {
                tracing::info!("Running affine registration");
                if let Some(r) = &rigid {
                    config.seed = Some(r.transform.clone());
                    config.init = InitPolicy::None;
                }
                let mut stage = self.linear_stage(config);
                Some(stage.execute::<B>(&im1, &im2, mask1, mask2, device)?)
            }
            None => None,
        };

        let syn = match self.syn.clone() {
            Some(config) => {
                tracing::info!("Running SyN registration");
                let linear = affine
                    .as_ref()
                    .or(rigid.as_ref())
                    .map(|r| r.transform.clone())
                    .unwrap_or_default();
                let mut stage = SynRegistration::new(config).with_progress(self.tracker.clone());
                if let Some(r) = &self.reorienter {
                    stage = stage.with_reorienter(r.clone());
                }
                Some(stage.execute::<B>(&im1, &im2, mask1, mask2, &linear, self.syn_init.as_ref(), device)?)
            }
            None => None,
        };

        let mut result = PipelineResult {
            rigid,
            affine,
            syn,
            transformed: None,
            transformed_midway: None,
            warnings: self.warnings.clone(),
        };

        if self.outputs.transformed {
            tracing::info!("Transforming image 1 into image 2 space");
            result.transformed = Some(self.transform_to_template::<B>(&result, &im1, im2.grid(), device)?);
        }
        if self.outputs.transformed_midway {
            tracing::info!("Transforming both images into midway space");
            result.transformed_midway = Some(self.transform_to_midway::<B>(&result, &im1, &im2, device)?);
        }
        Ok(result)
    }

    fn linear_stage(&self, config: LinearConfig) -> LinearRegistration {
        let stage = LinearRegistration::new(config).with_progress(self.tracker.clone());
        match &self.reorienter {
            Some(r) => stage.with_reorienter(r.clone()),
            None => stage,
        }
    }

    fn transform_to_template<B: Backend>(
        &self,
        result: &PipelineResult,
        im1: &Volume,
        grid: &ImageGrid,
        device: &B::Device,
    ) -> Result<Volume> {
        if let Some(syn) = &result.syn {
            let deformation = syn.bundle.template_to_moving(grid);
            let mut out = warp_volume(im1, None, &deformation)?.volume;
            if let Some(r) = &self.reorienter {
                r.reorient_warp(&mut out, &deformation)?;
            }
            return Ok(out);
        }
        let linear = result.linear().cloned().unwrap_or_default();
        let mut out = ResampleImageFilter::<B, _, _>::from_grid(grid, &linear, LinearInterpolator::new())
            .apply_volume(im1, device)?;
        if let Some(r) = &self.reorienter {
            r.reorient_volume(&mut out, linear.matrix())?;
        }
        Ok(out)
    }

    fn transform_to_midway<B: Backend>(
        &self,
        result: &PipelineResult,
        im1: &Volume,
        im2: &Volume,
        device: &B::Device,
    ) -> Result<(Volume, Volume)> {
        if let Some(syn) = &result.syn {
            let bundle = &syn.bundle;
            let linear = bundle.linear();
            let to_im1 = compose_linear_displacement(&linear.half()?, bundle.im1_forward());
            let to_im2 = compose_linear_displacement(&linear.half_inverse()?, bundle.im2_forward());
            let mut out1 = warp_volume(im1, None, &to_im1)?.volume;
            let mut out2 = warp_volume(im2, None, &to_im2)?.volume;
            if let Some(r) = &self.reorienter {
                r.reorient_warp(&mut out1, &to_im1)?;
                r.reorient_warp(&mut out2, &to_im2)?;
            }
            return Ok((out1, out2));
        }

        let linear = result.linear().cloned().unwrap_or_default();
        let grid = midway_grid(im1.grid(), im2.grid(), &linear)?;
        let half = linear.half()?;
        let half_inverse = linear.half_inverse()?;
        let mut out1 = ResampleImageFilter::<B, _, _>::from_grid(&grid, &half, LinearInterpolator::new())
            .apply_volume(im1, device)?;
        let mut out2 = ResampleImageFilter::<B, _, _>::from_grid(&grid, &half_inverse, LinearInterpolator::new())
            .apply_volume(im2, device)?;
        if let Some(r) = &self.reorienter {
            r.reorient_volume(&mut out1, half.matrix())?;
            r.reorient_volume(&mut out2, half_inverse.matrix())?;
        }
        Ok((out1, out2))
    }
}

fn truncate(volume: &Volume, volumes: usize) -> Result<Volume> {
    if volume.components() > volumes {
        Ok(volume.truncated(volumes)?)
    } else {
        Ok(volume.clone())
    }
}
