//! Validated configuration of a rigid or affine stage.

use std::fmt;
use std::str::FromStr;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use symreg_core::LinearTransform;

use crate::error::{RegistrationError, Result};
use crate::metric::{build_metric, validate_metric, Estimator, MetricKind, SimilarityMetric};
use crate::optimizer::GradientCombiner;
use crate::validation::{expand_iterations, validate_loop_density, validate_scale_factors};

/// Free parameters of a linear stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformModel {
    /// Rotation vector and translation.
    Rigid,
    /// All nine matrix entries and translation.
    Affine,
}

impl TransformModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rigid => "rigid",
            Self::Affine => "affine",
        }
    }
}

/// How a stage chooses its starting transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitPolicy {
    /// Identity about the template centre.
    Identity,
    /// Align intensity centroids.
    #[default]
    Mass,
    /// Align geometric image centres.
    Geometric,
    /// Align centroids and principal axes.
    Moments,
    /// Start from the caller-provided seed.
    None,
}

impl FromStr for InitPolicy {
    type Err = RegistrationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "mass" => Ok(Self::Mass),
            "geometric" => Ok(Self::Geometric),
            "moments" => Ok(Self::Moments),
            "none" => Ok(Self::None),
            other => Err(RegistrationError::invalid_configuration(format!(
                "unknown initialisation '{other}' (expected mass, geometric, moments or none)"
            ))),
        }
    }
}

impl fmt::Display for InitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Identity => "identity",
            Self::Mass => "mass",
            Self::Geometric => "geometric",
            Self::Moments => "moments",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Default per-level iteration cap of a linear stage.
pub const DEFAULT_LINEAR_ITERATIONS: usize = 500;

/// Immutable configuration of one linear stage.
#[derive(Debug, Clone)]
pub struct LinearConfig {
    pub model: TransformModel,
    /// Scale factors, coarsest first.
    pub scale_factors: Vec<f64>,
    /// Iteration cap per level.
    pub iterations: Vec<usize>,
    pub metric: MetricKind,
    pub estimator: Option<Estimator>,
    pub init: InitPolicy,
    /// Starting transform for [`InitPolicy::None`].
    pub seed: Option<LinearTransform>,
    pub global_search: bool,
    /// Fraction of voxels visited per level.
    pub loop_density: Vec<f64>,
    /// Descent restarts per level.
    pub repetitions: Vec<usize>,
    pub combiner: GradientCombiner,
    /// Per-parameter optimiser weights; `None` weighs all parameters equally.
    pub weights: Option<Vec<f64>>,
}

impl LinearConfig {
    pub fn rigid() -> Self {
        Self::with_model(TransformModel::Rigid)
    }

    pub fn affine() -> Self {
        Self::with_model(TransformModel::Affine)
    }

    fn with_model(model: TransformModel) -> Self {
        Self {
            model,
            scale_factors: vec![0.25, 0.5, 1.0],
            iterations: vec![DEFAULT_LINEAR_ITERATIONS],
            metric: MetricKind::Diff,
            estimator: None,
            init: InitPolicy::Mass,
            seed: None,
            global_search: false,
            loop_density: vec![1.0],
            repetitions: vec![1],
            combiner: GradientCombiner::Sum,
            weights: None,
        }
    }

    pub fn levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Number of free parameters.
    pub fn parameters(&self) -> usize {
        match self.model {
            TransformModel::Rigid => 6,
            TransformModel::Affine => 12,
        }
    }

    /// Check the configuration against images with `components` volumes and
    /// normalise per-level lists to one entry per level.
    pub fn validate(mut self, components: usize) -> Result<Self> {
        let stage = self.model.name();
        validate_scale_factors(&format!("{stage}_scale"), &self.scale_factors)?;
        let levels = self.levels();
        self.iterations = expand_iterations(&format!("{stage}_niter"), &self.iterations, levels)?;
        self.loop_density = expand_per_level(&format!("{stage}_loop_density"), &self.loop_density, levels)?;
        validate_loop_density(&self.loop_density)?;
        self.repetitions = expand_per_level(&format!("{stage}_repetitions"), &self.repetitions, levels)?;
        if self.repetitions.iter().any(|&r| r == 0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "{stage}_repetitions must be positive"
            )));
        }
        if self.seed.is_some() && self.init != InitPolicy::None {
            return Err(RegistrationError::invalid_configuration(format!(
                "{stage}_init and {stage}_centre ({}) are mutually exclusive",
                self.init
            )));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.parameters() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(RegistrationError::invalid_configuration(format!(
                    "{stage} optimiser weights need {} non-negative entries",
                    self.parameters()
                )));
            }
        }
        validate_metric(self.metric, self.estimator, components)?;
        Ok(self)
    }

    /// Resolve the metric for images with `components` volumes.
    pub fn build_metric<B: Backend>(&self, components: usize) -> Result<Box<dyn SimilarityMetric<B>>> {
        build_metric(self.metric, self.estimator, components)
    }

    pub fn optimiser_weights(&self) -> Vec<f64> {
        self.weights.clone().unwrap_or_else(|| vec![1.0; self.parameters()])
    }
}

fn expand_per_level<T: Copy>(option: &str, values: &[T], levels: usize) -> Result<Vec<T>> {
    match values.len() {
        1 => Ok(vec![values[0]; levels]),
        n if n == levels => Ok(values.to_vec()),
        n => Err(RegistrationError::invalid_configuration(format!(
            "{option}: {n} entries for {levels} scale levels"
        ))),
    }
}
