pub mod metric;
pub mod optimizer;
pub mod linear;
pub mod syn;
pub mod reorient;
pub mod pipeline;
pub mod error;
pub mod validation;
pub mod progress;

pub use error::{RegistrationError, Result};
pub use validation::ConvergenceChecker;
pub use progress::{ProgressCallback, ProgressTracker, ConsoleProgressCallback, HistoryCallback, ProgressInfo};
pub use linear::{InitPolicy, LinearConfig, LinearRegistration, LinearResult, TransformModel};
pub use metric::{Estimator, MetricKind};
pub use syn::{BundleHeader, SynConfig, SynRegistration, SynResult, WarpBundle};
pub use reorient::{DirectionSet, Reorienter};
pub use pipeline::{
    AffineOptions, ConfigWarning, FodOptions, InputDims, OutputRequest, PipelineConfig, PipelineResult,
    RegistrationPipeline, RegistrationType, RigidOptions, SynOptions,
};
