//! Training side of the image classifier pipeline.
//!
//! This crate provides:
//! - A declarative [`ArchitectureSpec`] and the [`ConvClassifier`] built from it
//! - Step-decay learning-rate schedules
//! - The two-phase [`Trainer`] state machine and its [`TrainingObserver`] hooks
//! - Test-set evaluation
//! - Model archives via [`ModelStore`]
//! - The end-to-end [`pipeline`]

pub mod architecture;
pub mod backend;
pub mod evaluator;
pub mod model;
pub mod model_store;
pub mod observer;
pub mod pipeline;
pub mod schedule;
pub mod trainer;

pub use architecture::{
    Activation, ArchitectureSpec, ArchitectureSpecBuilder, LayerShape, LayerSpec, LrnParams,
    WeightInit,
};
pub use backend::{backend_name, default_device, CpuBackend, TrainingBackend};
pub use evaluator::Evaluator;
pub use model::ConvClassifier;
pub use model_store::{ArchiveHeader, ModelStore, FORMAT_VERSION};
pub use observer::{
    NoopObserver, RecordingObserver, TracingObserver, TrainingEvent, TrainingObserver,
};
pub use pipeline::{PipelineOutcome, PreparedData};
pub use schedule::StepSchedule;
pub use trainer::{TrainedModel, Trainer, TrainingHistory};

/// Re-export commonly used types
pub mod prelude {
    pub use super::architecture::{ArchitectureSpec, LayerSpec};
    pub use super::evaluator::Evaluator;
    pub use super::model_store::ModelStore;
    pub use super::observer::{TracingObserver, TrainingObserver};
    pub use super::pipeline::{prepare_data, run};
    pub use super::trainer::{TrainedModel, Trainer};
}
