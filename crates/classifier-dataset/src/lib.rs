//! Dataset side of the image classifier pipeline.
//!
//! This crate turns a class-per-directory image tree into a
//! [`SampleIndex`], splits it per class with a [`BalancedSplitter`], applies
//! seeded stochastic augmentation, and assembles scaled tensor batches for
//! the training crate.

pub mod augmentation;
pub mod batcher;
pub mod loader;
pub mod normalization;
pub mod sample_index;
pub mod split;

pub use augmentation::{
    ApplicationStats, AugmentationPipeline, BrightnessTransform, CropTransform, FlipTransform,
    ImageTransform, TransformEntry, WarpTransform,
};
pub use batcher::{fit_scaler, BatchSource, ImageBatch, ImageBatcher, ImageItem};
pub use loader::{ImageLoader, RawImage};
pub use normalization::{PixelScaler, ScalerFitter};
pub use sample_index::{IndexStats, SampleIndex};
pub use split::{BalancedSplitter, Split, SplitStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::augmentation::*;
    pub use crate::batcher::*;
    pub use crate::loader::*;
    pub use crate::normalization::*;
    pub use crate::sample_index::*;
    pub use crate::split::*;
}
