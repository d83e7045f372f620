//! Backend selection.
//!
//! Training runs on the CPU through burn's ndarray backend; every component
//! is generic over [`Backend`] so another backend only needs a new alias.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;

/// Backend used for inference and evaluation
pub type CpuBackend = NdArray<f32>;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<CpuBackend>;

pub fn default_device() -> <CpuBackend as Backend>::Device {
    Default::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    "NdArray (CPU)"
}
