//! Core type definitions shared by the dataset and training crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// An image file together with the class it belongs to.
///
/// The label is the name of the sample's immediate parent directory;
/// `class_id` is its position in the sorted label set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabeledSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class name (parent directory name)
    pub label: String,
    /// Dense class index
    pub class_id: usize,
}

impl LabeledSample {
    /// Creates a new labeled sample
    pub fn new(path: PathBuf, label: impl Into<String>, class_id: usize) -> Self {
        Self {
            path,
            label: label.into(),
            class_id,
        }
    }
}

/// States of the two-phase trainer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrainingPhase {
    /// Nothing bound yet
    Idle,
    /// Fitting on unaugmented data
    WarmupTraining,
    /// Fitting with the augmentation pipeline bound
    AugmentedTraining,
    /// Terminal state, parameters are frozen
    Trained,
}

impl TrainingPhase {
    /// The only state reachable from `self`, if any.
    pub fn next(self) -> Option<TrainingPhase> {
        match self {
            TrainingPhase::Idle => Some(TrainingPhase::WarmupTraining),
            TrainingPhase::WarmupTraining => Some(TrainingPhase::AugmentedTraining),
            TrainingPhase::AugmentedTraining => Some(TrainingPhase::Trained),
            TrainingPhase::Trained => None,
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingPhase::Idle => write!(f, "idle"),
            TrainingPhase::WarmupTraining => write!(f, "warm-up training"),
            TrainingPhase::AugmentedTraining => write!(f, "augmented training"),
            TrainingPhase::Trained => write!(f, "trained"),
        }
    }
}

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of channels (3 for RGB, 1 for grayscale)
    pub channels: u32,
}

impl ImageDimensions {
    /// Creates new image dimensions
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of values in one CHW image
    pub fn total_values(&self) -> usize {
        (self.width * self.height * self.channels) as usize
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::new(30, 30, 3)
    }
}

impl fmt::Display for ImageDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_has_no_reentry() {
        let mut phase = TrainingPhase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            phase = next;
            visited.push(phase);
        }
        assert_eq!(phase, TrainingPhase::Trained);
        assert_eq!(visited.len(), 4);
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::default();
        assert_eq!(dims.total_values(), 30 * 30 * 3);
        assert_eq!(dims.to_string(), "30x30x3");
    }

    #[test]
    fn test_sample_ordering_is_by_path() {
        let a = LabeledSample::new(PathBuf::from("a/1.png"), "a", 0);
        let b = LabeledSample::new(PathBuf::from("b/1.png"), "b", 1);
        assert!(a < b);
    }
}
