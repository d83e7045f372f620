//! Balanced train/test splitting.
//!
//! The ratio is applied to every class on its own, so a class with 40
//! images and a class with 4000 images both end up with the configured
//! train:test proportion. Within a class the selection is a uniform random
//! permutation drawn from a caller-owned, seeded generator.

use std::fmt;
use std::fs;
use std::path::Path;

use classifier_core::{
    ConfigurationError, DatasetError, LabeledSample, PersistenceError, Result, SplitConfig,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sample_index::SampleIndex;

/// Minimum class size that yields one train and one test sample.
pub const MIN_SAMPLES_PER_CLASS: usize = 2;

/// Splits a [`SampleIndex`] per class at a fixed train/test percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancedSplitter {
    train_percent: u32,
    test_percent: u32,
}

impl BalancedSplitter {
    /// Both percentages must be positive and sum to 100.
    pub fn new(train_percent: u32, test_percent: u32) -> std::result::Result<Self, ConfigurationError> {
        if train_percent == 0 || test_percent == 0 || train_percent + test_percent != 100 {
            return Err(ConfigurationError::InvalidSplitRatio {
                train: train_percent,
                test: test_percent,
            });
        }
        Ok(Self {
            train_percent,
            test_percent,
        })
    }

    pub fn from_config(config: &SplitConfig) -> std::result::Result<Self, ConfigurationError> {
        Self::new(config.train_percent, config.test_percent)
    }

    pub fn train_percent(&self) -> u32 {
        self.train_percent
    }

    pub fn test_percent(&self) -> u32 {
        self.test_percent
    }

    /// Number of train samples for a class of `n` samples.
    ///
    /// Rounds to the nearest count and keeps at least one sample on each side.
    pub fn train_count(&self, n: usize) -> usize {
        let ideal = (n as f64 * self.train_percent as f64 / 100.0).round() as usize;
        ideal.clamp(1, n.saturating_sub(1).max(1))
    }

    /// Partitions `index` into train and test subsets.
    pub fn split<R: Rng + ?Sized>(&self, index: &SampleIndex, rng: &mut R) -> Result<Split> {
        let groups = index.by_class();

        for (label, samples) in &groups {
            if samples.len() < MIN_SAMPLES_PER_CLASS {
                return Err(DatasetError::InsufficientSamples {
                    class: label.to_string(),
                    found: samples.len(),
                    required: MIN_SAMPLES_PER_CLASS,
                }
                .into());
            }
        }

        let mut train = Vec::new();
        let mut test = Vec::new();

        for (label, mut samples) in groups {
            samples.sort();
            samples.shuffle(rng);

            let n_train = self.train_count(samples.len());
            debug!(
                "Class '{}': {} train / {} test",
                label,
                n_train,
                samples.len() - n_train
            );

            let (class_train, class_test) = samples.split_at(n_train);
            train.extend(class_train.iter().map(|s| (*s).clone()));
            test.extend(class_test.iter().map(|s| (*s).clone()));
        }

        info!(
            "Balanced split {}/{}: {} train, {} test",
            self.train_percent,
            self.test_percent,
            train.len(),
            test.len()
        );

        Ok(Split {
            labels: index.labels().to_vec(),
            train,
            test,
        })
    }
}

/// Disjoint train and test subsets covering the whole index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// Class names, indexed by class id
    pub labels: Vec<String>,
    pub train: Vec<LabeledSample>,
    pub test: Vec<LabeledSample>,
}

impl Split {
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.test.is_empty()
    }

    pub fn stats(&self) -> SplitStats {
        let mut per_class: Vec<ClassSplit> = self
            .labels
            .iter()
            .map(|label| ClassSplit {
                label: label.clone(),
                train: 0,
                test: 0,
            })
            .collect();

        for sample in &self.train {
            if let Some(class) = per_class.get_mut(sample.class_id) {
                class.train += 1;
            }
        }
        for sample in &self.test {
            if let Some(class) = per_class.get_mut(sample.class_id) {
                class.test += 1;
            }
        }

        SplitStats {
            train_size: self.train.len(),
            test_size: self.test.len(),
            per_class,
        }
    }

    /// Save the split to a JSON file for reproducibility
    pub fn save(&self, path: &Path) -> std::result::Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a split from a JSON file
    pub fn load(path: &Path) -> std::result::Result<Self, PersistenceError> {
        let json = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSplit {
    pub label: String,
    pub train: usize,
    pub test: usize,
}

/// Statistics about a split
#[derive(Debug, Clone)]
pub struct SplitStats {
    pub train_size: usize,
    pub test_size: usize,
    pub per_class: Vec<ClassSplit>,
}

impl fmt::Display for SplitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = (self.train_size + self.test_size).max(1) as f64;
        writeln!(f, "Dataset Split Statistics:")?;
        writeln!(
            f,
            "  Train: {} ({:.1}%)",
            self.train_size,
            100.0 * self.train_size as f64 / total
        )?;
        writeln!(
            f,
            "  Test: {} ({:.1}%)",
            self.test_size,
            100.0 * self.test_size as f64 / total
        )?;
        for class in &self.per_class {
            writeln!(
                f,
                "    {:<24} train {:>6}  test {:>6}",
                class.label, class.train, class.test
            )?;
        }
        Ok(())
    }
}
