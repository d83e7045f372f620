//! Test-set evaluation.
//!
//! The evaluator never touches the model's parameters: it runs batched
//! inference on the inference backend and accumulates a confusion matrix
//! (`matrix[actual][predicted]`) from which every metric is derived.

use burn::tensor::backend::Backend;
use classifier_core::{
    ConfigurationError, ConfusionMatrix, EvaluationReport, LabeledSample, NormalizationPolicy,
    Result,
};
use classifier_dataset::{fit_scaler, BatchSource, ImageLoader};
use tracing::{debug, info};

use crate::trainer::TrainedModel;

/// Evaluates a [`TrainedModel`] on labeled samples
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    loader: ImageLoader,
    batch_size: usize,
}

impl Evaluator {
    pub fn new(loader: ImageLoader, batch_size: usize) -> Self {
        Self {
            loader,
            batch_size: batch_size.max(1),
        }
    }

    /// Runs the model over `samples` and builds the report.
    ///
    /// With [`NormalizationPolicy::PerPhase`] the pixel scaler is refitted on
    /// `samples`; with [`NormalizationPolicy::FitOnce`] the training scaler
    /// is reused.
    pub fn evaluate<B: Backend>(
        &self,
        trained: &TrainedModel<B>,
        samples: &[LabeledSample],
    ) -> Result<EvaluationReport> {
        if self.loader.dims() != trained.input() {
            return Err(ConfigurationError::DimensionMismatch {
                context: "evaluation input".to_string(),
                expected: trained.input(),
                actual: self.loader.dims(),
            }
            .into());
        }

        let scaler = match trained.normalization() {
            NormalizationPolicy::PerPhase => fit_scaler(samples, &self.loader, None)?,
            NormalizationPolicy::FitOnce => trained.scaler(),
        };
        debug!("Evaluation scaler: [{}, {}]", scaler.min(), scaler.max());

        let mut matrix = ConfusionMatrix::new(trained.labels().len());
        let mut source = BatchSource::new(samples, self.batch_size, self.loader, scaler);

        while let Some(batch) = source.next_batch::<B>(trained.device()) {
            let batch = batch?;
            let predictions = trained.predict(batch.images);
            let targets = batch.targets.into_data();

            for (actual, predicted) in targets.iter::<i64>().zip(predictions) {
                matrix.record(actual as usize, predicted);
            }
        }

        let report = EvaluationReport::from_confusion(matrix, trained.labels());
        info!(
            "Evaluated {} samples: accuracy {:.2}%",
            report.num_samples,
            100.0 * report.accuracy
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{ArchitectureSpec, WeightInit};
    use crate::trainer::TrainingHistory;
    use burn_ndarray::NdArray;
    use classifier_core::{DatasetError, Error, ImageDimensions};
    use classifier_dataset::PixelScaler;
    use image::{ImageBuffer, Rgb};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    const DIMS: ImageDimensions = ImageDimensions {
        width: 4,
        height: 4,
        channels: 3,
    };

    /// Always predicts class 0: near-zero weights and a large class-0 bias
    fn majority_predictor() -> TrainedModel<TestBackend> {
        let device = Default::default();
        let spec = ArchitectureSpec::builder()
            .input(DIMS)
            .weight_init(WeightInit::normal(0.0, 1e-6))
            .output(2)
            .build()
            .unwrap();
        let model = spec
            .init::<TestBackend, _>(&device, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap()
            .with_output_bias(&[5.0, 0.0], &device);

        TrainedModel::new(
            model,
            spec,
            vec!["cat".to_string(), "dog".to_string()],
            NormalizationPolicy::PerPhase,
            PixelScaler::full_range(),
            TrainingHistory::default(),
            device,
        )
    }

    fn samples(root: &Path, cats: usize, dogs: usize) -> Vec<LabeledSample> {
        let mut samples = Vec::new();
        for (class_id, (label, count)) in [("cat", cats), ("dog", dogs)].into_iter().enumerate() {
            let dir = root.join(label);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                let path = dir.join(format!("{i}.png"));
                ImageBuffer::from_fn(4, 4, |x, y| Rgb([(x * 60) as u8, (y * 60) as u8, i as u8]))
                    .save(&path)
                    .unwrap();
                samples.push(LabeledSample::new(path, label, class_id));
            }
        }
        samples
    }

    #[test]
    fn test_majority_predictor_report() {
        let temp = TempDir::new().unwrap();
        let test = samples(temp.path(), 16, 4);
        let evaluator = Evaluator::new(ImageLoader::new(DIMS, false), 3);

        let report = evaluator.evaluate(&majority_predictor(), &test).unwrap();

        assert_eq!(report.num_samples, 20);
        assert!((report.accuracy - 0.8).abs() < 1e-9);
        let cat = report.class("cat").unwrap();
        let dog = report.class("dog").unwrap();
        assert_eq!(cat.recall, Some(1.0));
        assert_eq!(dog.recall, Some(0.0));
        assert_eq!(dog.precision, None);
        assert_eq!(cat.support + dog.support, test.len());
    }

    #[test]
    fn test_metrics_are_bounded() {
        let temp = TempDir::new().unwrap();
        let test = samples(temp.path(), 5, 7);
        let report = Evaluator::new(ImageLoader::new(DIMS, false), 4)
            .evaluate(&majority_predictor(), &test)
            .unwrap();

        let in_unit = |v: Option<f64>| v.map_or(true, |v| (0.0..=1.0).contains(&v));
        for class in &report.per_class {
            assert!(in_unit(class.precision));
            assert!(in_unit(class.recall));
            assert!(in_unit(class.f1));
        }
        let support: usize = report.per_class.iter().map(|c| c.support).sum();
        assert_eq!(support, test.len());
    }

    #[test]
    fn test_dimension_mismatch() {
        let evaluator = Evaluator::new(ImageLoader::new(ImageDimensions::new(8, 8, 3), true), 4);
        let result = evaluator.evaluate(&majority_predictor(), &[]);
        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigurationError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn test_corrupt_test_sample() {
        let temp = TempDir::new().unwrap();
        let mut test = samples(temp.path(), 2, 2);
        let broken = temp.path().join("dog").join("broken.png");
        fs::write(&broken, b"nope").unwrap();
        test.push(LabeledSample::new(broken, "dog", 1));

        let result = Evaluator::new(ImageLoader::new(DIMS, false), 2)
            .evaluate(&majority_predictor(), &test);
        assert!(matches!(
            result,
            Err(Error::Dataset(DatasetError::CorruptImage { .. }))
        ));
    }
}
