//! Batch assembly: labeled samples to scaled tensors.
//!
//! [`BatchSource`] is the blocking "next batch" collaborator of the trainer
//! and evaluator. It decodes, augments and scales one batch at a time, in a
//! fixed order, and stops at the first sample that fails.

use std::path::PathBuf;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use classifier_core::{DatasetError, ImageDimensions, LabeledSample};

use crate::augmentation::AugmentationPipeline;
use crate::loader::{ImageLoader, RawImage};
use crate::normalization::{PixelScaler, ScalerFitter};

/// A single image ready for batching
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Scaled CHW values
    pub image: Vec<f32>,
    pub label: usize,
    pub path: PathBuf,
}

impl ImageItem {
    pub fn from_raw(raw: RawImage, scaler: &PixelScaler) -> Self {
        Self {
            image: scaler.transform(&raw.pixels),
            label: raw.class_id,
            path: raw.path,
        }
    }
}

/// A batch of images for training or inference
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Class ids with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks [`ImageItem`]s into an [`ImageBatch`]
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    dims: ImageDimensions,
}

impl ImageBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let channels = self.dims.channels as usize;
        let height = self.dims.height as usize;
        let width = self.dims.width as usize;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ImageBatch { images, targets }
    }
}

/// Fits a scaler on `samples` as they would be presented, augmentation included.
pub fn fit_scaler(
    samples: &[LabeledSample],
    loader: &ImageLoader,
    mut augmentation: Option<&mut AugmentationPipeline>,
) -> Result<PixelScaler, DatasetError> {
    let mut fitter = ScalerFitter::default();
    for sample in samples {
        let raw = loader.load(sample, augmentation.as_deref_mut())?;
        fitter.observe(&raw.pixels);
    }
    Ok(fitter.finish())
}

/// Sequential, blocking batch iterator over a fixed sample order.
pub struct BatchSource<'a> {
    samples: &'a [LabeledSample],
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    loader: ImageLoader,
    scaler: PixelScaler,
    batcher: ImageBatcher,
    augmentation: Option<&'a mut AugmentationPipeline>,
}

impl<'a> BatchSource<'a> {
    /// Iterates `samples` in their given order.
    pub fn new(
        samples: &'a [LabeledSample],
        batch_size: usize,
        loader: ImageLoader,
        scaler: PixelScaler,
    ) -> Self {
        Self {
            samples,
            order: (0..samples.len()).collect(),
            cursor: 0,
            batch_size: batch_size.max(1),
            loader,
            scaler,
            batcher: ImageBatcher::new(loader.dims()),
            augmentation: None,
        }
    }

    /// Visits samples in `order` (indices into `samples`).
    pub fn with_order(mut self, order: Vec<usize>) -> Self {
        self.order = order;
        self
    }

    pub fn with_augmentation(mut self, pipeline: &'a mut AugmentationPipeline) -> Self {
        self.augmentation = Some(pipeline);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Blocks until the next batch is assembled; `None` once exhausted.
    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> Option<Result<ImageBatch<B>, DatasetError>> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let mut items = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = &self.samples[index];
            match self.loader.load(sample, self.augmentation.as_deref_mut()) {
                Ok(raw) => items.push(ImageItem::from_raw(raw, &self.scaler)),
                Err(err) => return Some(Err(err)),
            }
        }

        let batch = <ImageBatcher as Batcher<B, ImageItem, ImageBatch<B>>>::batch(
            &self.batcher,
            items,
            device,
        );
        Some(Ok(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn create_test_image(path: &Path, value: u8) {
        let img = ImageBuffer::from_fn(6, 6, |_, _| Rgb([value, value / 2, 255 - value]));
        img.save(path).unwrap();
    }

    fn samples(root: &Path, count: usize) -> Vec<LabeledSample> {
        fs::create_dir_all(root).unwrap();
        (0..count)
            .map(|i| {
                let path = root.join(format!("{i}.png"));
                create_test_image(&path, (i * 40) as u8);
                LabeledSample::new(path, "x", i % 2)
            })
            .collect()
    }

    #[test]
    fn test_batch_shapes_and_remainder() {
        let temp = TempDir::new().unwrap();
        let samples = samples(temp.path(), 5);
        let loader = ImageLoader::new(ImageDimensions::new(6, 6, 3), false);
        let device = Default::default();

        let mut source = BatchSource::new(&samples, 2, loader, PixelScaler::full_range());
        assert_eq!(source.num_batches(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = source.next_batch::<TestBackend>(&device) {
            let batch = batch.unwrap();
            let [n, c, h, w] = batch.images.dims();
            assert_eq!((c, h, w), (3, 6, 6));
            assert_eq!(batch.targets.dims(), [n]);
            sizes.push(n);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_custom_order_controls_targets() {
        let temp = TempDir::new().unwrap();
        let samples = samples(temp.path(), 4);
        let loader = ImageLoader::new(ImageDimensions::new(6, 6, 3), false);
        let device = Default::default();

        let mut source = BatchSource::new(&samples, 4, loader, PixelScaler::full_range())
            .with_order(vec![1, 3, 0, 2]);
        let batch = source.next_batch::<TestBackend>(&device).unwrap().unwrap();
        let targets: Vec<i64> = batch.targets.into_data().iter::<i64>().collect();
        assert_eq!(targets, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_fit_scaler_over_samples() {
        let temp = TempDir::new().unwrap();
        let samples = samples(temp.path(), 3);
        let loader = ImageLoader::new(ImageDimensions::new(6, 6, 3), false);

        let scaler = fit_scaler(&samples, &loader, None).unwrap();
        // Values are 0, 40, 80 (R), 0, 20, 40 (G), 255, 215, 175 (B)
        assert_eq!(scaler.min(), 0);
        assert_eq!(scaler.max(), 255);
    }

    #[test]
    fn test_scaled_values_in_unit_interval() {
        let temp = TempDir::new().unwrap();
        let samples = samples(temp.path(), 3);
        let loader = ImageLoader::new(ImageDimensions::new(6, 6, 3), false);
        let scaler = fit_scaler(&samples, &loader, None).unwrap();
        let device = Default::default();

        let mut source = BatchSource::new(&samples, 3, loader, scaler);
        let batch = source.next_batch::<TestBackend>(&device).unwrap().unwrap();
        let values: Vec<f32> = batch.images.into_data().iter::<f32>().collect();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_corrupt_sample_stops_the_source() {
        let temp = TempDir::new().unwrap();
        let mut samples = samples(temp.path(), 2);
        let broken = temp.path().join("broken.png");
        fs::write(&broken, b"garbage").unwrap();
        samples.push(LabeledSample::new(broken.clone(), "x", 0));

        let loader = ImageLoader::new(ImageDimensions::new(6, 6, 3), false);
        let device = Default::default();
        let mut source = BatchSource::new(&samples, 3, loader, PixelScaler::full_range());

        let err = source.next_batch::<TestBackend>(&device).unwrap().unwrap_err();
        assert_eq!(err.path(), Some(broken.as_path()));
    }
}
