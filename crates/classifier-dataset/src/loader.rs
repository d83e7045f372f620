//! Image decoding and conversion to raw CHW pixel buffers.

use std::path::{Path, PathBuf};

use classifier_core::{DataConfig, DatasetError, ImageDimensions, LabeledSample};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};

use crate::augmentation::AugmentationPipeline;

/// A decoded sample as 8-bit channel values in CHW order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub class_id: usize,
    pub path: PathBuf,
}

/// Decodes images and brings them to the configured input dimensions.
#[derive(Debug, Clone, Copy)]
pub struct ImageLoader {
    dims: ImageDimensions,
    resize: bool,
}

impl ImageLoader {
    /// With `resize == false`, decoded images must already match `dims`.
    pub fn new(dims: ImageDimensions, resize: bool) -> Self {
        Self { dims, resize }
    }

    pub fn from_config(config: &DataConfig) -> Self {
        Self::new(config.image_size, config.resize)
    }

    pub fn dims(&self) -> ImageDimensions {
        self.dims
    }

    /// Decodes the file, sniffing the format from its content.
    pub fn decode(&self, path: &Path) -> Result<DynamicImage, DatasetError> {
        let reader = ImageReader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|source| DatasetError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        reader.decode().map_err(|e| DatasetError::CorruptImage {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Resizes to the configured width and height, or rejects a mismatch.
    pub fn conform(&self, image: DynamicImage, path: &Path) -> Result<DynamicImage, DatasetError> {
        let (width, height) = image.dimensions();
        if width == self.dims.width && height == self.dims.height {
            return Ok(image);
        }
        if !self.resize {
            return Err(DatasetError::DimensionMismatch {
                path: path.to_path_buf(),
                expected: self.dims,
                actual: ImageDimensions::new(width, height, image.color().channel_count() as u32),
            });
        }
        Ok(image.resize_exact(self.dims.width, self.dims.height, FilterType::Triangle))
    }

    /// Flattens to CHW with the configured channel count.
    pub fn to_chw(&self, image: &DynamicImage) -> Vec<u8> {
        let (width, height) = (self.dims.width as usize, self.dims.height as usize);
        let plane = width * height;

        if self.dims.channels == 1 {
            return image.to_luma8().into_raw();
        }

        let rgb = image.to_rgb8();
        let mut pixels = vec![0u8; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            pixels[offset] = pixel[0];
            pixels[plane + offset] = pixel[1];
            pixels[2 * plane + offset] = pixel[2];
        }
        pixels
    }

    /// Decode, optionally augment, conform and flatten one sample.
    pub fn load(
        &self,
        sample: &LabeledSample,
        augmentation: Option<&mut AugmentationPipeline>,
    ) -> Result<RawImage, DatasetError> {
        let mut image = self.decode(&sample.path)?;
        if let Some(pipeline) = augmentation {
            image = pipeline.apply(image);
        }
        let image = self.conform(image, &sample.path)?;

        Ok(RawImage {
            pixels: self.to_chw(&image),
            class_id: sample.class_id,
            path: sample.path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use tempfile::TempDir;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, _| {
            if x == 0 {
                Rgb([10u8, 20u8, 30u8])
            } else {
                Rgb([200u8, 100u8, 50u8])
            }
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_load_chw_layout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img.png");
        create_test_image(&path, 4, 2);

        let loader = ImageLoader::new(ImageDimensions::new(4, 2, 3), false);
        let sample = LabeledSample::new(path.clone(), "cat", 3);
        let raw = loader.load(&sample, None).unwrap();

        assert_eq!(raw.pixels.len(), 4 * 2 * 3);
        assert_eq!(raw.class_id, 3);
        // First pixel of each channel plane
        assert_eq!(raw.pixels[0], 10);
        assert_eq!(raw.pixels[8], 20);
        assert_eq!(raw.pixels[16], 30);
        assert_eq!(raw.pixels[1], 200);
    }

    #[test]
    fn test_resize_to_configured_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("big.png");
        create_test_image(&path, 64, 48);

        let loader = ImageLoader::new(ImageDimensions::new(30, 30, 3), true);
        let raw = loader
            .load(&LabeledSample::new(path, "dog", 0), None)
            .unwrap();
        assert_eq!(raw.pixels.len(), 30 * 30 * 3);
    }

    #[test]
    fn test_grayscale_output() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img.png");
        create_test_image(&path, 8, 8);

        let loader = ImageLoader::new(ImageDimensions::new(8, 8, 1), false);
        let raw = loader
            .load(&LabeledSample::new(path, "cat", 0), None)
            .unwrap();
        assert_eq!(raw.pixels.len(), 64);
    }

    #[test]
    fn test_dimension_mismatch_without_resize() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("img.png");
        create_test_image(&path, 10, 10);

        let loader = ImageLoader::new(ImageDimensions::new(30, 30, 3), false);
        let err = loader
            .load(&LabeledSample::new(path.clone(), "cat", 0), None)
            .unwrap_err();
        match err {
            DatasetError::DimensionMismatch {
                path: p,
                expected,
                actual,
            } => {
                assert_eq!(p, path);
                assert_eq!(expected, ImageDimensions::new(30, 30, 3));
                assert_eq!(actual, ImageDimensions::new(10, 10, 3));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_image() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.png");
        fs::write(&path, b"definitely not a png").unwrap();

        let loader = ImageLoader::new(ImageDimensions::default(), true);
        let err = loader.decode(&path).unwrap_err();
        assert!(matches!(err, DatasetError::CorruptImage { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_file() {
        let loader = ImageLoader::new(ImageDimensions::default(), true);
        let err = loader.decode(Path::new("/nonexistent/cat.png")).unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }
}
