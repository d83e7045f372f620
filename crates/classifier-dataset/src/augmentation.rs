//! Stochastic image augmentation.
//!
//! An [`AugmentationPipeline`] is an ordered list of transforms, each paired
//! with the probability it is applied to a sample. Entries are independent:
//! a sample can receive none, some or all of them, and each selected
//! transform operates on the output of the previous one.
//!
//! Every transform owns a seeded generator for its own parameters, and the
//! pipeline owns a separate seeded generator for the per-entry draws, so a
//! pipeline built from the same configuration makes the same decisions.

use std::fmt;

use classifier_core::{AugmentationConfig, ConfigurationError, TransformConfig};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImage, GenericImageView};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A randomised image-to-image transform.
pub trait ImageTransform: Send + fmt::Debug {
    /// Short name used in logs and statistics
    fn name(&self) -> &'static str;

    fn apply(&mut self, image: DynamicImage) -> DynamicImage;
}

/// Flip mode, chosen uniformly on every application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipMode {
    None,
    Horizontal,
    Vertical,
    Both,
}

/// Random flip: none, horizontal, vertical or both axes, equally likely.
#[derive(Debug)]
pub struct FlipTransform {
    rng: ChaCha8Rng,
}

impl FlipTransform {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn flip(image: DynamicImage, mode: FlipMode) -> DynamicImage {
        match mode {
            FlipMode::None => image,
            FlipMode::Horizontal => image.fliph(),
            FlipMode::Vertical => image.flipv(),
            FlipMode::Both => image.fliph().flipv(),
        }
    }
}

impl ImageTransform for FlipTransform {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn apply(&mut self, image: DynamicImage) -> DynamicImage {
        let mode = match self.rng.gen_range(0..4) {
            0 => FlipMode::None,
            1 => FlipMode::Horizontal,
            2 => FlipMode::Vertical,
            _ => FlipMode::Both,
        };
        Self::flip(image, mode)
    }
}

/// Random perspective warp: each corner moves by up to `delta` pixels.
#[derive(Debug)]
pub struct WarpTransform {
    delta: f32,
    rng: ChaCha8Rng,
}

impl WarpTransform {
    pub fn new(seed: u64, delta: f32) -> Self {
        Self {
            delta: delta.abs(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Warps `image` so that its corners land on `targets`
    /// (top-left, top-right, bottom-right, bottom-left). Pixels mapped from
    /// outside the source are black.
    pub fn warp(image: &DynamicImage, targets: [(f64, f64); 4]) -> DynamicImage {
        let (width, height) = image.dimensions();
        let (w, h) = (width as f64, height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];

        // Inverse mapping: output pixel -> source pixel
        let Some(homography) = solve_homography(targets, corners) else {
            return image.clone();
        };

        let mut output = DynamicImage::new(width, height, image.color());
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = project(&homography, x as f64 + 0.5, y as f64 + 0.5);
                let (sx, sy) = (sx.floor(), sy.floor());
                if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
                    output.put_pixel(x, y, image.get_pixel(sx as u32, sy as u32));
                }
            }
        }
        output
    }
}

impl ImageTransform for WarpTransform {
    fn name(&self) -> &'static str {
        "warp"
    }

    fn apply(&mut self, image: DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let (w, h) = (width as f64, height as f64);
        let delta = self.delta as f64;

        let mut targets = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
        if delta > 0.0 {
            for corner in targets.iter_mut() {
                corner.0 += self.rng.gen_range(-delta..=delta);
                corner.1 += self.rng.gen_range(-delta..=delta);
            }
        }
        Self::warp(&image, targets)
    }
}

/// Solves for the 3x3 homography (h33 = 1) mapping each `from[i]` to `to[i]`.
fn solve_homography(from: [(f64, f64); 4], to: [(f64, f64); 4]) -> Option<[f64; 9]> {
    let mut a = [[0.0f64; 9]; 8];
    for i in 0..4 {
        let (x, y) = from[i];
        let (u, v) = to[i];
        a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
        a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
    }

    // Gaussian elimination with partial pivoting on the augmented 8x9 matrix
    for col in 0..8 {
        let pivot = (col..8).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        for row in 0..8 {
            if row != col {
                let factor = a[row][col] / a[col][col];
                for k in col..9 {
                    a[row][k] -= factor * a[col][k];
                }
            }
        }
    }

    let mut h = [0.0f64; 9];
    for i in 0..8 {
        h[i] = a[i][8] / a[i][i];
    }
    h[8] = 1.0;
    Some(h)
}

fn project(h: &[f64; 9], x: f64, y: f64) -> (f64, f64) {
    let z = h[6] * x + h[7] * y + h[8];
    if z.abs() < 1e-12 {
        return (f64::NAN, f64::NAN);
    }
    (
        (h[0] * x + h[1] * y + h[2]) / z,
        (h[3] * x + h[4] * y + h[5]) / z,
    )
}

/// Crops a random margin (up to `max_fraction` of each dimension per side)
/// and resizes back to the original size.
#[derive(Debug)]
pub struct CropTransform {
    max_fraction: f32,
    rng: ChaCha8Rng,
}

impl CropTransform {
    pub fn new(seed: u64, max_fraction: f32) -> Self {
        Self {
            max_fraction: max_fraction.clamp(0.0, 0.49),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl ImageTransform for CropTransform {
    fn name(&self) -> &'static str {
        "crop"
    }

    fn apply(&mut self, image: DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let max_x = (width as f32 * self.max_fraction) as u32;
        let max_y = (height as f32 * self.max_fraction) as u32;

        let left = self.rng.gen_range(0..=max_x);
        let right = self.rng.gen_range(0..=max_x);
        let top = self.rng.gen_range(0..=max_y);
        let bottom = self.rng.gen_range(0..=max_y);

        let crop_width = width.saturating_sub(left + right);
        let crop_height = height.saturating_sub(top + bottom);
        if crop_width == 0 || crop_height == 0 {
            return image;
        }

        image
            .crop_imm(left, top, crop_width, crop_height)
            .resize_exact(width, height, FilterType::Triangle)
    }
}

/// Adds a uniform brightness offset in `[-max_delta, max_delta]`.
#[derive(Debug)]
pub struct BrightnessTransform {
    max_delta: i32,
    rng: ChaCha8Rng,
}

impl BrightnessTransform {
    pub fn new(seed: u64, max_delta: i32) -> Self {
        Self {
            max_delta: max_delta.saturating_abs(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl ImageTransform for BrightnessTransform {
    fn name(&self) -> &'static str {
        "brightness"
    }

    fn apply(&mut self, image: DynamicImage) -> DynamicImage {
        let offset = self.rng.gen_range(-self.max_delta..=self.max_delta);
        image.brighten(offset)
    }
}

/// Builds the transform described by `config`.
pub fn build_transform(config: &TransformConfig) -> Box<dyn ImageTransform> {
    match *config {
        TransformConfig::Flip { seed } => Box::new(FlipTransform::new(seed)),
        TransformConfig::Warp { seed, delta } => Box::new(WarpTransform::new(seed, delta)),
        TransformConfig::Crop { seed, max_fraction } => {
            Box::new(CropTransform::new(seed, max_fraction))
        }
        TransformConfig::Brightness { seed, max_delta } => {
            Box::new(BrightnessTransform::new(seed, max_delta))
        }
    }
}

/// A transform and the probability it is applied.
#[derive(Debug)]
pub struct TransformEntry {
    pub transform: Box<dyn ImageTransform>,
    pub probability: f64,
}

impl TransformEntry {
    pub fn new(transform: Box<dyn ImageTransform>, probability: f64) -> Self {
        Self {
            transform,
            probability,
        }
    }
}

/// Ordered, independently-probabilistic sequence of transforms.
#[derive(Debug)]
pub struct AugmentationPipeline {
    entries: Vec<TransformEntry>,
    rng: ChaCha8Rng,
    applied: Vec<usize>,
    samples: usize,
}

impl AugmentationPipeline {
    /// `seed` drives the per-entry probability draws only.
    pub fn new(entries: Vec<TransformEntry>, seed: u64) -> Result<Self, ConfigurationError> {
        for (index, entry) in entries.iter().enumerate() {
            if !(0.0..=1.0).contains(&entry.probability) {
                return Err(ConfigurationError::InvalidProbability {
                    index,
                    probability: entry.probability,
                });
            }
        }
        let applied = vec![0; entries.len()];
        Ok(Self {
            entries,
            rng: ChaCha8Rng::seed_from_u64(seed),
            applied,
            samples: 0,
        })
    }

    /// The pipeline with no entries.
    pub fn identity() -> Self {
        Self {
            entries: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(0),
            applied: Vec::new(),
            samples: 0,
        }
    }

    pub fn from_config(config: &AugmentationConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let entries = config
            .entries
            .iter()
            .map(|entry| TransformEntry::new(build_transform(&entry.transform), entry.probability))
            .collect();
        Self::new(entries, config.seed)
    }

    pub fn is_identity(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies each entry in order with its own probability.
    pub fn apply(&mut self, image: DynamicImage) -> DynamicImage {
        self.samples += 1;
        let mut current = image;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let draw: f64 = self.rng.gen();
            if draw < entry.probability {
                current = entry.transform.apply(current);
                self.applied[i] += 1;
            }
        }
        current
    }

    /// How often each entry fired so far.
    pub fn stats(&self) -> ApplicationStats {
        ApplicationStats {
            samples: self.samples,
            per_entry: self
                .entries
                .iter()
                .zip(&self.applied)
                .map(|(entry, count)| EntryStats {
                    name: entry.transform.name(),
                    probability: entry.probability,
                    applied: *count,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryStats {
    pub name: &'static str,
    pub probability: f64,
    pub applied: usize,
}

impl EntryStats {
    pub fn observed_rate(&self, samples: usize) -> f64 {
        if samples == 0 {
            0.0
        } else {
            self.applied as f64 / samples as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationStats {
    pub samples: usize,
    pub per_entry: Vec<EntryStats>,
}

impl fmt::Display for ApplicationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} samples:", self.samples)?;
        for entry in &self.per_entry {
            write!(
                f,
                " {} {:.3} (p={:.2})",
                entry.name,
                entry.observed_rate(self.samples),
                entry.probability
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classifier_core::TransformEntryConfig;
    use image::{ImageBuffer, Rgb};

    fn create_test_image() -> DynamicImage {
        let img = ImageBuffer::from_fn(40, 40, |x, y| {
            if x < 20 && y < 20 {
                Rgb([255u8, 0u8, 0u8])
            } else if x >= 20 && y < 20 {
                Rgb([0u8, 255u8, 0u8])
            } else if x < 20 && y >= 20 {
                Rgb([0u8, 0u8, 255u8])
            } else {
                Rgb([255u8, 255u8, 0u8])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    /// Records calls and tags the image by painting pixel (0, 0).
    #[derive(Debug)]
    struct Marker {
        value: u8,
    }

    impl ImageTransform for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }

        fn apply(&mut self, image: DynamicImage) -> DynamicImage {
            let mut rgb = image.to_rgb8();
            let current = rgb.get_pixel(0, 0)[0];
            rgb.put_pixel(0, 0, Rgb([current.wrapping_mul(10).wrapping_add(self.value), 0, 0]));
            DynamicImage::ImageRgb8(rgb)
        }
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let image = create_test_image();
        let mut pipeline = AugmentationPipeline::identity();
        for _ in 0..10 {
            assert_eq!(pipeline.apply(image.clone()), image);
        }

        let mut configured = AugmentationPipeline::from_config(&AugmentationConfig {
            seed: 9,
            entries: Vec::new(),
        })
        .unwrap();
        assert!(configured.is_identity());
        assert_eq!(configured.apply(image.clone()), image);
    }

    #[test]
    fn test_transforms_chain_in_order() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 2, Rgb([0u8, 0, 0])));
        let entries = vec![
            TransformEntry::new(Box::new(Marker { value: 1 }), 1.0),
            TransformEntry::new(Box::new(Marker { value: 2 }), 1.0),
        ];
        let mut pipeline = AugmentationPipeline::new(entries, 0).unwrap();
        let out = pipeline.apply(image).to_rgb8();
        // (0 * 10 + 1) * 10 + 2
        assert_eq!(out.get_pixel(0, 0)[0], 12);
    }

    #[test]
    fn test_probability_zero_never_applies() {
        let image = create_test_image();
        let entries = vec![TransformEntry::new(Box::new(FlipTransform::new(1)), 0.0)];
        let mut pipeline = AugmentationPipeline::new(entries, 5).unwrap();
        for _ in 0..50 {
            assert_eq!(pipeline.apply(image.clone()), image);
        }
        assert_eq!(pipeline.stats().per_entry[0].applied, 0);
    }

    #[test]
    fn test_application_rate_converges() {
        let config = AugmentationConfig::default();
        let mut pipeline = AugmentationPipeline::from_config(&config).unwrap();
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([10u8, 20, 30])));

        let trials = 4000;
        for _ in 0..trials {
            pipeline.apply(image.clone());
        }

        let stats = pipeline.stats();
        assert_eq!(stats.samples, trials);
        for entry in &stats.per_entry {
            // Binomial std at n=4000 is below 0.008
            let rate = entry.observed_rate(stats.samples);
            assert!(
                (rate - entry.probability).abs() < 0.04,
                "{} rate {rate} vs p {}",
                entry.name,
                entry.probability
            );
        }
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let config = AugmentationConfig {
            seed: 11,
            entries: vec![
                TransformEntryConfig {
                    transform: TransformConfig::Flip { seed: 3 },
                    probability: 0.5,
                },
                TransformEntryConfig {
                    transform: TransformConfig::Brightness {
                        seed: 4,
                        max_delta: 40,
                    },
                    probability: 0.5,
                },
            ],
        };
        let image = create_test_image();
        let mut a = AugmentationPipeline::from_config(&config).unwrap();
        let mut b = AugmentationPipeline::from_config(&config).unwrap();

        let mut varied = false;
        let mut previous: Option<DynamicImage> = None;
        for _ in 0..20 {
            let out_a = a.apply(image.clone());
            let out_b = b.apply(image.clone());
            assert_eq!(out_a, out_b);
            if let Some(prev) = &previous {
                varied |= *prev != out_a;
            }
            previous = Some(out_a);
        }
        assert!(varied);
    }

    #[test]
    fn test_invalid_probability() {
        let entries = vec![TransformEntry::new(Box::new(FlipTransform::new(1)), -0.1)];
        assert!(AugmentationPipeline::new(entries, 0).is_err());
    }

    #[test]
    fn test_flip_modes() {
        let image = create_test_image();
        let h = FlipTransform::flip(image.clone(), FlipMode::Horizontal).to_rgb8();
        assert_eq!(h.get_pixel(0, 0), &Rgb([0, 255, 0]));

        let v = FlipTransform::flip(image.clone(), FlipMode::Vertical).to_rgb8();
        assert_eq!(v.get_pixel(0, 0), &Rgb([0, 0, 255]));

        let both = FlipTransform::flip(image.clone(), FlipMode::Both).to_rgb8();
        assert_eq!(both.get_pixel(0, 0), &Rgb([255, 255, 0]));

        let none = FlipTransform::flip(image, FlipMode::None).to_rgb8();
        assert_eq!(none.get_pixel(0, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_random_flip_includes_no_flip() {
        let image = create_test_image();
        let mut flip = FlipTransform::new(9);
        let mut corners = std::collections::BTreeSet::new();
        for _ in 0..200 {
            let out = flip.apply(image.clone()).to_rgb8();
            corners.insert(out.get_pixel(0, 0).0);
        }
        // Red is the unflipped corner
        assert_eq!(corners.len(), 4);
        assert!(corners.contains(&[255, 0, 0]));
    }

    #[test]
    fn test_warp_with_unmoved_corners_is_identity() {
        let image = create_test_image();
        let targets = [(0.0, 0.0), (40.0, 0.0), (40.0, 40.0), (0.0, 40.0)];
        assert_eq!(WarpTransform::warp(&image, targets), image);
    }

    #[test]
    fn test_warp_keeps_dimensions() {
        let image = create_test_image();
        let mut warp = WarpTransform::new(42, 8.0);
        let out = warp.apply(image.clone());
        assert_eq!(out.dimensions(), image.dimensions());
        assert_eq!(out.color(), image.color());
    }

    #[test]
    fn test_crop_keeps_dimensions() {
        let image = create_test_image();
        let mut crop = CropTransform::new(1, 0.2);
        assert_eq!(crop.apply(image.clone()).dimensions(), image.dimensions());
    }

    #[test]
    fn test_homography_translation() {
        let from = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let to = [(2.0, 3.0), (3.0, 3.0), (3.0, 4.0), (2.0, 4.0)];
        let h = solve_homography(from, to).unwrap();
        let (x, y) = project(&h, 0.5, 0.5);
        assert!((x - 2.5).abs() < 1e-9);
        assert!((y - 3.5).abs() < 1e-9);
    }
}
