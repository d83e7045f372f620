//! Min-max intensity scaling into `[0, 1]`.
//!
//! A scaler is fitted on the data a phase is about to consume; the fitted
//! statistics belong to that phase only.

use serde::{Deserialize, Serialize};

/// Fitted min/max pixel intensities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelScaler {
    min: u8,
    max: u8,
}

impl PixelScaler {
    /// The scaler that maps the full 8-bit range onto `[0, 1]`.
    pub fn full_range() -> Self {
        Self { min: 0, max: 255 }
    }

    /// Fits on every value of every image.
    pub fn fit<'a, I>(images: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut fitter = ScalerFitter::default();
        for pixels in images {
            fitter.observe(pixels);
        }
        fitter.finish()
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    /// Scales a single value. Values outside the fitted range are clamped.
    pub fn scale(&self, value: u8) -> f32 {
        if self.max <= self.min {
            return 0.0;
        }
        let range = (self.max - self.min) as f32;
        ((value as f32 - self.min as f32) / range).clamp(0.0, 1.0)
    }

    pub fn transform(&self, pixels: &[u8]) -> Vec<f32> {
        pixels.iter().map(|&v| self.scale(v)).collect()
    }
}

/// Incremental fit, for callers that stream images one at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalerFitter {
    bounds: Option<(u8, u8)>,
}

impl ScalerFitter {
    pub fn observe(&mut self, pixels: &[u8]) {
        for &value in pixels {
            self.bounds = Some(match self.bounds {
                Some((lo, hi)) => (lo.min(value), hi.max(value)),
                None => (value, value),
            });
        }
    }

    /// Falls back to the full 8-bit range when nothing was observed.
    pub fn finish(self) -> PixelScaler {
        match self.bounds {
            Some((min, max)) => PixelScaler { min, max },
            None => PixelScaler::full_range(),
        }
    }
}
