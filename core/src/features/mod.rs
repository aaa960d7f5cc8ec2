//! Frames, calibration and landmark extraction.
//!
//! A [`Frame`] is the raw pixel buffer delivered by the acquisition layer. It is validated, converted to a
//! normalised [`GrayImage`] and handed to a [`FeatureExtractor`], which yields a lazy, finite, one-pass
//! sequence of [`Observation`]s in physical units. An empty sequence is the normal result for a frame
//! that shows no landmark.
//!
//! Extraction is bounded by a [`Deadline`]. An extractor that runs past it yields a single
//! `Err(ExtractionTimeout)` and then ends.
pub mod centroid;
pub mod preprocess;
pub mod template;

pub use centroid::{CentroidExtractor, CentroidSettings};
pub use template::{TemplateExtractor, TemplateSettings};

use crate::{LocalizationError, Observation, Result};

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

/// Grayscale image with intensities in `[0, 1]`. Rows index the image height.
pub type GrayImage = DMatrix<f64>;

/// Raw frame as delivered by the camera or scan controller.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Row-major, interleaved 8-bit samples.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1 (gray), 3 (RGB) or 4 (RGBA).
    pub channels: u8,
    pub timestamp: f64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, channels: u8, timestamp: f64) -> Self {
        Frame {
            pixels,
            width,
            height,
            channels,
            timestamp,
        }
    }

    /// Single-channel frame from normalised intensities (values are clamped to `[0, 1]`).
    pub fn from_gray(image: &GrayImage, timestamp: f64) -> Self {
        let (height, width) = image.shape();
        let mut pixels = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                pixels.push((image[(row, col)].clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        Frame::new(pixels, width as u32, height as u32, 1, timestamp)
    }

    /// Decode an image file (PNG, PNM, JPEG, TIFF) into a single-channel frame.
    pub fn open<P: AsRef<Path>>(path: P, timestamp: f64) -> Result<Self> {
        let luma = image::open(path)?.to_luma8();
        let (width, height) = luma.dimensions();
        Ok(Frame::new(luma.into_raw(), width, height, 1, timestamp))
    }

    /// Check the frame geometry against its buffer.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LocalizationError::invalid_frame(format!(
                "zero-sized frame {}x{}",
                self.width, self.height
            )));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(LocalizationError::invalid_frame(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        if self.pixels.len() != expected {
            return Err(LocalizationError::invalid_frame(format!(
                "buffer length {} does not match {}x{}x{}",
                self.pixels.len(),
                self.width,
                self.height,
                self.channels
            )));
        }
        if !self.timestamp.is_finite() {
            return Err(LocalizationError::invalid_frame("non-finite timestamp"));
        }
        Ok(())
    }

    /// Validate and convert to a normalised grayscale image. Colour frames use Rec. 709 luma weights;
    /// alpha is ignored.
    pub fn to_gray(&self) -> Result<GrayImage> {
        self.validate()?;
        let width = self.width as usize;
        let channels = self.channels as usize;
        Ok(DMatrix::from_fn(self.height as usize, width, |row, col| {
            let i = (row * width + col) * channels;
            let value = match channels {
                1 => self.pixels[i] as f64,
                _ => {
                    0.2125 * self.pixels[i] as f64
                        + 0.7154 * self.pixels[i + 1] as f64
                        + 0.0721 * self.pixels[i + 2] as f64
                }
            };
            value / 255.0
        }))
    }
}

/// Pixel-to-physical mapping of the imaging system.
///
/// `x = (col - origin_col) / px_per_unit` and `y = -(row - origin_row) / px_per_unit`: image rows grow
/// downward while physical y grows upward.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub px_per_unit: f64,
    /// Pixel location `[col, row]` of the physical origin.
    pub origin_px: [f64; 2],
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            px_per_unit: 20.0,
            origin_px: [0.0, 0.0],
        }
    }
}

impl Calibration {
    pub fn validate(&self) -> Result<()> {
        if !(self.px_per_unit > 0.0 && self.px_per_unit.is_finite()) {
            return Err(LocalizationError::Config(
                "calibration px_per_unit must be positive".to_string(),
            ));
        }
        if self.origin_px.iter().any(|v| !v.is_finite()) {
            return Err(LocalizationError::Config(
                "calibration origin must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pixel_to_physical(&self, col: f64, row: f64) -> Vector3<f64> {
        Vector3::new(
            (col - self.origin_px[0]) / self.px_per_unit,
            -(row - self.origin_px[1]) / self.px_per_unit,
            0.0,
        )
    }

    /// Inverse of [`Calibration::pixel_to_physical`], returned as `(col, row)`.
    pub fn physical_to_pixel(&self, position: &Vector3<f64>) -> (f64, f64) {
        (
            position.x * self.px_per_unit + self.origin_px[0],
            -position.y * self.px_per_unit + self.origin_px[1],
        )
    }

    /// Convert a length in pixels to physical units.
    pub fn pixels_to_units(&self, pixels: f64) -> f64 {
        pixels / self.px_per_unit
    }
}

/// Wall-clock budget for one extraction.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Budget starting now.
    pub fn after(budget: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    /// No effective limit.
    pub fn unlimited() -> Self {
        Self::after(Duration::MAX)
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// The error an extractor yields when it runs out of time.
    pub fn timeout(&self) -> LocalizationError {
        LocalizationError::ExtractionTimeout {
            budget_ms: u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Lazy observation stream over one frame. Finite, one pass, not restartable.
pub type Observations<'a> = Box<dyn Iterator<Item = Result<Observation>> + 'a>;

/// Turns an image into landmark observations.
pub trait FeatureExtractor: Send {
    fn extract<'a>(
        &'a self,
        image: &'a GrayImage,
        timestamp: f64,
        deadline: Deadline,
    ) -> Observations<'a>;
}

/// Extractor choice and its settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    /// Bright-blob detection by thresholding and connected components.
    Centroid(CentroidSettings),
    /// Normalised cross-correlation against a reference marker.
    Template(TemplateSettings),
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig::Centroid(CentroidSettings::default())
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ExtractorConfig::Centroid(settings) => settings.validate(),
            ExtractorConfig::Template(settings) => settings.validate(),
        }
    }

    /// Construct the configured extractor.
    pub fn build(&self, calibration: Calibration) -> Result<Box<dyn FeatureExtractor>> {
        let extractor: Box<dyn FeatureExtractor> = match self {
            ExtractorConfig::Centroid(settings) => {
                Box::new(CentroidExtractor::new(settings.clone(), calibration))
            }
            ExtractorConfig::Template(settings) => {
                Box::new(TemplateExtractor::new(settings.clone(), calibration)?)
            }
        };
        Ok(extractor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_frame_validation() {
        assert!(Frame::new(vec![0; 12], 4, 3, 1, 0.0).validate().is_ok());
        assert!(Frame::new(vec![0; 36], 4, 3, 3, 0.0).validate().is_ok());

        let cases = [
            Frame::new(vec![], 0, 3, 1, 0.0),
            Frame::new(vec![0; 12], 4, 3, 2, 0.0),
            Frame::new(vec![0; 10], 4, 3, 1, 0.0),
            Frame::new(vec![0; 12], 4, 3, 1, f64::NAN),
        ];
        for frame in cases {
            assert!(matches!(
                frame.validate(),
                Err(LocalizationError::InvalidFrame { .. })
            ));
        }
    }

    #[test]
    fn test_to_gray() {
        let frame = Frame::new(vec![0, 255, 51, 102], 2, 2, 1, 0.0);
        let gray = frame.to_gray().unwrap();
        assert_eq!(gray.shape(), (2, 2));
        assert_approx_eq!(gray[(0, 1)], 1.0, 1e-12);
        assert_approx_eq!(gray[(1, 0)], 0.2, 1e-12);

        let rgb = Frame::new(vec![255, 255, 255, 0, 0, 0], 2, 1, 3, 0.0);
        let gray = rgb.to_gray().unwrap();
        assert_approx_eq!(gray[(0, 0)], 1.0, 1e-9);
        assert_approx_eq!(gray[(0, 1)], 0.0, 1e-12);
    }

    #[test]
    fn test_gray_round_trip_through_frame() {
        let image = DMatrix::from_fn(3, 5, |r, c| (r * 5 + c) as f64 / 14.0);
        let frame = Frame::from_gray(&image, 2.0);
        assert_eq!((frame.width, frame.height), (5, 3));
        let back = frame.to_gray().unwrap();
        assert!((back - image).abs().max() < 1.0 / 255.0);
    }

    #[test]
    fn test_calibration_flips_rows() {
        let calibration = Calibration {
            px_per_unit: 10.0,
            origin_px: [50.0, 40.0],
        };
        let p = calibration.pixel_to_physical(60.0, 20.0);
        assert_approx_eq!(p.x, 1.0, 1e-12);
        assert_approx_eq!(p.y, 2.0, 1e-12);
        let (col, row) = calibration.physical_to_pixel(&p);
        assert_approx_eq!(col, 60.0, 1e-12);
        assert_approx_eq!(row, 20.0, 1e-12);
    }

    #[test]
    fn test_zero_deadline_is_expired() {
        assert!(Deadline::from_millis(0).expired());
        assert!(!Deadline::unlimited().expired());
        assert!(matches!(
            Deadline::from_millis(7).timeout(),
            LocalizationError::ExtractionTimeout { budget_ms: 7 }
        ));
    }
}
