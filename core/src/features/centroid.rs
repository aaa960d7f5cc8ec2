//! Bright-blob landmark extraction.
//!
//! Pixels at or above `threshold` are grouped into 4-connected components. Each component whose area
//! lies within `[min_area, max_area]` becomes one observation at its intensity-weighted centroid. The
//! raster scan is resumed on every `next()`, so a consumer that stops early never pays for the rest of
//! the frame.
use super::preprocess::{mean_std, remove_row_noise};
use super::{Calibration, Deadline, FeatureExtractor, GrayImage, Observations};
use crate::{LocalizationError, Observation, Result};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidSettings {
    /// Absolute intensity threshold on the normalised image.
    pub threshold: f64,
    pub min_area: usize,
    pub max_area: usize,
    /// Localization uncertainty of a centroid, in pixels.
    pub pixel_stddev: f64,
    pub max_observations: usize,
    /// Level scanlines before thresholding.
    pub remove_row_noise: bool,
}

impl Default for CentroidSettings {
    fn default() -> Self {
        CentroidSettings {
            threshold: 0.5,
            min_area: 4,
            max_area: 10_000,
            pixel_stddev: 1.0,
            max_observations: 4,
            remove_row_noise: false,
        }
    }
}

impl CentroidSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(LocalizationError::Config(
                "centroid threshold must lie in [0, 1]".to_string(),
            ));
        }
        if self.min_area == 0 || self.min_area > self.max_area {
            return Err(LocalizationError::Config(
                "centroid area bounds must satisfy 0 < min_area <= max_area".to_string(),
            ));
        }
        if !(self.pixel_stddev >= 0.0 && self.pixel_stddev.is_finite()) {
            return Err(LocalizationError::Config(
                "centroid pixel_stddev must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct CentroidExtractor {
    settings: CentroidSettings,
    calibration: Calibration,
}

impl CentroidExtractor {
    pub fn new(settings: CentroidSettings, calibration: Calibration) -> Self {
        CentroidExtractor {
            settings,
            calibration,
        }
    }

    pub fn settings(&self) -> &CentroidSettings {
        &self.settings
    }
}

impl FeatureExtractor for CentroidExtractor {
    fn extract<'a>(
        &'a self,
        image: &'a GrayImage,
        timestamp: f64,
        deadline: Deadline,
    ) -> Observations<'a> {
        let image = if self.settings.remove_row_noise {
            Cow::Owned(remove_row_noise(image, None))
        } else {
            Cow::Borrowed(image)
        };
        let (background, _) = mean_std(image.iter().copied());
        let (rows, cols) = image.shape();
        Box::new(ComponentScan {
            extractor: self,
            visited: vec![false; rows * cols],
            image,
            background,
            cursor: 0,
            emitted: 0,
            stack: Vec::new(),
            timestamp,
            deadline,
            done: false,
        })
    }
}

/// Summary of one connected component.
struct Blob {
    area: usize,
    mass: f64,
    row_moment: f64,
    col_moment: f64,
    peak: f64,
}

struct ComponentScan<'a> {
    extractor: &'a CentroidExtractor,
    image: Cow<'a, GrayImage>,
    visited: Vec<bool>,
    background: f64,
    /// Next raster index (`row * cols + col`) to inspect.
    cursor: usize,
    emitted: usize,
    stack: Vec<(usize, usize)>,
    timestamp: f64,
    deadline: Deadline,
    done: bool,
}

impl ComponentScan<'_> {
    fn grow(&mut self, row: usize, col: usize) -> Blob {
        let (rows, cols) = self.image.shape();
        let threshold = self.extractor.settings.threshold;
        let mut blob = Blob {
            area: 0,
            mass: 0.0,
            row_moment: 0.0,
            col_moment: 0.0,
            peak: 0.0,
        };
        self.stack.clear();
        self.stack.push((row, col));
        self.visited[row * cols + col] = true;
        while let Some((r, c)) = self.stack.pop() {
            let v = self.image[(r, c)];
            blob.area += 1;
            blob.mass += v;
            blob.row_moment += v * r as f64;
            blob.col_moment += v * c as f64;
            blob.peak = blob.peak.max(v);

            let neighbors = [
                (r.wrapping_sub(1), c),
                (r + 1, c),
                (r, c.wrapping_sub(1)),
                (r, c + 1),
            ];
            for (nr, nc) in neighbors {
                if nr < rows && nc < cols {
                    let idx = nr * cols + nc;
                    if !self.visited[idx] && self.image[(nr, nc)] >= threshold {
                        self.visited[idx] = true;
                        self.stack.push((nr, nc));
                    }
                }
            }
        }
        blob
    }

    fn observation(&self, blob: &Blob) -> Observation {
        let settings = &self.extractor.settings;
        let calibration = &self.extractor.calibration;
        let row = blob.row_moment / blob.mass;
        let col = blob.col_moment / blob.mass;
        let contrast = (blob.peak - self.background) / (1.0 - self.background).max(1e-9);
        Observation::new(calibration.pixel_to_physical(col, row), self.timestamp)
            .with_stddev(calibration.pixels_to_units(settings.pixel_stddev))
            .with_confidence(contrast.clamp(1e-3, 1.0))
    }
}

impl Iterator for ComponentScan<'_> {
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let extractor = self.extractor;
        let settings = &extractor.settings;
        if self.emitted >= settings.max_observations {
            self.done = true;
            return None;
        }
        let (min_area, max_area, threshold) = (settings.min_area, settings.max_area, settings.threshold);
        let cols = self.image.ncols();
        let total = self.visited.len();
        while self.cursor < total {
            if self.cursor % cols == 0 && self.deadline.expired() {
                self.done = true;
                return Some(Err(self.deadline.timeout()));
            }
            let idx = self.cursor;
            self.cursor += 1;
            let (row, col) = (idx / cols, idx % cols);
            if self.visited[idx] || self.image[(row, col)] < threshold {
                continue;
            }
            let blob = self.grow(row, col);
            if blob.area < min_area || blob.area > max_area || !(blob.mass > 0.0) {
                continue;
            }
            self.emitted += 1;
            return Some(Ok(self.observation(&blob)));
        }
        self.done = true;
        None
    }
}
