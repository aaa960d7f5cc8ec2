//! Marker localization by template scoring.
//!
//! Every candidate window is scored as a weighted sum of three terms:
//!
//! - zero-normalised cross-correlation (ZNCC) of the conditioned frame (scanline levelling, then a
//!   box-blur high-pass) against the equally conditioned marker;
//! - cosine between magnitude-weighted histograms of unsigned gradient orientation (a one-cell HOG);
//! - ZNCC of the gradient magnitude.
//!
//! Windows with too little structure (too few pixels above a gradient-magnitude quantile of the frame)
//! are not scored at all. The score map is computed on the first call to `next()`, checking the deadline
//! once per row. Peaks are thinned by non-maximum suppression, refined by a dense high-pass ZNCC search
//! around each one and yielded best first.
//!
//! Confidence comes from how peaked the softmax of the score map is: half from its normalised entropy,
//! half from the weight margin between a peak and its strongest rival outside the suppression radius.
use super::preprocess::{
    highpass, integral, mean_std, orientation_bins, orientation_histogram, quantile,
    remove_row_noise, window_sum,
};
use super::{Calibration, Deadline, FeatureExtractor, GrayImage, Observations};
use crate::{LocalizationError, Observation, Result};

use nalgebra::{DMatrix, DMatrixView};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Windows with less contrast than this are not scored.
const MIN_WINDOW_STD: f64 = 1e-3;

/// Smallest confidence handed to the filter.
const MIN_CONFIDENCE: f64 = 1e-3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Reference marker image. When absent a Gaussian spot of `spot_sigma_px` is used.
    pub template_path: Option<PathBuf>,
    pub spot_sigma_px: f64,
    /// Half-width of the box blur subtracted for the high-pass. Zero disables it.
    pub highpass_radius: usize,
    /// Scanline levelling of the frame before matching.
    pub remove_row_noise: bool,
    /// Moving-average window used to detrend each scanline. `None` skips detrending.
    pub detrend_window: Option<usize>,
    /// Sampling step of the score map in pixels.
    pub stride: usize,
    /// Weight of the high-pass ZNCC term.
    pub zncc_weight: f64,
    /// Weight of the orientation-histogram cosine.
    pub hog_weight: f64,
    /// Weight of the gradient-magnitude ZNCC.
    pub magnitude_weight: f64,
    pub hog_bins: usize,
    /// Gradient-magnitude quantile of the frame above which a pixel counts as structure. `None`
    /// disables the structure gate.
    pub structure_quantile: Option<f64>,
    /// Windows with a smaller share of structure pixels are skipped.
    pub min_structure_fraction: f64,
    /// Half-width of the dense search around each peak. Zero disables refinement.
    pub refine_radius_px: usize,
    /// Gain of the softmax over the score map used for confidence.
    pub softmax_gain: f64,
    /// Peaks closer than this to a stronger peak are suppressed.
    pub nms_radius_px: f64,
    /// Minimum combined score for a peak to become an observation.
    pub min_score: f64,
    pub max_observations: usize,
    /// Localization uncertainty of a match, in pixels.
    pub pixel_stddev: f64,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        TemplateSettings {
            template_path: None,
            spot_sigma_px: 3.0,
            highpass_radius: 2,
            remove_row_noise: true,
            detrend_window: Some(51),
            stride: 1,
            zncc_weight: 0.55,
            hog_weight: 0.35,
            magnitude_weight: 0.10,
            hog_bins: 16,
            structure_quantile: Some(0.55),
            min_structure_fraction: 0.25,
            refine_radius_px: 8,
            softmax_gain: 20.0,
            nms_radius_px: 6.0,
            min_score: 0.5,
            max_observations: 1,
            pixel_stddev: 1.0,
        }
    }
}

fn config_error(message: &str) -> LocalizationError {
    LocalizationError::Config(format!("template {message}"))
}

impl TemplateSettings {
    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(config_error("stride must be positive"));
        }
        if self.template_path.is_none() && !(self.spot_sigma_px > 0.0 && self.spot_sigma_px.is_finite()) {
            return Err(config_error("spot_sigma_px must be positive"));
        }
        let weights = [self.zncc_weight, self.hog_weight, self.magnitude_weight];
        if weights.iter().any(|w| !(*w >= 0.0 && w.is_finite())) || !(weights.iter().sum::<f64>() > 0.0) {
            return Err(config_error("score weights must be non-negative and not all zero"));
        }
        if self.hog_bins == 0 {
            return Err(config_error("hog_bins must be positive"));
        }
        if let Some(q) = self.structure_quantile
            && !(0.0..=1.0).contains(&q)
        {
            return Err(config_error("structure_quantile must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.min_structure_fraction) {
            return Err(config_error("min_structure_fraction must lie in [0, 1]"));
        }
        if !(self.softmax_gain > 0.0 && self.softmax_gain.is_finite()) {
            return Err(config_error("softmax_gain must be positive"));
        }
        if !(-1.0..=1.0).contains(&self.min_score) {
            return Err(config_error("min_score must lie in [-1, 1]"));
        }
        if !(self.pixel_stddev >= 0.0 && self.pixel_stddev.is_finite()) {
            return Err(config_error("pixel_stddev must be non-negative"));
        }
        Ok(())
    }
}

/// Square Gaussian spot spanning ±3σ.
pub fn gaussian_spot(sigma_px: f64) -> GrayImage {
    let half = (3.0 * sigma_px).ceil() as usize;
    let size = 2 * half + 1;
    let center = half as f64;
    DMatrix::from_fn(size, size, |r, c| {
        let d2 = (r as f64 - center).powi(2) + (c as f64 - center).powi(2);
        (-d2 / (2.0 * sigma_px * sigma_px)).exp()
    })
}

/// Shift to zero mean and scale to unit standard deviation. `None` when there is no contrast.
fn z_normalized(image: &GrayImage) -> Option<GrayImage> {
    let (mean, std) = mean_std(image.iter().copied());
    if !(std > 1e-9) {
        return None;
    }
    Some(image.map(|v| (v - mean) / std))
}

/// ZNCC of `window` against an already z-normalised reference. `None` for a window without contrast.
fn zncc(window: DMatrixView<'_, f64>, normalized: &GrayImage) -> Option<f64> {
    let (mean, std) = mean_std(window.iter().copied());
    if !(std > MIN_WINDOW_STD) {
        return None;
    }
    let n = window.len() as f64;
    Some(
        window
            .iter()
            .zip(normalized.iter())
            .map(|(p, t)| (p - mean) / std * t)
            .sum::<f64>()
            / n,
    )
}

/// Per-frame planes shared by every window.
struct FramePlanes {
    highpass: GrayImage,
    magnitude: GrayImage,
    orientation: DMatrix<usize>,
    /// Summed-area table of the structure mask. `None` when gating is off.
    structure: Option<GrayImage>,
}

/// Candidate window: score and centre in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Peak {
    score: f64,
    row: f64,
    col: f64,
}

/// A peak ready to be reported.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Match {
    row: f64,
    col: f64,
    confidence: f64,
}

#[derive(Clone, Debug)]
pub struct TemplateExtractor {
    settings: TemplateSettings,
    calibration: Calibration,
    /// High-passed template scaled to zero mean and unit standard deviation.
    template: GrayImage,
    /// Gradient magnitude of the raw template, z-normalised. `None` for a template without gradient.
    template_magnitude: Option<GrayImage>,
    template_histogram: Vec<f64>,
}

impl TemplateExtractor {
    /// Load (or synthesise) the reference marker and prepare it for matching.
    pub fn new(settings: TemplateSettings, calibration: Calibration) -> Result<Self> {
        settings.validate()?;
        let raw = match &settings.template_path {
            Some(path) => super::Frame::open(path, 0.0)?.to_gray()?,
            None => gaussian_spot(settings.spot_sigma_px),
        };
        Self::with_template(settings, calibration, &raw)
    }

    /// Use an in-memory reference marker.
    pub fn with_template(
        settings: TemplateSettings,
        calibration: Calibration,
        raw: &GrayImage,
    ) -> Result<Self> {
        if raw.nrows() < 3 || raw.ncols() < 3 {
            return Err(LocalizationError::Config(format!(
                "template must be at least 3x3 pixels, got {}x{}",
                raw.ncols(),
                raw.nrows()
            )));
        }
        let template = z_normalized(&highpass(raw, settings.highpass_radius))
            .ok_or_else(|| config_error("has no contrast"))?;
        let (orientation, magnitude) = orientation_bins(raw, settings.hog_bins);
        let template_histogram = orientation_histogram(
            orientation.view((0, 0), orientation.shape()),
            magnitude.view((0, 0), magnitude.shape()),
            settings.hog_bins,
        );
        Ok(TemplateExtractor {
            template_magnitude: z_normalized(&magnitude),
            template_histogram,
            settings,
            calibration,
            template,
        })
    }

    pub fn settings(&self) -> &TemplateSettings {
        &self.settings
    }

    fn planes(&self, image: &GrayImage) -> FramePlanes {
        let leveled = if self.settings.remove_row_noise {
            remove_row_noise(image, self.settings.detrend_window)
        } else {
            image.clone()
        };
        let (orientation, magnitude) = orientation_bins(image, self.settings.hog_bins);
        let structure = self.settings.structure_quantile.map(|q| {
            let threshold = quantile(magnitude.iter().copied(), q);
            integral(&magnitude.map(|m| if m >= threshold { 1.0 } else { 0.0 }))
        });
        FramePlanes {
            highpass: highpass(&leveled, self.settings.highpass_radius),
            magnitude,
            orientation,
            structure,
        }
    }

    /// Combined score of the window with top-left corner `(row, col)`. `None` when the window is gated
    /// out or has no contrast.
    fn score_at(&self, planes: &FramePlanes, row: usize, col: usize) -> Option<f64> {
        let shape = self.template.shape();
        let (th, tw) = shape;
        if let Some(structure) = &planes.structure {
            let fraction = window_sum(structure, row, col, row + th, col + tw) / (th * tw) as f64;
            if fraction < self.settings.min_structure_fraction {
                return None;
            }
        }
        let settings = &self.settings;
        let mut score = settings.zncc_weight * zncc(planes.highpass.view((row, col), shape), &self.template)?;
        if settings.hog_weight > 0.0 {
            let histogram = orientation_histogram(
                planes.orientation.view((row, col), shape),
                planes.magnitude.view((row, col), shape),
                settings.hog_bins,
            );
            let cosine: f64 = histogram
                .iter()
                .zip(&self.template_histogram)
                .map(|(a, b)| a * b)
                .sum();
            score += settings.hog_weight * cosine;
        }
        if settings.magnitude_weight > 0.0
            && let Some(reference) = &self.template_magnitude
        {
            let s_mag = zncc(planes.magnitude.view((row, col), shape), reference).unwrap_or(0.0);
            score += settings.magnitude_weight * s_mag;
        }
        Some(score)
    }

    /// Every scored window, best first. Row/col are window centres.
    fn score_map(&self, planes: &FramePlanes, deadline: &Deadline) -> Result<Vec<Peak>> {
        let (th, tw) = self.template.shape();
        let (rows, cols) = planes.highpass.shape();
        if rows < th || cols < tw {
            return Ok(Vec::new());
        }
        let (cy, cx) = ((th - 1) as f64 / 2.0, (tw - 1) as f64 / 2.0);
        let stride = self.settings.stride;
        let mut scored = Vec::new();
        for row in (0..=rows - th).step_by(stride) {
            if deadline.expired() {
                return Err(deadline.timeout());
            }
            for col in (0..=cols - tw).step_by(stride) {
                if let Some(score) = self.score_at(planes, row, col) {
                    scored.push(Peak {
                        score,
                        row: row as f64 + cy,
                        col: col as f64 + cx,
                    });
                }
            }
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }

    fn separated(&self, a: &Peak, b: &Peak) -> bool {
        let radius_sq = self.settings.nms_radius_px * self.settings.nms_radius_px;
        (a.row - b.row).powi(2) + (a.col - b.col).powi(2) > radius_sq
    }

    /// Non-maximum suppression over the windows above threshold.
    fn suppress(&self, scored: &[Peak]) -> Vec<Peak> {
        let mut kept: Vec<Peak> = Vec::new();
        for peak in scored.iter().take_while(|p| p.score >= self.settings.min_score) {
            if kept.len() >= self.settings.max_observations {
                break;
            }
            if kept.iter().all(|k| self.separated(k, peak)) {
                kept.push(*peak);
            }
        }
        kept
    }

    /// Softmax weight of each scored window, in the same order.
    fn softmax(&self, scored: &[Peak]) -> Vec<f64> {
        let Some(best) = scored.first() else {
            return Vec::new();
        };
        let gain = self.settings.softmax_gain;
        let mut weights: Vec<f64> = scored.iter().map(|p| (gain * (p.score - best.score)).exp()).collect();
        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }
        weights
    }

    /// Entropy term shared by every peak plus the margin of `peak` over its strongest rival.
    fn confidence(&self, peak: &Peak, scored: &[Peak], weights: &[f64]) -> f64 {
        let n = weights.len();
        let spread = if n > 1 {
            let entropy: f64 = weights.iter().filter(|w| **w > 0.0).map(|w| -w * w.ln()).sum();
            1.0 - entropy / (n as f64).ln()
        } else {
            1.0
        };
        // The best window's unnormalised weight is 1.
        let own = weights[0] * (self.settings.softmax_gain * (peak.score - scored[0].score)).exp();
        let rival = scored
            .iter()
            .zip(weights)
            .find(|(p, _)| self.separated(peak, p))
            .map_or(0.0, |(_, w)| *w);
        let margin = ((own - rival) * 5.0).clamp(0.0, 1.0);
        (0.5 * spread + 0.5 * margin).clamp(MIN_CONFIDENCE, 1.0)
    }

    /// Best high-pass ZNCC position within `refine_radius_px` of `peak`.
    fn refine(&self, planes: &FramePlanes, peak: Peak) -> Peak {
        let radius = self.settings.refine_radius_px;
        if radius == 0 {
            return peak;
        }
        let (th, tw) = self.template.shape();
        let (rows, cols) = planes.highpass.shape();
        let (cy, cx) = ((th - 1) as f64 / 2.0, (tw - 1) as f64 / 2.0);
        let top = (peak.row - cy).round() as usize;
        let left = (peak.col - cx).round() as usize;
        let mut best: Option<(f64, usize, usize)> = None;
        for row in top.saturating_sub(radius)..=(top + radius).min(rows - th) {
            for col in left.saturating_sub(radius)..=(left + radius).min(cols - tw) {
                let Some(score) = zncc(planes.highpass.view((row, col), (th, tw)), &self.template) else {
                    continue;
                };
                if best.is_none_or(|(s, _, _)| score > s) {
                    best = Some((score, row, col));
                }
            }
        }
        match best {
            Some((_, row, col)) => Peak {
                row: row as f64 + cy,
                col: col as f64 + cx,
                ..peak
            },
            None => peak,
        }
    }

    fn locate(&self, image: &GrayImage, deadline: &Deadline) -> Result<Vec<Match>> {
        let planes = self.planes(image);
        let scored = self.score_map(&planes, deadline)?;
        let weights = self.softmax(&scored);
        let mut matches = Vec::new();
        for peak in self.suppress(&scored) {
            if deadline.expired() {
                return Err(deadline.timeout());
            }
            let confidence = self.confidence(&peak, &scored, &weights);
            let refined = self.refine(&planes, peak);
            matches.push(Match {
                row: refined.row,
                col: refined.col,
                confidence,
            });
        }
        Ok(matches)
    }

    fn observation(&self, found: Match, timestamp: f64) -> Observation {
        Observation::new(self.calibration.pixel_to_physical(found.col, found.row), timestamp)
            .with_stddev(self.calibration.pixels_to_units(self.settings.pixel_stddev))
            .with_confidence(found.confidence)
    }
}

enum MatchState<'a> {
    Pending {
        image: &'a GrayImage,
        deadline: Deadline,
    },
    Ready(VecDeque<Match>),
    Done,
}

struct MatchScan<'a> {
    extractor: &'a TemplateExtractor,
    timestamp: f64,
    state: MatchState<'a>,
}

impl Iterator for MatchScan<'_> {
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, MatchState::Done) {
                MatchState::Done => return None,
                MatchState::Pending { image, deadline } => match self.extractor.locate(image, &deadline) {
                    Ok(matches) => self.state = MatchState::Ready(matches.into()),
                    Err(e) => return Some(Err(e)),
                },
                MatchState::Ready(mut matches) => {
                    let found = matches.pop_front()?;
                    self.state = MatchState::Ready(matches);
                    return Some(Ok(self.extractor.observation(found, self.timestamp)));
                }
            }
        }
    }
}

impl FeatureExtractor for TemplateExtractor {
    fn extract<'a>(
        &'a self,
        image: &'a GrayImage,
        timestamp: f64,
        deadline: Deadline,
    ) -> Observations<'a> {
        Box::new(MatchScan {
            extractor: self,
            timestamp,
            state: MatchState::Pending { image, deadline },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn spot_image(rows: usize, cols: usize, centers: &[(f64, f64)]) -> GrayImage {
        DMatrix::from_fn(rows, cols, |r, c| {
            0.1 + centers
                .iter()
                .map(|(cr, cc)| {
                    let d2 = (r as f64 - cr).powi(2) + (c as f64 - cc).powi(2);
                    0.8 * (-d2 / 18.0).exp()
                })
                .sum::<f64>()
        })
    }

    fn extractor(settings: TemplateSettings) -> TemplateExtractor {
        TemplateExtractor::new(
            settings,
            Calibration {
                px_per_unit: 10.0,
                origin_px: [0.0, 0.0],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_gaussian_spot_shape() {
        let spot = gaussian_spot(2.0);
        assert_eq!(spot.shape(), (13, 13));
        assert_approx_eq!(spot[(6, 6)], 1.0, 1e-12);
    }

    #[test]
    fn test_matches_spot_position() {
        let image = spot_image(60, 80, &[(25.0, 40.0)]);
        let extractor = extractor(TemplateSettings::default());
        let observations: Vec<Observation> = extractor
            .extract(&image, 2.0, Deadline::unlimited())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(observations.len(), 1);
        assert_approx_eq!(observations[0].position.x, 4.0, 0.15);
        assert_approx_eq!(observations[0].position.y, -2.5, 0.15);
        assert!(observations[0].confidence > MIN_CONFIDENCE);
        assert!(observations[0].confidence <= 1.0);
        assert_eq!(observations[0].timestamp, 2.0);
    }

    #[test]
    fn test_confidence_drops_when_ambiguous() {
        let settings = TemplateSettings {
            max_observations: 2,
            remove_row_noise: false,
            ..TemplateSettings::default()
        };
        let single: Vec<Observation> = extractor(settings.clone())
            .extract(&spot_image(60, 100, &[(30.0, 25.0)]), 0.0, Deadline::unlimited())
            .collect::<Result<_>>()
            .unwrap();
        let double: Vec<Observation> = extractor(settings)
            .extract(&spot_image(60, 100, &[(30.0, 25.0), (30.0, 75.0)]), 0.0, Deadline::unlimited())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(double.len(), 2);
        assert!(
            single[0].confidence > double[0].confidence,
            "{} vs {}",
            single[0].confidence,
            double[0].confidence
        );
    }

    #[test]
    fn test_structure_gate_skips_sparse_windows() {
        let image = spot_image(60, 80, &[(25.0, 40.0)]);
        let gated = extractor(TemplateSettings {
            structure_quantile: Some(0.99),
            min_structure_fraction: 0.5,
            ..TemplateSettings::default()
        });
        assert_eq!(gated.extract(&image, 0.0, Deadline::unlimited()).count(), 0);

        let ungated = extractor(TemplateSettings {
            structure_quantile: None,
            ..TemplateSettings::default()
        });
        assert_eq!(ungated.extract(&image, 0.0, Deadline::unlimited()).count(), 1);
    }

    #[test]
    fn test_refinement_recovers_coarse_stride() {
        let image = spot_image(60, 80, &[(26.0, 41.0)]);
        let coarse = TemplateSettings {
            stride: 4,
            remove_row_noise: false,
            refine_radius_px: 0,
            ..TemplateSettings::default()
        };
        let first = |settings: TemplateSettings| -> Observation {
            extractor(settings)
                .extract(&image, 0.0, Deadline::unlimited())
                .next()
                .unwrap()
                .unwrap()
        };
        let unrefined = first(coarse.clone());
        assert!((unrefined.position.y + 2.6).abs() > 0.05);

        let refined = first(TemplateSettings {
            refine_radius_px: 8,
            ..coarse
        });
        assert_approx_eq!(refined.position.x, 4.1, 0.05);
        assert_approx_eq!(refined.position.y, -2.6, 0.05);
    }

    #[test]
    fn test_each_score_term_is_one_on_the_marker_itself() {
        let marker = gaussian_spot(3.0);
        let terms = [(1.0, 0.0, 0.0), (0.0, 1.0, 0.0), (0.0, 0.0, 1.0), (0.55, 0.35, 0.10)];
        for (zncc_weight, hog_weight, magnitude_weight) in terms {
            let extractor = extractor(TemplateSettings {
                zncc_weight,
                hog_weight,
                magnitude_weight,
                remove_row_noise: false,
                ..TemplateSettings::default()
            });
            let planes = extractor.planes(&marker);
            let score = extractor.score_at(&planes, 0, 0).unwrap();
            assert_approx_eq!(score, 1.0, 1e-9);
        }
    }

    #[test]
    fn test_settings_validation() {
        assert!(TemplateSettings::default().validate().is_ok());
        let bad = [
            TemplateSettings { stride: 0, ..TemplateSettings::default() },
            TemplateSettings {
                zncc_weight: 0.0,
                hog_weight: 0.0,
                magnitude_weight: 0.0,
                ..TemplateSettings::default()
            },
            TemplateSettings { hog_weight: -0.1, ..TemplateSettings::default() },
            TemplateSettings { hog_bins: 0, ..TemplateSettings::default() },
            TemplateSettings { structure_quantile: Some(1.5), ..TemplateSettings::default() },
            TemplateSettings { min_structure_fraction: 2.0, ..TemplateSettings::default() },
            TemplateSettings { softmax_gain: 0.0, ..TemplateSettings::default() },
        ];
        for settings in bad {
            assert!(
                matches!(settings.validate(), Err(LocalizationError::Config(_))),
                "{settings:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_nms_separates_two_spots() {
        let image = spot_image(60, 100, &[(30.0, 25.0), (30.0, 75.0)]);
        let extractor = extractor(TemplateSettings {
            max_observations: 4,
            remove_row_noise: false,
            ..TemplateSettings::default()
        });
        let observations: Vec<Observation> = extractor
            .extract(&image, 0.0, Deadline::unlimited())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(observations.len(), 2);
        let mut xs: Vec<f64> = observations.iter().map(|o| o.position.x).collect();
        xs.sort_by(|a, b| a.total_cmp(b));
        assert_approx_eq!(xs[0], 2.5, 0.15);
        assert_approx_eq!(xs[1], 7.5, 0.15);
    }

    #[test]
    fn test_flat_frame_yields_nothing() {
        let image = DMatrix::from_element(40, 40, 0.3);
        let extractor = extractor(TemplateSettings::default());
        assert_eq!(extractor.extract(&image, 0.0, Deadline::unlimited()).count(), 0);
    }

    #[test]
    fn test_zero_budget_times_out() {
        let image = spot_image(40, 40, &[(20.0, 20.0)]);
        let extractor = extractor(TemplateSettings::default());
        let results: Vec<_> = extractor.extract(&image, 0.0, Deadline::from_millis(0)).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(LocalizationError::ExtractionTimeout { .. })
        ));
    }

    #[test]
    fn test_flat_template_is_rejected() {
        let flat = DMatrix::from_element(9, 9, 0.5);
        assert!(
            TemplateExtractor::with_template(TemplateSettings::default(), Calibration::default(), &flat)
                .is_err()
        );
    }
}
