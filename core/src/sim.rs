//! Synthetic scenarios: a probe moving along a straight track, the controls that move it, noisy
//! observations of it and rendered camera frames showing it as a bright spot.
//!
//! Used by the `simulate` command and by the integration tests.
use crate::features::{Calibration, Frame};
use crate::{Axes, ControlInput, Observation};

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

/// Renders a Gaussian spot at a physical position onto a single-channel frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpotRenderer {
    pub width: u32,
    pub height: u32,
    pub calibration: Calibration,
    /// Spot radius (1σ) in pixels.
    pub sigma_px: f64,
    pub amplitude: f64,
    pub background: f64,
    /// Additive per-pixel Gaussian noise on normalised intensity.
    pub noise_stddev: f64,
}

impl Default for SpotRenderer {
    fn default() -> Self {
        SpotRenderer {
            width: 128,
            height: 128,
            calibration: Calibration::default(),
            sigma_px: 2.5,
            amplitude: 0.8,
            background: 0.1,
            noise_stddev: 0.02,
        }
    }
}

impl SpotRenderer {
    pub fn render<R: Rng>(&self, position: &Vector3<f64>, timestamp: f64, rng: &mut R) -> Frame {
        let (col0, row0) = self.calibration.physical_to_pixel(position);
        let two_sigma_sq = 2.0 * self.sigma_px * self.sigma_px;
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize);
        for row in 0..self.height {
            for col in 0..self.width {
                let d2 = (col as f64 - col0).powi(2) + (row as f64 - row0).powi(2);
                let noise: f64 = if self.noise_stddev > 0.0 {
                    let z: f64 = StandardNormal.sample(rng);
                    z * self.noise_stddev
                } else {
                    0.0
                };
                let value = self.background + self.amplitude * (-d2 / two_sigma_sq).exp() + noise;
                pixels.push((value.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        Frame::new(pixels, self.width, self.height, 1, timestamp)
    }
}

/// One frame of a scenario.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScenarioStep {
    pub timestamp: f64,
    /// True probe position at `timestamp`.
    pub truth: Vector3<f64>,
    /// Commanded displacement since the previous frame.
    pub control: ControlInput,
    /// Noisy position fix.
    pub observation: Observation,
}

/// Constant-velocity track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearTrack {
    pub start: Vector3<f64>,
    /// Displacement per frame.
    pub velocity: Vector3<f64>,
    pub frames: usize,
    /// Seconds between frames.
    pub frame_interval: f64,
    /// 1σ noise of the observations per tracked axis.
    pub observation_noise: f64,
    pub axes: Axes,
}

impl Default for LinearTrack {
    fn default() -> Self {
        LinearTrack {
            start: Vector3::zeros(),
            velocity: Vector3::new(1.0, 0.0, 0.0),
            frames: 50,
            frame_interval: 1.0,
            observation_noise: 0.1,
            axes: Axes::Planar,
        }
    }
}

impl LinearTrack {
    pub fn position_at(&self, frame: usize) -> Vector3<f64> {
        self.axes.mask(self.start + self.velocity * frame as f64)
    }

    pub fn end(&self) -> Vector3<f64> {
        self.position_at(self.frames)
    }

    /// Frames `1..=frames`, each with the control that led to it and a noisy observation.
    pub fn steps<R: Rng>(&self, rng: &mut R) -> Vec<ScenarioStep> {
        let noise = Normal::new(0.0, self.observation_noise.max(0.0)).ok();
        let control = self.axes.mask(self.velocity);
        (1..=self.frames)
            .map(|k| {
                let timestamp = k as f64 * self.frame_interval;
                let truth = self.position_at(k);
                let mut offset = Vector3::zeros();
                if let Some(noise) = &noise {
                    for axis in 0..self.axes.count() {
                        offset[axis] = noise.sample(rng);
                    }
                }
                ScenarioStep {
                    timestamp,
                    truth,
                    control: ControlInput::new(control, timestamp),
                    observation: Observation::new(truth + offset, timestamp),
                }
            })
            .collect()
    }

    /// Calibration that keeps the whole track inside a `width`×`height` frame with `margin_px` to
    /// spare on each side.
    pub fn fit_calibration(&self, width: u32, height: u32, margin_px: f64) -> Calibration {
        let end = self.end();
        let (min_x, max_x) = (self.start.x.min(end.x), self.start.x.max(end.x));
        let (min_y, max_y) = (self.start.y.min(end.y), self.start.y.max(end.y));
        let usable_w = (width as f64 - 2.0 * margin_px).max(1.0);
        let usable_h = (height as f64 - 2.0 * margin_px).max(1.0);
        let span_x = (max_x - min_x).max(1e-9);
        let span_y = (max_y - min_y).max(1e-9);
        let px_per_unit = (usable_w / span_x).min(usable_h / span_y);
        // Centre the track's bounding box.
        let center_x = 0.5 * (min_x + max_x);
        let center_y = 0.5 * (min_y + max_y);
        Calibration {
            px_per_unit,
            origin_px: [
                width as f64 / 2.0 - center_x * px_per_unit,
                height as f64 / 2.0 + center_y * px_per_unit,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{CentroidExtractor, CentroidSettings, Deadline, FeatureExtractor};
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_track_steps() {
        let track = LinearTrack::default();
        let mut rng = StdRng::seed_from_u64(1);
        let steps = track.steps(&mut rng);
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[49].truth, Vector3::new(50.0, 0.0, 0.0));
        assert_eq!(steps[0].control.displacement, Vector3::new(1.0, 0.0, 0.0));
        let mean_err: f64 = steps
            .iter()
            .map(|s| s.observation.position.x - s.truth.x)
            .sum::<f64>()
            / 50.0;
        assert!(mean_err.abs() < 0.1);
        assert!(steps.iter().all(|s| s.observation.position.z == 0.0));
    }

    #[test]
    fn test_fit_calibration_keeps_track_in_frame() {
        let track = LinearTrack::default();
        let calibration = track.fit_calibration(256, 128, 16.0);
        let (c0, r0) = calibration.physical_to_pixel(&track.start);
        let (c1, r1) = calibration.physical_to_pixel(&track.end());
        assert_approx_eq!(c0, 16.0, 1e-9);
        assert_approx_eq!(c1, 240.0, 1e-9);
        assert_approx_eq!(r0, 64.0, 1e-9);
        assert_approx_eq!(r1, 64.0, 1e-9);
    }

    #[test]
    fn test_rendered_spot_is_extracted() {
        let renderer = SpotRenderer {
            calibration: Calibration {
                px_per_unit: 8.0,
                origin_px: [64.0, 64.0],
            },
            ..SpotRenderer::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let truth = Vector3::new(2.0, -1.5, 0.0);
        let frame = renderer.render(&truth, 4.0, &mut rng);
        assert!(frame.validate().is_ok());

        let extractor = CentroidExtractor::new(CentroidSettings::default(), renderer.calibration);
        let image = frame.to_gray().unwrap();
        let observations: Vec<Observation> = extractor
            .extract(&image, frame.timestamp, Deadline::unlimited())
            .collect::<crate::Result<_>>()
            .unwrap();
        assert_eq!(observations.len(), 1);
        assert!((observations[0].position - truth).norm() < 0.1);
    }
}
