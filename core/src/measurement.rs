//! Gaussian measurement model.
//!
//! Each particle's weight is multiplied by the likelihood of the frame's observations given the
//! particle's hypothesized position. Landmarks are treated as independent single-target evidence, so the
//! log-likelihoods of all observations in a frame are summed:
//!
//! $$
//! \log L_i = \sum_o \left[ -\frac{d_{i,o}^2}{2\sigma_o^2} - \frac{k}{2}\log(2\pi\sigma_o^2) \right],
//! \qquad \sigma_o^2 = \frac{\sigma_{meas}^2 + \sigma_{obs}^2}{c_o}
//! $$
//!
//! where `d` is the distance over the `k` active axes and `c_o` the observation confidence. Everything
//! stays in log space until the maximum log weight has been subtracted, so a very sharp likelihood (zero
//! measurement noise, far-off observations) only underflows the particles that are genuinely unlikely.
//! When every particle's log weight is -∞ or not finite the update is reported as
//! [`WeightingOutcome::Degenerate`] and the set is left exactly as it was.
//!
//! Observations whose confidence or uncertainty cannot be used (zero, negative or non-finite) carry no
//! information and are skipped. A frame made only of such observations is weighted like an empty one.
use crate::particle::ParticleSet;
use crate::{Axes, Observation};

use nalgebra::Vector3;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Variance floor. Keeps a zero-noise configuration finite while still making it maximally sharp.
pub const MIN_VARIANCE: f64 = 1e-12;

/// Result of weighting a particle set against one frame's observations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightingOutcome {
    /// The frame had no observations; weights are unchanged.
    NoObservations,
    /// Weights were updated and normalized.
    Updated { ess: f64 },
    /// Every combined weight was zero or non-finite; weights are unchanged.
    Degenerate,
}

#[derive(Clone, Debug)]
pub struct MeasurementModel {
    measurement_noise_stddev: f64,
    gate_sigma: Option<f64>,
    scratch: Vec<f64>,
}

impl MeasurementModel {
    /// # Arguments
    ///
    /// * `measurement_noise_stddev` - Standard deviation of the image-derived position noise
    /// * `gate_sigma` - Optional outlier gate; particles farther than `gate_sigma` effective standard
    ///   deviations from an observation get zero likelihood
    pub fn new(measurement_noise_stddev: f64, gate_sigma: Option<f64>) -> Self {
        MeasurementModel {
            measurement_noise_stddev,
            gate_sigma,
            scratch: Vec::new(),
        }
    }

    /// Whether `observation` can contribute to a weighting.
    pub fn is_informative(&self, observation: &Observation) -> bool {
        observation.confidence.is_finite()
            && observation.confidence > 0.0
            && observation.stddev.is_finite()
            && observation.stddev >= 0.0
    }

    /// Effective variance for one observation. Infinite for an uninformative observation.
    pub fn observation_variance(&self, observation: &Observation) -> f64 {
        if !self.is_informative(observation) {
            return f64::INFINITY;
        }
        let confidence = observation.confidence.min(1.0);
        let raw = self.measurement_noise_stddev.powi(2) + observation.stddev.powi(2);
        (raw / confidence).max(MIN_VARIANCE)
    }

    /// Log-likelihood of `observations` for a particle at `state`.
    pub fn log_likelihood(&self, state: &Vector3<f64>, observations: &[Observation], axes: Axes) -> f64 {
        let k = axes.count() as f64;
        observations
            .iter()
            .map(|obs| {
                let variance = self.observation_variance(obs);
                if !variance.is_finite() {
                    return 0.0;
                }
                let residual = axes.mask(obs.position - state);
                let d2 = residual.norm_squared();
                if let Some(gate) = self.gate_sigma {
                    if d2 > gate * gate * variance {
                        return f64::NEG_INFINITY;
                    }
                }
                -0.5 * d2 / variance - 0.5 * k * (2.0 * PI * variance).ln()
            })
            .sum()
    }

    /// Multiply every particle's weight by the likelihood of `observations` and normalize.
    pub fn update(&mut self, set: &mut ParticleSet, observations: &[Observation]) -> WeightingOutcome {
        if !observations.iter().any(|obs| self.is_informative(obs)) {
            return WeightingOutcome::NoObservations;
        }
        let mut log_weights = std::mem::take(&mut self.scratch);
        let outcome = self.apply(set, observations, &mut log_weights);
        self.scratch = log_weights;
        outcome
    }

    fn apply(
        &self,
        set: &mut ParticleSet,
        observations: &[Observation],
        log_weights: &mut Vec<f64>,
    ) -> WeightingOutcome {
        let axes = set.axes();
        log_weights.clear();
        log_weights.resize(set.len(), f64::NEG_INFINITY);
        log_weights
            .par_iter_mut()
            .zip(set.particles().par_iter())
            .for_each(|(lw, p)| {
                if p.weight > 0.0 && p.weight.is_finite() {
                    *lw = p.weight.ln() + self.log_likelihood(&p.state, observations, axes);
                }
            });

        let max_log = log_weights
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            return WeightingOutcome::Degenerate;
        }

        let previous: Vec<f64> = set.particles().iter().map(|p| p.weight).collect();
        set.particles_mut()
            .par_iter_mut()
            .zip(log_weights.par_iter())
            .for_each(|(p, &lw)| {
                p.weight = if lw.is_nan() { 0.0 } else { (lw - max_log).exp() };
            });
        match set.normalize() {
            Some(ess) => {
                set.mark_observed();
                WeightingOutcome::Updated { ess }
            }
            None => {
                for (p, w) in set.particles_mut().iter_mut().zip(previous) {
                    p.weight = w;
                }
                WeightingOutcome::Degenerate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use assert_approx_eq::assert_approx_eq;

    fn line_set() -> ParticleSet {
        let particles = (0..11)
            .map(|i| Particle::new(Vector3::new(i as f64 - 5.0, 0.0, 0.0), 1.0 / 11.0))
            .collect();
        ParticleSet::from_particles(particles, Axes::Planar)
    }

    #[test]
    fn test_no_observations_leaves_weights() {
        let mut set = line_set();
        let mut model = MeasurementModel::new(0.5, None);
        assert_eq!(model.update(&mut set, &[]), WeightingOutcome::NoObservations);
        assert!(set.particles().iter().all(|p| p.weight == 1.0 / 11.0));
        assert!(!set.has_observations());
    }

    #[test]
    fn test_weights_peak_at_observation() {
        let mut set = line_set();
        let mut model = MeasurementModel::new(1.0, None);
        let outcome = model.update(&mut set, &[Observation::planar(2.0, 0.0, 0.0)]);
        assert!(matches!(outcome, WeightingOutcome::Updated { .. }));
        let best = set.best().unwrap();
        assert_approx_eq!(best.state.x, 2.0, 1e-12);
        assert_approx_eq!(set.particles().iter().map(|p| p.weight).sum::<f64>(), 1.0, 1e-9);
        assert!(set.has_observations());

        // Symmetric neighbours get equal weight.
        let w1 = set.particles()[6].weight;
        let w3 = set.particles()[8].weight;
        assert_approx_eq!(w1, w3, 1e-12);
    }

    #[test]
    fn test_zero_noise_is_sharp_but_finite() {
        let mut set = line_set();
        let mut model = MeasurementModel::new(0.0, None);
        let outcome = model.update(&mut set, &[Observation::planar(1.2, 0.0, 0.0)]);
        match outcome {
            WeightingOutcome::Updated { ess } => assert_approx_eq!(ess, 1.0, 1e-9),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(set.best().unwrap().state.x, 1.0);
    }

    #[test]
    fn test_gate_rejects_far_observation() {
        let mut set = line_set();
        let before: Vec<f64> = set.particles().iter().map(|p| p.weight).collect();
        let mut model = MeasurementModel::new(0.1, Some(5.0));
        let outcome = model.update(&mut set, &[Observation::planar(100.0, 100.0, 0.0)]);
        assert_eq!(outcome, WeightingOutcome::Degenerate);
        let after: Vec<f64> = set.particles().iter().map(|p| p.weight).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_non_finite_observation_is_degenerate() {
        let mut set = line_set();
        let mut model = MeasurementModel::new(0.1, None);
        let outcome = model.update(&mut set, &[Observation::planar(f64::NAN, 0.0, 0.0)]);
        assert_eq!(outcome, WeightingOutcome::Degenerate);
    }

    #[test]
    fn test_low_confidence_flattens_likelihood() {
        let model = MeasurementModel::new(1.0, None);
        let confident = Observation::planar(0.0, 0.0, 0.0);
        let unsure = confident.with_confidence(0.25);
        assert_approx_eq!(model.observation_variance(&confident), 1.0, 1e-12);
        assert_approx_eq!(model.observation_variance(&unsure), 4.0, 1e-12);
        let far = Vector3::new(3.0, 0.0, 0.0);
        let near = Vector3::zeros();
        let ratio_confident = model.log_likelihood(&near, &[confident], Axes::Planar)
            - model.log_likelihood(&far, &[confident], Axes::Planar);
        let ratio_unsure = model.log_likelihood(&near, &[unsure], Axes::Planar)
            - model.log_likelihood(&far, &[unsure], Axes::Planar);
        assert!(ratio_unsure < ratio_confident);
    }

    #[test]
    fn test_uninformative_observations_are_skipped() {
        let mut set = line_set();
        let mut model = MeasurementModel::new(0.5, None);
        let nan_confidence = Observation::planar(3.0, 3.0, 0.0).with_confidence(f64::NAN);
        let zero_confidence = Observation::planar(3.0, 3.0, 0.0).with_confidence(0.0);
        let nan_stddev = Observation::planar(3.0, 3.0, 0.0).with_stddev(f64::NAN);
        for obs in [nan_confidence, zero_confidence, nan_stddev] {
            assert!(!model.is_informative(&obs));
            assert_eq!(model.observation_variance(&obs), f64::INFINITY);
        }
        let outcome = model.update(&mut set, &[nan_confidence, zero_confidence, nan_stddev]);
        assert_eq!(outcome, WeightingOutcome::NoObservations);
        assert!(set.particles().iter().all(|p| p.weight == 1.0 / 11.0));
        assert!(!set.has_observations());

        // Mixed with a usable observation only the usable one shapes the weights.
        let outcome = model.update(&mut set, &[nan_stddev, Observation::planar(-2.0, 0.0, 0.0)]);
        assert!(matches!(outcome, WeightingOutcome::Updated { .. }));
        assert_approx_eq!(set.best().unwrap().state.x, -2.0, 1e-12);
    }

    #[test]
    fn test_multiple_observations_sum_log_likelihoods() {
        let model = MeasurementModel::new(1.0, None);
        let a = Observation::planar(1.0, 0.0, 0.0);
        let b = Observation::planar(-1.0, 0.0, 0.0);
        let state = Vector3::new(0.5, 0.0, 0.0);
        let joint = model.log_likelihood(&state, &[a, b], Axes::Planar);
        let separate = model.log_likelihood(&state, &[a], Axes::Planar)
            + model.log_likelihood(&state, &[b], Axes::Planar);
        assert_approx_eq!(joint, separate, 1e-12);
    }
}
