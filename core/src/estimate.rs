//! Reduction of a weighted particle set into a single position estimate.
//!
//! The mode is fixed at configuration time and dispatched with a plain `match`; it never changes during
//! a session.
use crate::particle::ParticleSet;
use crate::{Axes, PriorRegion};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorMode {
    /// Weighted mean with weighted covariance.
    #[default]
    Mean,
    /// Highest-weight particle. Preferred when the posterior is multi-modal and the mean would fall
    /// between two clusters.
    MaxWeight,
}

impl EstimatorMode {
    /// Point estimate and covariance of `set`. Weights are assumed normalized.
    pub fn estimate(&self, set: &ParticleSet) -> (Vector3<f64>, Matrix3<f64>) {
        match self {
            EstimatorMode::Mean => weighted_mean_state(set),
            EstimatorMode::MaxWeight => highest_weight_state(set),
        }
    }
}

/// Weighted second moment of the set about `center`.
fn spread_about(set: &ParticleSet, center: &Vector3<f64>) -> Matrix3<f64> {
    let total = set.weight_sum();
    let mut cov = Matrix3::<f64>::zeros();
    if !(total > 0.0) {
        return cov;
    }
    for particle in set.particles() {
        let diff = particle.state - center;
        cov += (particle.weight / total) * diff * diff.transpose();
    }
    set.axes().mask_matrix(cov)
}

fn weighted_mean_state(set: &ParticleSet) -> (Vector3<f64>, Matrix3<f64>) {
    let total = set.weight_sum();
    let mut mean = Vector3::<f64>::zeros();
    if total > 0.0 {
        for particle in set.particles() {
            mean += (particle.weight / total) * particle.state;
        }
    }
    let mean = set.axes().mask(mean);
    (mean, spread_about(set, &mean))
}

fn highest_weight_state(set: &ParticleSet) -> (Vector3<f64>, Matrix3<f64>) {
    match set.best() {
        Some(best) => {
            let state = best.state;
            (state, spread_about(set, &state))
        }
        None => (Vector3::zeros(), Matrix3::zeros()),
    }
}

/// Analytic prior propagated through prediction-only cycles.
///
/// Until the first observation is fused after (re)initialization, the estimate is the prior's own
/// mean and covariance, shifted by the accumulated control and widened by the accumulated process noise.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PropagatedPrior {
    prior: PriorRegion,
    axes: Axes,
    drift: Vector3<f64>,
    added_variance: f64,
}

impl PropagatedPrior {
    pub fn new(prior: PriorRegion, axes: Axes) -> Self {
        PropagatedPrior {
            prior,
            axes,
            drift: Vector3::zeros(),
            added_variance: 0.0,
        }
    }

    /// Account for one prediction step.
    pub fn advance(&mut self, displacement: &Vector3<f64>, step_variance: f64) {
        self.drift += self.axes.mask(*displacement);
        self.added_variance += step_variance;
    }

    pub fn mean(&self) -> Vector3<f64> {
        self.axes.mask(self.prior.center() + self.drift)
    }

    pub fn covariance(&self) -> Matrix3<f64> {
        let growth = self.axes.mask(Vector3::repeat(self.added_variance));
        self.axes
            .mask_matrix(self.prior.covariance() + Matrix3::from_diagonal(&growth))
    }
}
