//! Particle storage, weight normalization and resampling.
//!
//! Particles live in a single contiguous arena ([`ParticleSet`]) indexed by particle id. A particle is a
//! small `Copy` value, so the hot predict/weight loops touch one flat buffer and never allocate per
//! particle. The set size N is fixed for the lifetime of a set; a new set is scattered on
//! (re)initialization.
//!
//! Resampling is expressed as index selection (`*_resample` functions return the ids to copy) so every
//! strategy shares the same copy-and-reset step.
use crate::{Axes, LocalizationError, PriorRegion, Result};

use nalgebra::Vector3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// One hypothesized probe position and its importance weight.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    pub state: Vector3<f64>,
    pub weight: f64,
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.state.x)
            .field("y", &self.state.y)
            .field("z", &self.state.z)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Particle {
    pub fn new(state: Vector3<f64>, weight: f64) -> Particle {
        Particle { state, weight }
    }
}

/// Resampling scheme applied when the effective sample size falls below threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// One random offset and N evenly spaced draws. Lowest variance.
    #[default]
    Systematic,
    /// One independent draw inside each of N equal strata.
    Stratified,
    /// N independent draws proportional to weight.
    Multinomial,
    /// Deterministic floor(N·w) copies, remainder drawn systematically from the residuals.
    Residual,
}

impl ResamplingStrategy {
    /// Select `weights.len()` particle ids proportional to `weights` (assumed normalized).
    pub fn indices<R: Rng>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        match self {
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    weights
        .iter()
        .map(|w| {
            acc += w;
            acc
        })
        .collect()
}

/// Walk sorted `positions` (all within `[0, total)`) along the cumulative weights.
fn select_sorted(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = cumsum.len().saturating_sub(1);
    let mut indices = Vec::with_capacity(cumsum.len());
    let mut i = 0;
    for u in positions {
        while i < last && u >= cumsum[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

pub fn systematic_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    let total = cumsum[cumsum.len() - 1];
    let step = total / n as f64;
    let offset = rng.random::<f64>() * step;
    select_sorted(&cumsum, (0..n).map(|k| offset + k as f64 * step))
}

pub fn stratified_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    let total = cumsum[cumsum.len() - 1];
    let step = total / n as f64;
    let positions: Vec<f64> = (0..n)
        .map(|k| (k as f64 + rng.random::<f64>()) * step)
        .collect();
    select_sorted(&cumsum, positions.into_iter())
}

pub fn multinomial_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    let total = cumsum[cumsum.len() - 1];
    let last = cumsum.len() - 1;
    (0..n)
        .map(|_| {
            let u = rng.random::<f64>() * total;
            cumsum.partition_point(|&c| c <= u).min(last)
        })
        .collect()
}

pub fn residual_resample<R: Rng>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if n == 0 || weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * n as f64;
        let copies = scaled.floor() as usize;
        for _ in 0..copies {
            indices.push(i);
        }
        residual.push(scaled - copies as f64);
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices
}

/// Fixed-size particle arena plus aggregate weight statistics.
#[derive(Clone, Debug)]
pub struct ParticleSet {
    particles: Vec<Particle>,
    axes: Axes,
    weight_sum: f64,
    ess: f64,
    observed: bool,
}

impl ParticleSet {
    /// Scatter `n` equally weighted particles over `prior`.
    pub fn scatter<R: Rng>(prior: &PriorRegion, n: usize, axes: Axes, rng: &mut R) -> Result<Self> {
        if n == 0 {
            return Err(LocalizationError::Config(
                "particle count must be positive".to_string(),
            ));
        }
        prior.validate()?;
        let weight = 1.0 / n as f64;
        let particles = (0..n)
            .map(|_| Particle::new(prior.sample(axes, rng), weight))
            .collect();
        let mut set = ParticleSet {
            particles,
            axes,
            weight_sum: 0.0,
            ess: 0.0,
            observed: false,
        };
        set.refresh_statistics();
        Ok(set)
    }

    /// Build a set from explicit particles. Weights are taken as given and statistics recomputed.
    pub fn from_particles(particles: Vec<Particle>, axes: Axes) -> Self {
        let mut set = ParticleSet {
            particles,
            axes,
            weight_sum: 0.0,
            ess: 0.0,
            observed: false,
        };
        set.refresh_statistics();
        set
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn axes(&self) -> Axes {
        self.axes
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Mutable access for the per-particle model steps. Callers that change weights must follow up
    /// with [`ParticleSet::normalize`].
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn weight_sum(&self) -> f64 {
        self.weight_sum
    }

    /// Effective sample size `1 / Σ w²`, clamped to `[1, N]`.
    pub fn effective_sample_size(&self) -> f64 {
        self.ess
    }

    /// Whether an observation has been fused since the set was scattered.
    pub fn has_observations(&self) -> bool {
        self.observed
    }

    pub fn mark_observed(&mut self) {
        self.observed = true;
    }

    fn refresh_statistics(&mut self) {
        self.weight_sum = self.particles.iter().map(|p| p.weight).sum();
        let n = self.particles.len() as f64;
        let sum_of_squares: f64 = if self.weight_sum > 0.0 && self.weight_sum.is_finite() {
            self.particles
                .iter()
                .map(|p| {
                    let w = p.weight / self.weight_sum;
                    w * w
                })
                .sum()
        } else {
            0.0
        };
        self.ess = if sum_of_squares > 0.0 {
            (1.0 / sum_of_squares).clamp(1.0, n)
        } else {
            0.0
        };
    }

    /// Scale weights to sum to one.
    ///
    /// Returns the new effective sample size, or `None` when the weight sum is zero or non-finite.
    /// On failure the weights are left untouched.
    pub fn normalize(&mut self) -> Option<f64> {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if !(sum > 0.0 && sum.is_finite()) || self.particles.iter().any(|p| p.weight < 0.0) {
            return None;
        }
        for particle in &mut self.particles {
            particle.weight /= sum;
        }
        self.refresh_statistics();
        Some(self.ess)
    }

    /// Resample unconditionally with `strategy`; every weight becomes exactly `1/N`.
    pub fn resample<R: Rng>(&mut self, strategy: ResamplingStrategy, rng: &mut R) {
        let n = self.particles.len();
        if n == 0 {
            return;
        }
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let indices = strategy.indices(&weights, rng);
        let uniform = 1.0 / n as f64;
        let resampled: Vec<Particle> = indices
            .into_iter()
            .map(|idx| Particle::new(self.particles[idx].state, uniform))
            .collect();
        debug_assert_eq!(resampled.len(), n);
        self.particles = resampled;
        self.refresh_statistics();
    }

    /// Resample when `ESS < threshold_fraction · N`. Returns true if resampling was performed.
    pub fn resample_if_needed<R: Rng>(
        &mut self,
        strategy: ResamplingStrategy,
        threshold_fraction: f64,
        rng: &mut R,
    ) -> bool {
        let threshold = threshold_fraction * self.particles.len() as f64;
        if self.ess < threshold {
            self.resample(strategy, rng);
            true
        } else {
            false
        }
    }

    /// Highest-weight particle. Ties resolve to the lowest id.
    pub fn best(&self) -> Option<&Particle> {
        self.particles.iter().reduce(|best, p| {
            if p.weight > best.weight { p } else { best }
        })
    }
}
