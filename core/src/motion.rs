//! Additive Gaussian motion model (the predict half of the Bayesian update).
//!
//! Every particle is moved by the commanded stage displacement plus independent zero-mean Gaussian noise
//! per active axis: `state' = state + control + noise`. Weights are not touched. Noise is drawn from the
//! generator passed in by the caller; the engine owns a single seeded `StdRng`, so a fixed seed reproduces
//! the same particle cloud.
use crate::particle::ParticleSet;
use crate::{Axes, ControlInput};

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

#[derive(Clone, Copy, Debug)]
pub struct MotionModel {
    /// Standard deviation of the per-axis process noise in physical units per frame.
    process_noise_stddev: f64,
}

impl MotionModel {
    /// # Arguments
    ///
    /// * `process_noise_stddev` - Standard deviation of the stage/motion uncertainty per frame
    ///
    /// # Panics
    ///
    /// Panics if `process_noise_stddev` is negative or not finite. [`crate::FilterConfig::validate`]
    /// rejects such values before an engine is built.
    pub fn new(process_noise_stddev: f64) -> Self {
        assert!(
            process_noise_stddev >= 0.0 && process_noise_stddev.is_finite(),
            "Process noise standard deviation must be non-negative"
        );
        MotionModel {
            process_noise_stddev,
        }
    }

    pub fn process_noise_stddev(&self) -> f64 {
        self.process_noise_stddev
    }

    /// Variance added to each active axis by one prediction step.
    pub fn step_variance(&self) -> f64 {
        self.process_noise_stddev * self.process_noise_stddev
    }

    /// Draw a noise vector restricted to `axes`.
    fn sample_noise<R: Rng>(&self, axes: Axes, rng: &mut R) -> Vector3<f64> {
        if self.process_noise_stddev == 0.0 {
            return Vector3::zeros();
        }
        let sigma = self.process_noise_stddev;
        let mut noise = Vector3::zeros();
        for axis in 0..axes.count() {
            let z: f64 = StandardNormal.sample(rng);
            noise[axis] = z * sigma;
        }
        noise
    }

    /// Propagate every particle in `set` by `control`.
    pub fn predict<R: Rng>(&self, set: &mut ParticleSet, control: &ControlInput, rng: &mut R) {
        let axes = set.axes();
        let displacement = axes.mask(control.displacement);
        for particle in set.particles_mut() {
            let noise = self.sample_noise(axes, rng);
            particle.state += displacement + noise;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriorRegion;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cloud(seed: u64) -> ParticleSet {
        let mut rng = StdRng::seed_from_u64(seed);
        ParticleSet::scatter(
            &PriorRegion::square(0.0, 0.0, 2.0),
            400,
            Axes::Planar,
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_noise_applies_control_exactly() {
        let mut set = cloud(1);
        let before: Vec<_> = set.particles().iter().map(|p| p.state).collect();
        let model = MotionModel::new(0.0);
        let mut rng = StdRng::seed_from_u64(42);
        model.predict(&mut set, &ControlInput::planar(1.5, -0.5, 1.0), &mut rng);
        for (p, b) in set.particles().iter().zip(before.iter()) {
            assert_approx_eq!(p.state.x, b.x + 1.5, 1e-12);
            assert_approx_eq!(p.state.y, b.y - 0.5, 1e-12);
            assert_eq!(p.state.z, 0.0);
        }
    }

    #[test]
    fn test_predict_leaves_weights_untouched() {
        let mut set = cloud(2);
        let weights: Vec<f64> = set.particles().iter().map(|p| p.weight).collect();
        let model = MotionModel::new(0.3);
        let mut rng = StdRng::seed_from_u64(7);
        model.predict(&mut set, &ControlInput::planar(1.0, 0.0, 1.0), &mut rng);
        for (p, w) in set.particles().iter().zip(weights.iter()) {
            assert_eq!(p.weight, *w);
        }
    }

    #[test]
    fn test_same_seed_reproduces_cloud() {
        let mut a = cloud(3);
        let mut b = cloud(3);
        let model = MotionModel::new(0.2);
        let mut rng_a = StdRng::seed_from_u64(99);
        let mut rng_b = StdRng::seed_from_u64(99);
        for _ in 0..5 {
            model.predict(&mut a, &ControlInput::planar(0.1, 0.2, 0.0), &mut rng_a);
            model.predict(&mut b, &ControlInput::planar(0.1, 0.2, 0.0), &mut rng_b);
        }
        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn test_noise_statistics() {
        let mut set = ParticleSet::from_particles(
            vec![crate::particle::Particle::new(Vector3::zeros(), 1.0); 20_000],
            Axes::Planar,
        );
        let model = MotionModel::new(0.5);
        let mut rng = StdRng::seed_from_u64(5);
        model.predict(&mut set, &ControlInput::zero(0.0), &mut rng);
        let n = set.len() as f64;
        let mean_x = set.particles().iter().map(|p| p.state.x).sum::<f64>() / n;
        let var_x = set
            .particles()
            .iter()
            .map(|p| (p.state.x - mean_x).powi(2))
            .sum::<f64>()
            / n;
        assert!(mean_x.abs() < 0.02, "mean_x = {mean_x}");
        assert!((var_x - 0.25).abs() < 0.02, "var_x = {var_x}");
        assert!(set.particles().iter().all(|p| p.state.z == 0.0));
    }

    #[test]
    #[should_panic(expected = "Process noise standard deviation must be non-negative")]
    fn test_negative_process_noise() {
        let _model = MotionModel::new(-1.0);
    }
}
