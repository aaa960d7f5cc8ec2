//! Particle-filter localization of a microscope probe
//!
//! This crate tracks the true position of a scanning probe relative to the sample by fusing two sources
//! of information: the displacement applied to the positioning stage between frames (the control input)
//! and noisy position hypotheses extracted from the images the microscope delivers (the observations).
//! The estimator is a sequential Monte-Carlo (particle) filter. Each incoming frame drives exactly one
//! predict → weight → (maybe) resample → estimate cycle.
//!
//! The instrument-control layer (stage drivers, temperature and field ramps, cryogen monitoring, the GUI)
//! is not part of this crate. It is treated as an external collaborator that supplies frames and control
//! inputs and consumes the published [`StateEstimate`].
//!
//! ## Crate overview
//!
//! - [features]: Frame validation, grayscale conversion, pixel-to-physical calibration and the landmark
//!   extractors that turn a frame into a lazy sequence of [`Observation`]s.
//! - [particle]: The contiguous particle arena ([`particle::ParticleSet`]), normalization, effective sample
//!   size and the resampling strategies.
//! - [motion]: The additive Gaussian motion model (the "predict" half of the Bayesian update).
//! - [measurement]: The log-space Gaussian likelihood used to weight particles against observations.
//! - [estimate]: Reduction of a weighted particle set into a point estimate and covariance.
//! - [engine]: The per-frame cycle and the tracking state machine.
//! - [worker]: Bounded frame queue, control ledger, estimate publisher and the dedicated engine thread.
//! - [record]: Append-only per-cycle CSV log and its replay.
//! - [config]: Serializable filter configuration (JSON/YAML/TOML).
//! - [sim]: Synthetic frame rendering and scenarios used by the CLI and the test suite.
//!
//! ## Coordinates
//!
//! Positions are expressed in physical units of the sample (typically micrometres) in a right-handed
//! Cartesian frame: x to the right, y up, z toward the objective. Two-axis tracking ([`Axes::Planar`])
//! keeps the z component pinned to zero. Image rows grow downward, so the pixel-to-physical mapping in
//! [`features::Calibration`] flips the vertical axis.
//!
//! ## Example
//!
//! ```rust
//! use locator::{ControlInput, FilterConfig, FilterEngine, Observation, PriorRegion};
//!
//! let config = FilterConfig { particle_count: 200, ..FilterConfig::default() };
//! let mut engine = FilterEngine::new(config).unwrap();
//! engine.initialize(PriorRegion::square(0.0, 0.0, 4.0), 200).unwrap();
//!
//! let control = ControlInput::planar(1.0, 0.0, 1.0);
//! let observation = Observation::planar(1.0, 0.0, 1.0);
//! let report = engine.step_observations(&[observation], control, 1.0).unwrap();
//! assert!((report.estimate.position.x - 1.0).abs() < 1.0);
//! ```
pub mod config;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod features;
pub mod measurement;
pub mod motion;
pub mod particle;
pub mod record;
pub mod sim;
pub mod worker;

pub use config::FilterConfig;
pub use engine::{CycleReport, FilterEngine};
pub use error::{Diagnostic, LocalizationError, Result};

use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Spatial axes tracked by the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axes {
    /// x and y only; z is pinned to zero.
    #[default]
    Planar,
    /// x, y and z.
    Volumetric,
}

impl Axes {
    /// Number of active axes.
    pub fn count(self) -> usize {
        match self {
            Axes::Planar => 2,
            Axes::Volumetric => 3,
        }
    }

    /// Zero out the components of `v` that are not tracked.
    pub fn mask(self, v: Vector3<f64>) -> Vector3<f64> {
        match self {
            Axes::Planar => Vector3::new(v.x, v.y, 0.0),
            Axes::Volumetric => v,
        }
    }

    /// Zero out the rows and columns of `m` that are not tracked.
    pub fn mask_matrix(self, mut m: Matrix3<f64>) -> Matrix3<f64> {
        if self == Axes::Planar {
            for i in 0..3 {
                m[(2, i)] = 0.0;
                m[(i, 2)] = 0.0;
            }
        }
        m
    }
}

/// Lifecycle state of the filter engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    Uninitialized,
    Tracking,
    Degenerate,
    Lost,
}

impl Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackingState::Uninitialized => "uninitialized",
            TrackingState::Tracking => "tracking",
            TrackingState::Degenerate => "degenerate",
            TrackingState::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// A position hypothesis extracted from a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Hypothesized probe position in physical units.
    pub position: Vector3<f64>,
    /// Intrinsic 1-sigma uncertainty of this observation in physical units. Added in quadrature to the
    /// configured measurement noise.
    pub stddev: f64,
    /// Detector confidence in (0, 1]. Lower confidence inflates the effective variance.
    pub confidence: f64,
    /// Timestamp of the source frame (seconds).
    pub timestamp: f64,
}

impl Observation {
    pub fn new(position: Vector3<f64>, timestamp: f64) -> Self {
        Observation {
            position,
            stddev: 0.0,
            confidence: 1.0,
            timestamp,
        }
    }

    pub fn planar(x: f64, y: f64, timestamp: f64) -> Self {
        Self::new(Vector3::new(x, y, 0.0), timestamp)
    }

    pub fn with_stddev(mut self, stddev: f64) -> Self {
        self.stddev = stddev;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Stage displacement applied since the previous frame.
///
/// The collaborator that supplies control inputs is responsible for windowing: a control input stamped
/// `t` covers the displacement accumulated strictly after the previous frame and up to `t`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    pub displacement: Vector3<f64>,
    pub timestamp: f64,
}

impl ControlInput {
    pub fn new(displacement: Vector3<f64>, timestamp: f64) -> Self {
        ControlInput {
            displacement,
            timestamp,
        }
    }

    pub fn planar(dx: f64, dy: f64, timestamp: f64) -> Self {
        Self::new(Vector3::new(dx, dy, 0.0), timestamp)
    }

    /// No commanded motion.
    pub fn zero(timestamp: f64) -> Self {
        Self::new(Vector3::zeros(), timestamp)
    }

    /// Sum of two consecutive displacements, stamped with the later timestamp.
    pub fn combine(&self, later: &ControlInput) -> ControlInput {
        ControlInput {
            displacement: self.displacement + later.displacement,
            timestamp: self.timestamp.max(later.timestamp),
        }
    }
}

/// Output of one filter cycle. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEstimate {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    pub timestamp: f64,
    /// Effective sample size of the particle set this estimate was reduced from.
    pub ess: f64,
    pub state: TrackingState,
}

impl StateEstimate {
    /// 1-sigma uncertainty along each axis.
    pub fn stddev(&self) -> Vector3<f64> {
        self.covariance.diagonal().map(|v| v.max(0.0).sqrt())
    }

    /// Planar distance to a reference position.
    pub fn planar_error(&self, truth: &Vector3<f64>) -> f64 {
        let d = self.position - truth;
        (d.x * d.x + d.y * d.y).sqrt()
    }
}

impl Display for StateEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sd = self.stddev();
        write!(
            f,
            "t={:.3} [{}] ({:.4}, {:.4}, {:.4}) ± ({:.4}, {:.4}, {:.4}) ess={:.1}",
            self.timestamp,
            self.state,
            self.position.x,
            self.position.y,
            self.position.z,
            sd.x,
            sd.y,
            sd.z,
            self.ess
        )
    }
}

/// Initial uncertainty area over which particles are scattered.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorRegion {
    /// Uniform over the axis-aligned box `center ± half_extent`.
    Uniform {
        center: Vector3<f64>,
        half_extent: Vector3<f64>,
    },
    /// Independent Gaussian per axis, typically seeded from the last known position.
    Gaussian {
        center: Vector3<f64>,
        stddev: Vector3<f64>,
    },
}

impl PriorRegion {
    /// Planar uniform square of side `side` centred on `(x, y)`.
    pub fn square(x: f64, y: f64, side: f64) -> Self {
        PriorRegion::Uniform {
            center: Vector3::new(x, y, 0.0),
            half_extent: Vector3::new(side / 2.0, side / 2.0, 0.0),
        }
    }

    pub fn center(&self) -> Vector3<f64> {
        match self {
            PriorRegion::Uniform { center, .. } | PriorRegion::Gaussian { center, .. } => *center,
        }
    }

    /// Analytic covariance of the region (diagonal).
    pub fn covariance(&self) -> Matrix3<f64> {
        match self {
            PriorRegion::Uniform { half_extent, .. } => {
                Matrix3::from_diagonal(&half_extent.map(|h| h * h / 3.0))
            }
            PriorRegion::Gaussian { stddev, .. } => Matrix3::from_diagonal(&stddev.map(|s| s * s)),
        }
    }

    /// Same shape, moved to `center`.
    pub fn recentered(&self, center: Vector3<f64>) -> Self {
        match *self {
            PriorRegion::Uniform { half_extent, .. } => PriorRegion::Uniform {
                center,
                half_extent,
            },
            PriorRegion::Gaussian { stddev, .. } => PriorRegion::Gaussian { center, stddev },
        }
    }

    /// Same centre, spread scaled by `factor`.
    pub fn expanded(&self, factor: f64) -> Self {
        match *self {
            PriorRegion::Uniform {
                center,
                half_extent,
            } => PriorRegion::Uniform {
                center,
                half_extent: half_extent * factor,
            },
            PriorRegion::Gaussian { center, stddev } => PriorRegion::Gaussian {
                center,
                stddev: stddev * factor,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (center, spread) = match self {
            PriorRegion::Uniform {
                center,
                half_extent,
            } => (center, half_extent),
            PriorRegion::Gaussian { center, stddev } => (center, stddev),
        };
        if center.iter().chain(spread.iter()).any(|v| !v.is_finite()) {
            return Err(LocalizationError::Config(
                "prior region must be finite".to_string(),
            ));
        }
        if spread.iter().any(|v| *v < 0.0) {
            return Err(LocalizationError::Config(
                "prior region spread must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Draw one state from the region, restricted to `axes`.
    pub fn sample<R: Rng>(&self, axes: Axes, rng: &mut R) -> Vector3<f64> {
        let offset = match self {
            PriorRegion::Uniform { half_extent, .. } => {
                half_extent.map(|h| (rng.random::<f64>() * 2.0 - 1.0) * h)
            }
            PriorRegion::Gaussian { stddev, .. } => stddev.map(|s| {
                let z: f64 = rng.sample(StandardNormal);
                z * s
            }),
        };
        axes.mask(self.center() + offset)
    }
}
