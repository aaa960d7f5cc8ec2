//! The filter engine: one predict → weight → resample → estimate cycle per frame, wrapped in the
//! tracking state machine.
//!
//! ```text
//! Uninitialized --initialize--> Tracking --(> frame limit degenerate frames)--> Degenerate
//!                                  ^                                                |
//!                                  +------------- reinitialize (next step) ---------+
//!                                                                                   |
//!                                  Lost <------ retry budget exhausted -------------+
//! ```
//!
//! `Lost` is terminal for the session: every further `step` returns [`LocalizationError::Lost`] without
//! consuming the frame until [`FilterEngine::reset`]. [`FilterEngine::stop`] returns any state to
//! `Uninitialized`.
use crate::estimate::PropagatedPrior;
use crate::features::{Deadline, FeatureExtractor, Frame};
use crate::measurement::{MeasurementModel, WeightingOutcome};
use crate::motion::MotionModel;
use crate::particle::ParticleSet;
use crate::{
    ControlInput, Diagnostic, FilterConfig, LocalizationError, Observation, PriorRegion, Result,
    StateEstimate, TrackingState,
};

use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Everything one cycle produced.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub estimate: StateEstimate,
    /// Effective sample size right after weighting, before any resampling.
    pub ess: f64,
    pub resampled: bool,
    /// Observations fused this cycle (zero for prediction-only cycles).
    pub observation_count: usize,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct FilterEngine {
    config: FilterConfig,
    extractor: Box<dyn FeatureExtractor>,
    motion: MotionModel,
    measurement: MeasurementModel,
    rng: StdRng,
    state: TrackingState,
    particles: Option<ParticleSet>,
    particle_count: usize,
    /// Prior passed to `initialize`; reinitialization reuses its shape.
    prior: Option<PriorRegion>,
    /// Analytic estimate used until an observation has been fused.
    propagated: Option<PropagatedPrior>,
    last_good: Vector3<f64>,
    consecutive_degenerate: u32,
    reinit_attempts: u32,
    /// Control of a skipped frame, applied with the next prediction.
    carried_control: Option<ControlInput>,
    last_estimate: Option<StateEstimate>,
}

impl std::fmt::Debug for FilterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterEngine")
            .field("state", &self.state)
            .field("particle_count", &self.particle_count)
            .field("consecutive_degenerate", &self.consecutive_degenerate)
            .field("reinit_attempts", &self.reinit_attempts)
            .finish_non_exhaustive()
    }
}

impl FilterEngine {
    /// Build an engine with the extractor named in `config`.
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let extractor = config.extractor.build(config.calibration)?;
        Self::with_extractor(config, extractor)
    }

    /// Build an engine around a caller-supplied extractor.
    pub fn with_extractor(config: FilterConfig, extractor: Box<dyn FeatureExtractor>) -> Result<Self> {
        config.validate()?;
        Ok(FilterEngine {
            motion: MotionModel::new(config.process_noise_stddev),
            measurement: MeasurementModel::new(config.measurement_noise_stddev, config.gate_sigma),
            rng: StdRng::seed_from_u64(config.seed),
            extractor,
            state: TrackingState::Uninitialized,
            particles: None,
            particle_count: config.particle_count,
            prior: None,
            propagated: None,
            last_good: Vector3::zeros(),
            consecutive_degenerate: 0,
            reinit_attempts: 0,
            carried_control: None,
            last_estimate: None,
            config,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn particles(&self) -> Option<&ParticleSet> {
        self.particles.as_ref()
    }

    pub fn last_estimate(&self) -> Option<&StateEstimate> {
        self.last_estimate.as_ref()
    }

    pub fn reinit_attempts(&self) -> u32 {
        self.reinit_attempts
    }

    pub fn consecutive_degenerate(&self) -> u32 {
        self.consecutive_degenerate
    }

    /// Scatter `particle_count` particles over `prior` and start tracking.
    pub fn initialize(&mut self, prior: PriorRegion, particle_count: usize) -> Result<()> {
        let axes = self.config.axes;
        let set = ParticleSet::scatter(&prior, particle_count, axes, &mut self.rng)?;
        self.particles = Some(set);
        self.particle_count = particle_count;
        self.prior = Some(prior);
        self.propagated = Some(PropagatedPrior::new(prior, axes));
        self.last_good = axes.mask(prior.center());
        self.consecutive_degenerate = 0;
        self.reinit_attempts = 0;
        self.carried_control = None;
        self.last_estimate = None;
        self.state = TrackingState::Tracking;
        log::info!(
            "filter initialized with {particle_count} particles around ({:.4}, {:.4}, {:.4})",
            prior.center().x,
            prior.center().y,
            prior.center().z
        );
        Ok(())
    }

    /// Start over after `Lost` (or at any time). Same as a fresh [`FilterEngine::initialize`].
    pub fn reset(&mut self, prior: PriorRegion, particle_count: usize) -> Result<()> {
        self.initialize(prior, particle_count)
    }

    /// Discard the particle set and return to `Uninitialized`.
    pub fn stop(&mut self) {
        self.particles = None;
        self.prior = None;
        self.propagated = None;
        self.carried_control = None;
        self.consecutive_degenerate = 0;
        self.reinit_attempts = 0;
        self.state = TrackingState::Uninitialized;
        log::info!("filter stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            TrackingState::Uninitialized => Err(LocalizationError::NotInitialized),
            TrackingState::Lost => Err(LocalizationError::Lost {
                attempts: self.reinit_attempts,
            }),
            TrackingState::Tracking | TrackingState::Degenerate => Ok(()),
        }
    }

    /// Merge a control carried over from a skipped frame.
    fn take_control(&mut self, control: ControlInput) -> ControlInput {
        match self.carried_control.take() {
            Some(carried) => carried.combine(&control),
            None => control,
        }
    }

    /// Run one cycle on a raw frame.
    ///
    /// A malformed frame skips the cycle, keeps the state and returns
    /// [`LocalizationError::InvalidFrame`]; its control is applied with the next frame's prediction.
    pub fn step(&mut self, frame: &Frame, control: ControlInput) -> Result<CycleReport> {
        self.ensure_running()?;
        let control = self.take_control(control);
        let image = match frame.to_gray() {
            Ok(image) => image,
            Err(e) => {
                self.carried_control = Some(control);
                if let Some(diagnostic) = Diagnostic::from_error(&e, frame.timestamp) {
                    diagnostic.log();
                }
                return Err(e);
            }
        };

        let mut diagnostics = Vec::new();
        let deadline = Deadline::from_millis(self.config.extraction_time_budget_ms);
        let mut observations = Vec::new();
        for item in self.extractor.extract(&image, frame.timestamp, deadline) {
            match item {
                Ok(observation) => observations.push(observation),
                Err(e) => {
                    // A partial frame is not trusted.
                    observations.clear();
                    if let Some(diagnostic) = Diagnostic::from_error(&e, frame.timestamp) {
                        diagnostic.log();
                        diagnostics.push(diagnostic);
                    }
                    break;
                }
            }
        }
        self.cycle(&observations, control, frame.timestamp, diagnostics)
    }

    /// Run one cycle with observations extracted elsewhere.
    pub fn step_observations(
        &mut self,
        observations: &[Observation],
        control: ControlInput,
        timestamp: f64,
    ) -> Result<CycleReport> {
        self.ensure_running()?;
        let control = self.take_control(control);
        self.cycle(observations, control, timestamp, Vec::new())
    }

    fn reinitialize(&mut self, timestamp: f64) -> Result<Diagnostic> {
        let base = self.prior.ok_or(LocalizationError::NotInitialized)?;
        self.reinit_attempts += 1;
        let factor = self.config.reinit_expansion.powi(self.reinit_attempts as i32);
        let prior = base.recentered(self.last_good).expanded(factor);
        let axes = self.config.axes;
        self.particles = Some(ParticleSet::scatter(
            &prior,
            self.particle_count,
            axes,
            &mut self.rng,
        )?);
        self.propagated = Some(PropagatedPrior::new(prior, axes));
        self.consecutive_degenerate = 0;
        self.state = TrackingState::Tracking;
        Ok(Diagnostic::Reinitialized {
            timestamp,
            attempt: self.reinit_attempts,
            center: self.last_good,
        })
    }

    fn cycle(
        &mut self,
        observations: &[Observation],
        control: ControlInput,
        timestamp: f64,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<CycleReport> {
        if self.state == TrackingState::Degenerate {
            let diagnostic = self.reinitialize(timestamp)?;
            diagnostic.log();
            diagnostics.push(diagnostic);
        }

        let mut set = self.particles.take().ok_or(LocalizationError::NotInitialized)?;

        self.motion.predict(&mut set, &control, &mut self.rng);
        if let Some(propagated) = self.propagated.as_mut() {
            propagated.advance(&control.displacement, self.motion.step_variance());
        }

        let informative: Vec<Observation> = observations
            .iter()
            .filter(|obs| self.measurement.is_informative(obs))
            .copied()
            .collect();
        let discarded = observations.len() - informative.len();
        if discarded > 0 {
            let diagnostic = Diagnostic::UninformativeObservations {
                timestamp,
                discarded,
            };
            diagnostic.log();
            diagnostics.push(diagnostic);
        }

        let outcome = self.measurement.update(&mut set, &informative);
        let ess = set.effective_sample_size();
        let mut resampled = false;
        let mut fused = 0;
        match outcome {
            WeightingOutcome::Updated { .. } => {
                fused = informative.len();
                self.consecutive_degenerate = 0;
                self.reinit_attempts = 0;
                resampled = set.resample_if_needed(
                    self.config.resampling_strategy,
                    self.config.resample_threshold_fraction,
                    &mut self.rng,
                );
                if resampled {
                    let diagnostic = Diagnostic::Resampled { timestamp, ess };
                    diagnostic.log();
                    diagnostics.push(diagnostic);
                }
            }
            WeightingOutcome::NoObservations => {}
            WeightingOutcome::Degenerate => {
                self.consecutive_degenerate += 1;
                let diagnostic = Diagnostic::Degenerate {
                    timestamp,
                    consecutive: self.consecutive_degenerate,
                };
                diagnostic.log();
                diagnostics.push(diagnostic);
                if self.consecutive_degenerate > self.config.degenerate_frame_limit {
                    if self.reinit_attempts >= self.config.degenerate_retry_budget {
                        self.state = TrackingState::Lost;
                        let diagnostic = Diagnostic::Lost {
                            timestamp,
                            attempts: self.reinit_attempts,
                        };
                        diagnostic.log();
                        diagnostics.push(diagnostic);
                    } else {
                        self.state = TrackingState::Degenerate;
                    }
                }
            }
        }

        let (position, covariance) = if set.has_observations() {
            self.config.estimator_mode.estimate(&set)
        } else {
            match &self.propagated {
                Some(propagated) => (propagated.mean(), propagated.covariance()),
                None => self.config.estimator_mode.estimate(&set),
            }
        };
        let estimate = StateEstimate {
            position,
            covariance,
            timestamp,
            ess: set.effective_sample_size(),
            state: self.state,
        };
        // Without a fix the last good position follows the stage.
        if fused > 0 {
            self.last_good = position;
        } else {
            self.last_good += self.config.axes.mask(control.displacement);
        }
        self.particles = Some(set);
        self.last_estimate = Some(estimate.clone());

        log::debug!(
            "cycle t={timestamp:.3}: {fused} observation(s), ess={ess:.1}, resampled={resampled}, {estimate}"
        );
        Ok(CycleReport {
            estimate,
            ess,
            resampled,
            observation_count: fused,
            diagnostics,
        })
    }
}
