//! Error and diagnostic types.
//!
//! [`LocalizationError`] is returned from fallible operations. [`Diagnostic`] is the non-fatal
//! counterpart: every condition the engine tolerates (bad frame, extraction timeout, a collapsed
//! weighting, a dropped frame) is still reported to the caller as a diagnostic and written to the log,
//! so nothing is swallowed silently. Only [`LocalizationError::Lost`] ends a tracking session, and only
//! until the engine is reset.

use nalgebra::Vector3;
use std::fmt::{self, Display};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizationError {
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("feature extraction exceeded its {budget_ms} ms budget")]
    ExtractionTimeout { budget_ms: u64 },

    #[error("tracking lost after {attempts} reinitialization attempt(s); reset required")]
    Lost { attempts: u32 },

    #[error("filter engine is not initialized")]
    NotInitialized,

    #[error("engine worker is not running")]
    WorkerStopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LocalizationError {
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        LocalizationError::InvalidFrame {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = LocalizationError> = std::result::Result<T, E>;

/// Non-fatal condition surfaced by the engine or its runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// Frame geometry was malformed; the cycle was skipped.
    InvalidFrame { timestamp: f64, reason: String },
    /// Feature extraction ran out of time; the cycle ran prediction-only.
    ExtractionTimeout { timestamp: f64, budget_ms: u64 },
    /// Weighting collapsed (all weights zero or non-finite) on this frame.
    Degenerate { timestamp: f64, consecutive: u32 },
    /// Observations with zero, negative or non-finite confidence or uncertainty were discarded
    /// before weighting.
    UninformativeObservations { timestamp: f64, discarded: usize },
    /// Effective sample size fell below threshold and the set was resampled.
    Resampled { timestamp: f64, ess: f64 },
    /// Particles were rescattered after sustained degeneracy.
    Reinitialized {
        timestamp: f64,
        attempt: u32,
        center: Vector3<f64>,
    },
    /// Retry budget exhausted.
    Lost { timestamp: f64, attempts: u32 },
    /// Queue backpressure discarded the oldest undelivered frame.
    FrameDropped { timestamp: f64, dropped_total: u64 },
}

impl Diagnostic {
    pub fn timestamp(&self) -> f64 {
        match self {
            Diagnostic::InvalidFrame { timestamp, .. }
            | Diagnostic::ExtractionTimeout { timestamp, .. }
            | Diagnostic::Degenerate { timestamp, .. }
            | Diagnostic::UninformativeObservations { timestamp, .. }
            | Diagnostic::Resampled { timestamp, .. }
            | Diagnostic::Reinitialized { timestamp, .. }
            | Diagnostic::Lost { timestamp, .. }
            | Diagnostic::FrameDropped { timestamp, .. } => *timestamp,
        }
    }

    /// Emit this diagnostic through the `log` facade at a level matching its severity.
    pub fn log(&self) {
        match self {
            Diagnostic::Resampled { .. } => log::debug!("{self}"),
            Diagnostic::Reinitialized { .. } => log::info!("{self}"),
            Diagnostic::Lost { .. } => log::error!("{self}"),
            _ => log::warn!("{self}"),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::InvalidFrame { timestamp, reason } => {
                write!(f, "t={timestamp:.3}: invalid frame skipped ({reason})")
            }
            Diagnostic::ExtractionTimeout {
                timestamp,
                budget_ms,
            } => write!(
                f,
                "t={timestamp:.3}: feature extraction exceeded {budget_ms} ms, prediction-only update"
            ),
            Diagnostic::Degenerate {
                timestamp,
                consecutive,
            } => write!(
                f,
                "t={timestamp:.3}: degenerate weighting ({consecutive} consecutive)"
            ),
            Diagnostic::UninformativeObservations {
                timestamp,
                discarded,
            } => write!(
                f,
                "t={timestamp:.3}: {discarded} observation(s) without usable confidence discarded"
            ),
            Diagnostic::Resampled { timestamp, ess } => {
                write!(f, "t={timestamp:.3}: resampled at ess={ess:.1}")
            }
            Diagnostic::Reinitialized {
                timestamp,
                attempt,
                center,
            } => write!(
                f,
                "t={timestamp:.3}: reinitialization #{attempt} around ({:.4}, {:.4}, {:.4})",
                center.x, center.y, center.z
            ),
            Diagnostic::Lost {
                timestamp,
                attempts,
            } => write!(
                f,
                "t={timestamp:.3}: tracking lost after {attempts} reinitialization attempt(s)"
            ),
            Diagnostic::FrameDropped {
                timestamp,
                dropped_total,
            } => write!(
                f,
                "t={timestamp:.3}: frame queue full, dropped oldest frame ({dropped_total} total)"
            ),
        }
    }
}

impl Diagnostic {
    /// Diagnostic counterpart of a cycle error, if the error is one the engine reports rather than
    /// one that indicates misuse.
    pub fn from_error(error: &LocalizationError, timestamp: f64) -> Option<Diagnostic> {
        match error {
            LocalizationError::InvalidFrame { reason } => Some(Diagnostic::InvalidFrame {
                timestamp,
                reason: reason.clone(),
            }),
            LocalizationError::ExtractionTimeout { budget_ms } => {
                Some(Diagnostic::ExtractionTimeout {
                    timestamp,
                    budget_ms: *budget_ms,
                })
            }
            LocalizationError::Lost { attempts } => Some(Diagnostic::Lost {
                timestamp,
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}
