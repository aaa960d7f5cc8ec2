//! Filter configuration.
//!
//! A [`FilterConfig`] is a plain serde struct; every field has a default so a partial file only needs
//! to name what it changes. The file format is chosen by extension (`.json`, `.yaml`/`.yml`, `.toml`).
//!
//! ```no_run
//! use locator::FilterConfig;
//!
//! let config = FilterConfig::from_file("locator.toml").unwrap();
//! config.validate().unwrap();
//! ```
use crate::estimate::EstimatorMode;
use crate::features::{Calibration, ExtractorConfig};
use crate::particle::ResamplingStrategy;
use crate::{Axes, LocalizationError, Result};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of particles N.
    pub particle_count: usize,
    /// Tracked axes. Planar pins z to zero.
    pub axes: Axes,
    /// Per-axis motion noise (physical units per frame).
    pub process_noise_stddev: f64,
    /// Image-derived position noise (physical units).
    pub measurement_noise_stddev: f64,
    /// Resample when ESS falls below this fraction of N.
    pub resample_threshold_fraction: f64,
    pub resampling_strategy: ResamplingStrategy,
    /// Consecutive degenerate frames tolerated before the state turns degenerate.
    pub degenerate_frame_limit: u32,
    /// Reinitialization attempts allowed before tracking is declared lost.
    pub degenerate_retry_budget: u32,
    /// Growth factor of the prior spread per reinitialization attempt.
    pub reinit_expansion: f64,
    pub frame_queue_capacity: usize,
    pub extraction_time_budget_ms: u64,
    pub estimator_mode: EstimatorMode,
    /// Outlier gate in effective standard deviations. `None` disables gating.
    pub gate_sigma: Option<f64>,
    /// Seed of the engine's random number generator.
    pub seed: u64,
    pub calibration: Calibration,
    pub extractor: ExtractorConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            particle_count: 500,
            axes: Axes::Planar,
            process_noise_stddev: 0.1,
            measurement_noise_stddev: 0.1,
            resample_threshold_fraction: 0.5,
            resampling_strategy: ResamplingStrategy::Systematic,
            degenerate_frame_limit: 3,
            degenerate_retry_budget: 3,
            reinit_expansion: 2.0,
            frame_queue_capacity: 8,
            extraction_time_budget_ms: 50,
            estimator_mode: EstimatorMode::Mean,
            gate_sigma: None,
            seed: 42,
            calibration: Calibration::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

fn config_error(message: impl Into<String>) -> LocalizationError {
    LocalizationError::Config(message.into())
}

fn serialization_error(error: impl std::fmt::Display) -> LocalizationError {
    LocalizationError::Serialization(error.to_string())
}

impl FilterConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.particle_count == 0 {
            return Err(config_error("particle_count must be positive"));
        }
        if !(self.process_noise_stddev >= 0.0 && self.process_noise_stddev.is_finite()) {
            return Err(config_error(
                "process_noise_stddev must be finite and non-negative",
            ));
        }
        if !(self.measurement_noise_stddev >= 0.0 && self.measurement_noise_stddev.is_finite()) {
            return Err(config_error(
                "measurement_noise_stddev must be finite and non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.resample_threshold_fraction) {
            return Err(config_error(
                "resample_threshold_fraction must lie in [0, 1]",
            ));
        }
        if !(self.reinit_expansion >= 1.0 && self.reinit_expansion.is_finite()) {
            return Err(config_error("reinit_expansion must be at least 1"));
        }
        if self.frame_queue_capacity == 0 {
            return Err(config_error("frame_queue_capacity must be positive"));
        }
        if let Some(gate) = self.gate_sigma {
            if !(gate > 0.0 && gate.is_finite()) {
                return Err(config_error("gate_sigma must be positive"));
            }
        }
        self.calibration.validate()?;
        self.extractor.validate()?;
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(serialization_error)
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(serialization_error)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(serialization_error)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(serialization_error)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(serialization_error)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(serialization_error)
    }

    /// Write by file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }

    /// Read by file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> LocalizationError {
    config_error(format!(
        "unsupported configuration file extension: {}",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::TemplateSettings;
    use tempfile::NamedTempFile;

    fn sample_config() -> FilterConfig {
        FilterConfig {
            particle_count: 1200,
            axes: Axes::Volumetric,
            process_noise_stddev: 0.25,
            resampling_strategy: ResamplingStrategy::Residual,
            estimator_mode: EstimatorMode::MaxWeight,
            gate_sigma: Some(6.0),
            seed: 7,
            extractor: ExtractorConfig::Template(TemplateSettings::default()),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = FilterConfig::default();
        assert_eq!(config.particle_count, 500);
        assert_eq!(config.degenerate_frame_limit, 3);
        assert_eq!(config.degenerate_retry_budget, 3);
        assert_eq!(config.frame_queue_capacity, 8);
        assert_eq!(config.seed, 42);
        assert!(config.gate_sigma.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let bad = [
            FilterConfig { particle_count: 0, ..FilterConfig::default() },
            FilterConfig { process_noise_stddev: -0.1, ..FilterConfig::default() },
            FilterConfig { measurement_noise_stddev: f64::NAN, ..FilterConfig::default() },
            FilterConfig { resample_threshold_fraction: 1.5, ..FilterConfig::default() },
            FilterConfig { reinit_expansion: 0.5, ..FilterConfig::default() },
            FilterConfig { frame_queue_capacity: 0, ..FilterConfig::default() },
            FilterConfig { gate_sigma: Some(0.0), ..FilterConfig::default() },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(LocalizationError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn json_roundtrip() {
        let config = sample_config();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        config.to_file(&path).unwrap();
        assert_eq!(FilterConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn yaml_roundtrip() {
        let config = sample_config();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yml");
        config.to_file(&path).unwrap();
        assert_eq!(FilterConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn toml_roundtrip() {
        let config = sample_config();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        config.to_file(&path).unwrap();
        assert_eq!(FilterConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        std::fs::write(&path, "particle_count = 64\nseed = 3\n").unwrap();
        let config = FilterConfig::from_file(&path).unwrap();
        assert_eq!(config.particle_count, 64);
        assert_eq!(config.seed, 3);
        assert_eq!(config.process_noise_stddev, 0.1);
        assert_eq!(config.extractor, ExtractorConfig::default());
    }

    #[test]
    fn unsupported_extension_error() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("txt");
        assert!(matches!(
            FilterConfig::default().to_file(&path),
            Err(LocalizationError::Config(_))
        ));
        assert!(FilterConfig::from_file(&path).is_err());
    }
}
