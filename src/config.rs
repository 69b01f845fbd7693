//! Engine configuration: documented defaults, optional TOML file, `DEALSCOPE_*`
//! environment overrides, validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::alerts::AlertOptions;
use crate::analyzers::AnalysisOptions;
use crate::changes::DetectionOptions;
use crate::learning::LearningOptions;
use crate::patterns::ClusterOptions;
use crate::scheduler::SchedulerOptions;
use crate::similarity::SimilarityWeights;
use crate::webhook::WebhookOptions;

pub const ENV_PREFIX: &str = "DEALSCOPE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid TOML in {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("environment variable {var}={value:?} is not a valid {expected}")]
    Env { var: String, value: String, expected: &'static str },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub similarity: SimilarityWeights,
    pub clustering: ClusterOptions,
    pub analysis: AnalysisOptions,
    pub detection: DetectionOptions,
    pub alerts: AlertOptions,
    pub learning: LearningOptions,
    pub scheduler: SchedulerOptions,
    pub webhook: WebhookOptions,
    /// Where learning state is persisted between runs.
    pub state_path: Option<PathBuf>,
}

fn unit(name: &str, v: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&v) {
        return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")));
    }
    Ok(())
}

fn non_negative(name: &str, v: f64) -> Result<(), ConfigError> {
    if !(v >= 0.0) {
        return Err(ConfigError::Invalid(format!("{name} must be non-negative, got {v}")));
    }
    Ok(())
}

impl EngineConfig {
    /// Defaults, then `path` if given, then environment overrides; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_from(|k| env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let cfg = Self::from_toml(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        debug!(path = %path.display(), "configuration file loaded");
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `DEALSCOPE_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
            expected: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            let var = format!("{ENV_PREFIX}{key}");
            match lookup(&var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::Env { var, value, expected }),
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "SIMILARITY_THRESHOLD", "number")? {
            self.clustering.similarity_threshold = v;
        }
        if let Some(v) = parsed(lookup, "MIN_PATTERN_SIZE", "integer")? {
            self.clustering.min_pattern_size = v;
        }
        if let Some(v) = parsed(lookup, "STAGNATION_DAYS", "number")? {
            self.detection.stagnation_days = v;
        }
        if let Some(v) = parsed(lookup, "MIN_SIGNIFICANCE", "number")? {
            self.detection.min_significance = v;
        }
        if let Some(v) = parsed(lookup, "TRIGGER_THRESHOLD", "number")? {
            self.alerts.trigger_threshold = v;
        }
        if let Some(v) = parsed(lookup, "MAX_ALERTS_PER_DAY", "integer")? {
            self.alerts.max_alerts_per_day = v;
        }
        if let Some(v) = parsed(lookup, "DEBOUNCE_SECS", "integer")? {
            self.scheduler.debounce_secs = v;
        }
        if let Some(v) = parsed(lookup, "RECOMMENDATION_TIMEOUT_SECS", "integer")? {
            self.scheduler.recommendation_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup, "SOURCE_TIMEOUT_SECS", "integer")? {
            self.scheduler.source_timeout_secs = v;
        }
        if let Some(v) = parsed::<String>(lookup, "STATE_PATH", "path")? {
            self.state_path = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, w) in self.similarity.as_array() {
            non_negative(&format!("similarity.{name}"), w)?;
        }
        let total = self.similarity.total();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!("similarity weights must sum to 1, got {total}")));
        }

        unit("clustering.similarity_threshold", self.clustering.similarity_threshold)?;
        if self.clustering.min_pattern_size < 1 {
            return Err(ConfigError::Invalid("clustering.min_pattern_size must be at least 1".into()));
        }

        let a = &self.analysis;
        if !(a.stage_delay_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "analysis.stage_delay_multiplier must be at least 1, got {}",
                a.stage_delay_multiplier
            )));
        }
        unit("analysis.conversion_drop", a.conversion_drop)?;
        unit("analysis.success_factor_floor", a.success_factor_floor)?;
        non_negative("analysis.activity_gap_days", a.activity_gap_days)?;
        if !(a.benchmark_cycle_days > 0.0) {
            return Err(ConfigError::Invalid("analysis.benchmark_cycle_days must be positive".into()));
        }

        let d = &self.detection;
        non_negative("detection.stagnation_days", d.stagnation_days)?;
        non_negative("detection.health_delta", d.health_delta)?;
        unit("detection.min_significance", d.min_significance)?;
        let s = &d.significance;
        for (name, v) in [
            ("stage", s.stage),
            ("value", s.value),
            ("probability", s.probability),
            ("created", s.created),
            ("stagnant", s.stagnant),
            ("health_shift", s.health_shift),
        ] {
            unit(&format!("detection.significance.{name}"), v)?;
        }

        unit("alerts.trigger_threshold", self.alerts.trigger_threshold)?;
        if !(0.0..=100.0).contains(&self.alerts.critical_health) {
            return Err(ConfigError::Invalid("alerts.critical_health must be within [0, 100]".into()));
        }
        if self.alerts.max_history < self.alerts.max_alerts_per_day {
            return Err(ConfigError::Invalid("alerts.max_history must hold at least one day of alerts".into()));
        }

        if self.learning.saturation_occurrences == 0 || self.learning.outcome_capacity == 0 {
            return Err(ConfigError::Invalid("learning saturation and capacity must be positive".into()));
        }
        if self.scheduler.debounce_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.debounce_secs must be positive".into()));
        }
        if self.scheduler.source_timeout_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.source_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "DEALSCOPE_MAX_ALERTS_PER_DAY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }
}
