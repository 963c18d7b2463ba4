// THEORY:
// One TOML file configures the whole machine. Each stage owns its own section
// type (the tracker, planner and scheduler configs live next to the code that
// uses them); `SorterConfig` only gathers them. Loading is three steps:
//
// 1.  **File**: parse TOML. Missing sections and fields fall back to defaults.
// 2.  **Environment**: `SORTER_*` variables override individual fields, so a
//     line rate or delay can be trimmed on the floor without editing the file.
// 3.  **Validation**: every section checks itself once. Nothing downstream
//     re-validates per line.

use crate::core_modules::actuation::ActuationConfig;
use crate::core_modules::classifier::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::core_modules::ejection::EjectionConfig;
use crate::core_modules::tracker::TrackerConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    /// JSON classifier model. Relative paths resolve against the config file.
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.json"),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    pub classifier: ClassifierSection,
    pub tracker: TrackerConfig,
    pub ejection: EjectionConfig,
    pub actuation: ActuationConfig,
}

impl SorterConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.classifier.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Validation(format!(
                "confidence_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if self.classifier.model_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("classifier.model_path is empty".to_string()));
        }
        self.ejection.validate()?;
        self.actuation.validate()
    }
}

/// Loads, overrides and validates a configuration file.
pub fn load_config(path: &Path) -> Result<SorterConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    let content = fs::read_to_string(path)?;
    let mut config = SorterConfig::from_toml_str(&content)?;

    if config.classifier.model_path.is_relative() {
        if let Some(dir) = path.parent() {
            config.classifier.model_path = dir.join(&config.classifier.model_path);
        }
    }

    apply_environment_overrides(&mut config);
    config.validate()?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Applies `SORTER_*` environment variables.
///
/// - `SORTER_MODEL_PATH` -> `classifier.model_path`
/// - `SORTER_CONFIDENCE_THRESHOLD` -> `classifier.confidence_threshold`
/// - `SORTER_MIN_PIXELS` -> `tracker.min_pixels`
/// - `SORTER_LINE_GAP_TOLERANCE` -> `tracker.line_gap_tolerance`
/// - `SORTER_PIXEL_OVERLAP_TOLERANCE` -> `tracker.pixel_overlap_tolerance`
/// - `SORTER_FPS` -> `ejection.fps`
/// - `SORTER_BASE_DELAY_MS` -> `ejection.base_delay_ms`
/// - `SORTER_DURATION_MS` -> `ejection.duration_ms`
/// - `SORTER_CHANNEL_MARGIN` -> `ejection.channel_margin`
/// - `SORTER_REVERSE_CHANNELS` -> `ejection.reverse_channels`
/// - `SORTER_CYCLE_HZ` -> `actuation.cycle_hz`
pub fn apply_environment_overrides(config: &mut SorterConfig) {
    apply_overrides(config, |key| env::var(key).ok());
}

/// Same as `apply_environment_overrides`, reading from `lookup`.
/// Values that fail to parse are ignored.
pub fn apply_overrides(config: &mut SorterConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let value = lookup(key)?;
        match value.trim().parse() {
            Ok(parsed) => {
                debug!(key, value = %value, "environment override");
                Some(parsed)
            }
            Err(_) => None,
        }
    }

    if let Some(value) = lookup("SORTER_MODEL_PATH") {
        config.classifier.model_path = PathBuf::from(value);
    }
    if let Some(value) = parsed(&lookup, "SORTER_CONFIDENCE_THRESHOLD") {
        config.classifier.confidence_threshold = value;
    }

    if let Some(value) = parsed(&lookup, "SORTER_MIN_PIXELS") {
        config.tracker.min_pixels = value;
    }
    if let Some(value) = parsed(&lookup, "SORTER_LINE_GAP_TOLERANCE") {
        config.tracker.line_gap_tolerance = value;
    }
    if let Some(value) = parsed(&lookup, "SORTER_PIXEL_OVERLAP_TOLERANCE") {
        config.tracker.pixel_overlap_tolerance = value;
    }

    if let Some(value) = parsed(&lookup, "SORTER_FPS") {
        config.ejection.fps = value;
    }
    if let Some(value) = parsed(&lookup, "SORTER_BASE_DELAY_MS") {
        config.ejection.base_delay_ms = value;
    }
    if let Some(value) = parsed(&lookup, "SORTER_DURATION_MS") {
        config.ejection.duration_ms = value;
    }
    if let Some(value) = parsed(&lookup, "SORTER_CHANNEL_MARGIN") {
        config.ejection.channel_margin = value;
    }
    if let Some(value) = lookup("SORTER_REVERSE_CHANNELS") {
        let value = value.to_lowercase();
        config.ejection.reverse_channels = value == "true" || value == "1" || value == "yes";
    }

    if let Some(value) = parsed(&lookup, "SORTER_CYCLE_HZ") {
        config.actuation.cycle_hz = value;
    }
}
