// THEORY:
// The `EjectionPlanner` converts a finished object into an actuation plan:
// which valves to open, how long to wait before opening them, and for how long.
//
// 1.  **Spatial mapping**: the object's pixel centroid is projected onto the
//     valve bar. With a configured field of view the projection goes through
//     physical units (pixel -> position -> nearest valve); otherwise pixels are
//     binned linearly. Mechanically mirrored installations flip the result,
//     and a symmetric margin widens one valve into a small block.
// 2.  **Temporal mapping**: by the time a blob closes, the conveyor has already
//     carried its centroid some lines past the sensor. That lag is converted to
//     milliseconds and subtracted from the base delay, together with a
//     position-dependent correction taken from a threshold table. The result
//     is clamped at zero: a late object is fired immediately, never "in the past".
//
// The planner is stateless between objects and never talks to hardware; it
// returns commands and leaves delivery to the caller.

use crate::core_modules::active_blob::ClosedBlob;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Extra delay applied to objects whose centroid line is at or beyond `threshold_y`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YCorrectionRule {
    pub threshold_y: f64,
    pub correction_ms: f64,
}

/// Geometry and timing of the valve bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EjectionConfig {
    /// Pixels per scan line.
    pub sensor_width: usize,
    /// Valves on the bar, numbered from 1.
    pub channel_count: u16,
    /// Physical width spanned by the pixel row, in valve-spacing units.
    pub fov: Option<f64>,
    /// Valve numbering runs opposite to pixel order.
    pub reverse_channels: bool,
    /// Valves added on each side of the centre valve.
    pub channel_margin: u16,
    /// Nominal delay from sensor line to valve bar.
    pub base_delay_ms: f64,
    /// Pulse width.
    pub duration_ms: f64,
    /// Scan line rate.
    pub fps: f64,
    pub y_corrections: Vec<YCorrectionRule>,
    /// When set, only these classes are ejected.
    pub target_classes: Option<Vec<i32>>,
}

impl Default for EjectionConfig {
    fn default() -> Self {
        Self {
            sensor_width: 1024,
            channel_count: 32,
            fov: None,
            reverse_channels: false,
            channel_margin: 0,
            base_delay_ms: 100.0,
            duration_ms: 20.0,
            fps: 500.0,
            y_corrections: Vec::new(),
            target_classes: None,
        }
    }
}

impl EjectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor_width == 0 {
            return Err(ConfigError::Validation("sensor_width must be at least 1".to_string()));
        }
        if self.channel_count == 0 {
            return Err(ConfigError::Validation("channel_count must be at least 1".to_string()));
        }
        if !(self.fps > 0.0) {
            return Err(ConfigError::Validation(format!("fps must be positive, got {}", self.fps)));
        }
        if self.fov.is_some_and(|fov| !(fov > 0.0)) {
            return Err(ConfigError::Validation("fov must be positive when set".to_string()));
        }
        if self.duration_ms < 0.0 || self.base_delay_ms < 0.0 {
            return Err(ConfigError::Validation("delays and durations must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Planned from a tracked object.
    Tracker,
    /// Issued by an operator or a test harness.
    Manual,
}

/// A planned valve pulse.
#[derive(Debug, Clone, PartialEq)]
pub struct EjectionCommand {
    pub blob_id: u64,
    pub class_id: i32,
    /// Valve under the object's centroid.
    pub center_channel: u16,
    /// Every valve to open, ascending, including the centre.
    pub channels: Vec<u16>,
    pub delay: Duration,
    pub duration: Duration,
    pub timestamp: Instant,
    pub provenance: Provenance,
}

/// Inclusive block of valves around `center`, clipped to `1..=max_channel`.
pub fn channel_range(center: u16, margin: u16, max_channel: u16) -> Vec<u16> {
    let low = center.saturating_sub(margin).max(1);
    let high = center.saturating_add(margin).min(max_channel);
    (low..=high).collect()
}

/// Converts fractional milliseconds to a microsecond-resolution duration.
pub fn millis(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

/// Plans valve pulses for closed blobs.
#[derive(Debug, Clone)]
pub struct EjectionPlanner {
    config: EjectionConfig,
}

impl EjectionPlanner {
    pub fn new(mut config: EjectionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config
            .y_corrections
            .sort_by(|a, b| a.threshold_y.total_cmp(&b.threshold_y));
        Ok(Self { config })
    }

    pub fn config(&self) -> &EjectionConfig {
        &self.config
    }

    /// Plans a command for `blob`, or `None` if it is not to be ejected.
    pub fn process(&self, blob: &ClosedBlob) -> Option<EjectionCommand> {
        if blob.class_id < 0 {
            return None;
        }
        if let Some(targets) = &self.config.target_classes {
            if !targets.contains(&blob.class_id) {
                return None;
            }
        }

        let center_channel = self.map_channel(blob.center_x);
        let channels = channel_range(center_channel, self.config.channel_margin, self.config.channel_count);
        let delay_ms = self.delay_ms(blob);

        debug!(
            blob = blob.id,
            class = blob.class_id,
            channel = center_channel,
            delay_ms,
            "ejection planned"
        );
        Some(EjectionCommand {
            blob_id: blob.id,
            class_id: blob.class_id,
            center_channel,
            channels,
            delay: millis(delay_ms),
            duration: millis(self.config.duration_ms),
            timestamp: Instant::now(),
            provenance: Provenance::Tracker,
        })
    }

    /// Projects a pixel x-coordinate onto a valve number in `1..=channel_count`.
    pub fn map_channel(&self, center_x: f64) -> u16 {
        let width = self.config.sensor_width as f64;
        let count = self.config.channel_count as f64;

        let raw = match self.config.fov {
            Some(fov) => ((center_x / width * fov) / (fov / count)).round(),
            None => (center_x / (width / count)).floor(),
        };
        let channel = raw.clamp(1.0, count) as u16;

        if self.config.reverse_channels {
            self.config.channel_count - channel + 1
        } else {
            channel
        }
    }

    /// Delay after which the valves should open, in milliseconds.
    pub fn delay_ms(&self, blob: &ClosedBlob) -> f64 {
        let ms_per_line = 1000.0 / self.config.fps;
        let lines_since_centroid = blob.end_line as f64 - blob.center_y;
        let elapsed = lines_since_centroid * ms_per_line;
        (self.config.base_delay_ms + self.y_correction_ms(blob.center_y) - elapsed).max(0.0)
    }

    /// Correction of the highest rule whose threshold is at or below `center_y`.
    pub fn y_correction_ms(&self, center_y: f64) -> f64 {
        self.config
            .y_corrections
            .iter()
            .rev()
            .find(|rule| rule.threshold_y <= center_y)
            .map_or(0.0, |rule| rule.correction_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(class_id: i32, center_x: f64, center_y: f64, end_line: u64) -> ClosedBlob {
        ClosedBlob {
            id: 1,
            class_id,
            start_x: 0,
            end_x: 0,
            start_line: 0,
            end_line,
            center_x,
            center_y,
            total_pixels: 100,
            votes: Vec::new(),
        }
    }

    #[test]
    fn margin_widens_and_clips() {
        assert_eq!(channel_range(16, 2, 32), vec![14, 15, 16, 17, 18]);
        assert_eq!(channel_range(1, 3, 32), vec![1, 2, 3, 4]);
        assert_eq!(channel_range(32, 1, 32), vec![31, 32]);
        assert_eq!(channel_range(5, 0, 32), vec![5]);
    }

    #[test]
    fn fov_mapping_rounds_to_nearest_valve() {
        let planner = EjectionPlanner::new(EjectionConfig {
            sensor_width: 1024,
            channel_count: 32,
            fov: Some(100.0),
            ..EjectionConfig::default()
        })
        .unwrap();
        assert_eq!(planner.map_channel(512.0), 16);
        assert_eq!(planner.map_channel(1023.0), 32);
        assert_eq!(planner.map_channel(0.0), 1);
    }

    #[test]
    fn linear_mapping_bins_pixels() {
        let planner = EjectionPlanner::new(EjectionConfig {
            sensor_width: 1024,
            channel_count: 32,
            ..EjectionConfig::default()
        })
        .unwrap();
        assert_eq!(planner.map_channel(512.0), 16);
        assert_eq!(planner.map_channel(100.0), 3);
    }

    #[test]
    fn reversed_installation_flips_channels() {
        let planner = EjectionPlanner::new(EjectionConfig {
            reverse_channels: true,
            ..EjectionConfig::default()
        })
        .unwrap();
        assert_eq!(planner.map_channel(100.0), 32 - 3 + 1);
        assert_eq!(planner.map_channel(1023.0), 2);
    }

    #[test]
    fn delay_compensates_for_centroid_lag() {
        let planner = EjectionPlanner::new(EjectionConfig {
            base_delay_ms: 100.0,
            fps: 500.0,
            ..EjectionConfig::default()
        })
        .unwrap();
        // 10 lines at 2 ms per line have already passed.
        assert!((planner.delay_ms(&blob(0, 10.0, 90.0, 100)) - 80.0).abs() < 1e-9);
        // Lag larger than the base delay clamps to zero.
        assert_eq!(planner.delay_ms(&blob(0, 10.0, 0.0, 100)), 0.0);
    }

    #[test]
    fn highest_matching_correction_rule_applies() {
        let planner = EjectionPlanner::new(EjectionConfig {
            y_corrections: vec![
                YCorrectionRule { threshold_y: 500.0, correction_ms: 7.0 },
                YCorrectionRule { threshold_y: 0.0, correction_ms: 1.0 },
                YCorrectionRule { threshold_y: 100.0, correction_ms: 3.0 },
            ],
            ..EjectionConfig::default()
        })
        .unwrap();
        assert_eq!(planner.y_correction_ms(50.0), 1.0);
        assert_eq!(planner.y_correction_ms(100.0), 3.0);
        assert_eq!(planner.y_correction_ms(10_000.0), 7.0);
        assert_eq!(planner.y_correction_ms(-1.0), 0.0);
    }

    #[test]
    fn process_respects_no_decision_and_allow_list() {
        let planner = EjectionPlanner::new(EjectionConfig {
            channel_margin: 1,
            target_classes: Some(vec![2]),
            ..EjectionConfig::default()
        })
        .unwrap();
        assert!(planner.process(&blob(-1, 512.0, 5.0, 5)).is_none());
        assert!(planner.process(&blob(1, 512.0, 5.0, 5)).is_none());

        let command = planner.process(&blob(2, 512.0, 5.0, 5)).unwrap();
        assert_eq!(command.center_channel, 16);
        assert_eq!(command.channels, vec![15, 16, 17]);
        assert_eq!(command.duration, Duration::from_millis(20));
        assert_eq!(command.provenance, Provenance::Tracker);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert!(EjectionPlanner::new(EjectionConfig {
            channel_count: 0,
            ..EjectionConfig::default()
        })
        .is_err());
        assert!(EjectionPlanner::new(EjectionConfig {
            fps: 0.0,
            ..EjectionConfig::default()
        })
        .is_err());
    }
}
