// THEORY:
// The `FeatureExtractor` reduces a full raw spectrum to the handful of values a
// trained model actually looks at. Each feature pairs a selected "target" band
// with a partner band a fixed `gap` away:
//
// - raw-gap:  feature[i] = raw[t_i] - raw[t_i + gap]        (partner clamped to the last band)
// - log-gap:  feature[i] = log10((raw[t_i - gap] + eps) / (raw[t_i] + eps))   (partner clamped to 0)
//
// Partner indices are resolved once, when the extractor is configured, so the
// per-pixel path is a tight loop of indexed loads with no bounds arithmetic.

use crate::core_modules::spectrum::{Feature, Reflectance};
use crate::error::ConfigError;

/// Offset added to both sides of the absorbance ratio.
pub const ABSORBANCE_EPSILON: f32 = 1e-6;

/// The per-feature formula, fixed when the model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFormula {
    /// Difference of two raw bands.
    RawGap,
    /// Absorbance log-ratio of two raw bands.
    LogGap,
}

/// Maps a raw sample to a feature vector using band offsets bound at configure time.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    raw_band_count: usize,
    gap: usize,
    formula: FeatureFormula,
    /// Selected target band for each feature.
    targets: Vec<usize>,
    /// Partner band for each feature, already clamped into range.
    partners: Vec<usize>,
}

impl FeatureExtractor {
    pub fn new(
        raw_band_count: usize,
        selected_bands: &[usize],
        gap: usize,
        formula: FeatureFormula,
    ) -> Result<Self, ConfigError> {
        let mut extractor = Self {
            raw_band_count: 0,
            gap,
            formula,
            targets: Vec::new(),
            partners: Vec::new(),
        };
        extractor.configure(raw_band_count, selected_bands)?;
        Ok(extractor)
    }

    /// Binds the extractor to a raw band count and a set of target bands.
    /// Every target must address a band the sensor actually delivers.
    pub fn configure(
        &mut self,
        raw_band_count: usize,
        selected_bands: &[usize],
    ) -> Result<(), ConfigError> {
        if raw_band_count == 0 {
            return Err(ConfigError::Validation(
                "raw band count must be at least 1".to_string(),
            ));
        }
        if selected_bands.is_empty() {
            return Err(ConfigError::Validation(
                "at least one band must be selected".to_string(),
            ));
        }
        if let Some(&index) = selected_bands.iter().find(|&&b| b >= raw_band_count) {
            return Err(ConfigError::BandOutOfRange {
                index,
                band_count: raw_band_count,
            });
        }

        let last_band = raw_band_count - 1;
        self.raw_band_count = raw_band_count;
        self.targets = selected_bands.to_vec();
        self.partners = selected_bands
            .iter()
            .map(|&target| match self.formula {
                FeatureFormula::RawGap => (target + self.gap).min(last_band),
                FeatureFormula::LogGap => target.saturating_sub(self.gap),
            })
            .collect();
        Ok(())
    }

    pub fn raw_band_count(&self) -> usize {
        self.raw_band_count
    }

    pub fn feature_count(&self) -> usize {
        self.targets.len()
    }

    pub fn formula(&self) -> FeatureFormula {
        self.formula
    }

    /// Writes one feature per selected band into `features`.
    ///
    /// `raw` must hold `raw_band_count` values and `features` must hold
    /// `feature_count` slots; both are sized once by the owning pipeline.
    #[inline]
    pub fn extract(&self, raw: &[Reflectance], features: &mut [Feature]) {
        debug_assert_eq!(raw.len(), self.raw_band_count);
        debug_assert_eq!(features.len(), self.targets.len());

        let pairs = self.targets.iter().zip(&self.partners);
        match self.formula {
            FeatureFormula::RawGap => {
                for (slot, (&target, &partner)) in features.iter_mut().zip(pairs) {
                    *slot = raw[target] - raw[partner];
                }
            }
            FeatureFormula::LogGap => {
                for (slot, (&target, &partner)) in features.iter_mut().zip(pairs) {
                    *slot = ((raw[partner] + ABSORBANCE_EPSILON)
                        / (raw[target] + ABSORBANCE_EPSILON))
                        .log10();
                }
            }
        }
    }
}
