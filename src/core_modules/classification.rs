// THEORY:
// The `ClassificationPipeline` is the per-pixel stage of the perception path.
// It owns one feature extractor and one classifier and drives every pixel of a
// scan line through the same fixed sequence:
//
//   raw sample -> raw preprocessing -> feature extraction -> feature
//   postprocessing -> linear classification -> class index (or background)
//
// It produces a `ClassLabelLine`, the only thing the tracker ever sees.
//
// The pipeline is built for throughput: raw and feature scratch buffers are
// sized once from the model and reused for every pixel, and the output label
// line is reused for every scan line. Steady-state processing allocates nothing.

use crate::core_modules::classifier::{ClassifierModel, LinearClassifier};
use crate::core_modules::feature_extractor::FeatureExtractor;
use crate::core_modules::spectrum::{Feature, Preprocessing, Reflectance};
use crate::error::ConfigError;

/// Label value for pixels that carry no class.
pub const BACKGROUND: i32 = -1;

/// One label per spatial pixel of a scan line. Values below zero are background.
#[derive(Debug, PartialEq, Eq)]
pub struct ClassLabelLine {
    labels: Vec<i32>,
}

impl Clone for ClassLabelLine {
    fn clone(&self) -> Self {
        Self {
            labels: self.labels.clone(),
        }
    }

    /// Reuses this line's buffer when it is large enough.
    fn clone_from(&mut self, source: &Self) {
        self.labels.clone_from(&source.labels);
    }
}

impl ClassLabelLine {
    /// A line of `width` background pixels.
    pub fn new(width: usize) -> Self {
        Self {
            labels: vec![BACKGROUND; width],
        }
    }

    pub fn from_labels(labels: Vec<i32>) -> Self {
        Self { labels }
    }

    pub fn width(&self) -> usize {
        self.labels.len()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.labels
    }

    pub fn is_background(&self, x: usize) -> bool {
        self.labels[x] < 0
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [i32] {
        &mut self.labels
    }
}

/// Drives raw spectra through preprocessing, feature extraction and classification.
pub struct ClassificationPipeline {
    extractor: FeatureExtractor,
    classifier: LinearClassifier,
    preprocessing: Preprocessing,
    /// Working copy of one raw sample, preprocessed in place.
    raw_scratch: Vec<Reflectance>,
    /// Feature vector for one pixel.
    feature_scratch: Vec<Feature>,
    /// Reused output for `process_line`.
    line: ClassLabelLine,
}

impl ClassificationPipeline {
    /// Builds a pipeline for lines of `width` pixels.
    pub fn new(model: &ClassifierModel, confidence_threshold: f32, width: usize) -> Result<Self, ConfigError> {
        if width == 0 {
            return Err(ConfigError::Validation("line width must be at least 1".to_string()));
        }
        let extractor = model.extractor()?;
        let classifier = LinearClassifier::from_model(model, confidence_threshold)?;
        Ok(Self {
            raw_scratch: vec![0.0; extractor.raw_band_count()],
            feature_scratch: vec![0.0; extractor.feature_count()],
            extractor,
            classifier,
            preprocessing: model.preprocessing,
            line: ClassLabelLine::new(width),
        })
    }

    /// Rebinds the extractor to new band offsets. The number of selected bands
    /// must still match what the loaded classifier was trained on.
    pub fn configure(&mut self, raw_band_count: usize, selected_bands: &[usize]) -> Result<(), ConfigError> {
        if selected_bands.len() != self.classifier.feature_count() {
            return Err(ConfigError::Validation(format!(
                "{} bands selected but the classifier expects {} features",
                selected_bands.len(),
                self.classifier.feature_count()
            )));
        }
        self.extractor.configure(raw_band_count, selected_bands)?;
        self.raw_scratch.resize(raw_band_count, 0.0);
        self.feature_scratch.resize(selected_bands.len(), 0.0);
        Ok(())
    }

    pub fn band_count(&self) -> usize {
        self.extractor.raw_band_count()
    }

    pub fn width(&self) -> usize {
        self.line.width()
    }

    /// Checks that a source delivering `band_count` bands can feed this pipeline.
    pub fn check_band_count(&self, band_count: usize) -> Result<(), ConfigError> {
        if band_count != self.band_count() {
            return Err(ConfigError::BandCountMismatch {
                expected: self.band_count(),
                actual: band_count,
            });
        }
        Ok(())
    }

    /// Classifies a single raw sample.
    ///
    /// # Panics
    ///
    /// If `raw` does not hold exactly `band_count()` values.
    pub fn process_frame(&mut self, raw: &[Reflectance]) -> i32 {
        debug_assert_eq!(raw.len(), self.band_count());
        Self::classify_sample(
            &self.extractor,
            &mut self.classifier,
            self.preprocessing,
            &mut self.raw_scratch,
            &mut self.feature_scratch,
            raw,
        )
    }

    /// Classifies one scan line laid out pixel-major (`width * band_count` values).
    /// Pixels missing from a short line are reported as background.
    pub fn process_line(&mut self, raw_line: &[Reflectance]) -> &ClassLabelLine {
        let bands = self.band_count();
        debug_assert_eq!(raw_line.len(), self.width() * bands);

        let labels = self.line.as_mut_slice();
        labels.fill(BACKGROUND);
        for (label, sample) in labels.iter_mut().zip(raw_line.chunks_exact(bands)) {
            *label = Self::classify_sample(
                &self.extractor,
                &mut self.classifier,
                self.preprocessing,
                &mut self.raw_scratch,
                &mut self.feature_scratch,
                sample,
            );
        }
        &self.line
    }

    fn classify_sample(
        extractor: &FeatureExtractor,
        classifier: &mut LinearClassifier,
        preprocessing: Preprocessing,
        raw_scratch: &mut [Reflectance],
        feature_scratch: &mut [Feature],
        raw: &[Reflectance],
    ) -> i32 {
        raw_scratch.copy_from_slice(raw);
        preprocessing.apply_raw(raw_scratch);
        extractor.extract(raw_scratch, feature_scratch);
        preprocessing.apply_features(feature_scratch);
        classifier.classify(feature_scratch)
    }
}
