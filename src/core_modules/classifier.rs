// THEORY:
// The `LinearClassifier` turns a feature vector into a class index. Every model
// the sorter runs is linear at inference time: one weight row plus a bias per
// class, scored by a dot product. What differs between model families is the
// decision policy applied to those scores:
//
// 1.  **Margin families** (support-vector, discriminant and regression-style
//     models): scores are distances, not probabilities. The highest score wins
//     outright, with no threshold.
// 2.  **Probabilistic families** (logistic/softmax models): scores are logits.
//     They are pushed through a numerically stable softmax and the best class
//     is only accepted when its probability clears a confidence threshold.
//     Anything less confident is reported as "no decision" and treated as
//     background downstream.
//
// Models arrive as JSON files produced by the training side. All shape checks
// happen in `ClassifierModel::validate`, so a model that loads is a model that
// can be run against every pixel without further checks.

use crate::core_modules::feature_extractor::{FeatureExtractor, FeatureFormula};
use crate::core_modules::spectrum::{Feature, Preprocessing};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Class index reported when no class is confident enough. Reads as background.
pub const NO_DECISION: i32 = -1;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.75;

/// How scores are turned into a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Arg-max over raw scores, never abstains.
    Margin,
    /// Softmax, then arg-max gated by the confidence threshold.
    Probabilistic,
}

impl ModelFamily {
    /// Maps the free-form `model_type` string of a model file to its family.
    /// Unrecognised types are treated as probabilistic so they keep the threshold.
    pub fn from_model_type(model_type: &str) -> Self {
        let kind = model_type.to_ascii_lowercase();
        const PROBABILISTIC: [&str; 3] = ["logistic", "softmax", "maxent"];
        const MARGIN: [&str; 7] = ["svm", "svc", "pls", "lda", "discriminant", "ridge", "regression"];

        if PROBABILISTIC.iter().any(|k| kind.contains(k)) {
            ModelFamily::Probabilistic
        } else if MARGIN.iter().any(|k| kind.contains(k)) {
            ModelFamily::Margin
        } else {
            ModelFamily::Probabilistic
        }
    }
}

/// A trained model as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    /// Free-form family name, e.g. "LinearSVC" or "LogisticRegression".
    pub model_type: String,
    /// Human-readable class names, index-aligned with `weights`.
    #[serde(default)]
    pub labels: Vec<String>,
    /// One weight row per class, one weight per feature.
    pub weights: Vec<Vec<f32>>,
    /// One bias per class.
    pub bias: Vec<f32>,
    /// Target band for each feature.
    pub selected_bands: Vec<usize>,
    /// Band distance between a target and its partner.
    #[serde(default)]
    pub gap: usize,
    /// Number of bands in every raw sample the model expects.
    pub raw_band_count: usize,
    #[serde(flatten)]
    pub preprocessing: Preprocessing,
}

impl ClassifierModel {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let model: ClassifierModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let model = Self::from_json_str(&content)?;
        info!(
            path = %path.display(),
            model_type = %model.model_type,
            classes = model.class_count(),
            features = model.selected_bands.len(),
            "classifier model loaded"
        );
        Ok(model)
    }

    pub fn family(&self) -> ModelFamily {
        ModelFamily::from_model_type(&self.model_type)
    }

    pub fn class_count(&self) -> usize {
        self.weights.len()
    }

    pub fn formula(&self) -> FeatureFormula {
        if self.preprocessing.absorbance {
            FeatureFormula::LogGap
        } else {
            FeatureFormula::RawGap
        }
    }

    /// Checks every shape the per-pixel path relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weights.is_empty() {
            return Err(ConfigError::Validation("model has no classes".to_string()));
        }
        if self.weights.len() != self.bias.len() {
            return Err(ConfigError::BiasLengthMismatch {
                weights: self.weights.len(),
                bias: self.bias.len(),
            });
        }
        let expected = self.selected_bands.len();
        if let Some((class, row)) = self
            .weights
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != expected)
        {
            return Err(ConfigError::WeightLengthMismatch {
                class,
                expected,
                actual: row.len(),
            });
        }
        if !self.labels.is_empty() && self.labels.len() != self.weights.len() {
            return Err(ConfigError::Validation(format!(
                "model has {} labels for {} classes",
                self.labels.len(),
                self.weights.len()
            )));
        }
        // Resolving the band offsets performs the range checks.
        self.extractor().map(|_| ())
    }

    /// Builds the feature extractor this model was trained against.
    pub fn extractor(&self) -> Result<FeatureExtractor, ConfigError> {
        FeatureExtractor::new(
            self.raw_band_count,
            &self.selected_bands,
            self.gap,
            self.formula(),
        )
    }
}

/// Scores feature vectors against per-class weights and applies the family's policy.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    /// Row-major `class_count * feature_count` weights.
    weights: Vec<f32>,
    bias: Vec<f32>,
    feature_count: usize,
    family: ModelFamily,
    confidence_threshold: f32,
    /// Per-class score scratch, reused for every pixel.
    scores: Vec<f32>,
}

impl LinearClassifier {
    pub fn from_model(model: &ClassifierModel, confidence_threshold: f32) -> Result<Self, ConfigError> {
        model.validate()?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "confidence threshold {confidence_threshold} is outside 0..=1"
            )));
        }
        let class_count = model.class_count();
        Ok(Self {
            weights: model.weights.iter().flatten().copied().collect(),
            bias: model.bias.clone(),
            feature_count: model.selected_bands.len(),
            family: model.family(),
            confidence_threshold,
            scores: vec![0.0; class_count],
        })
    }

    pub fn class_count(&self) -> usize {
        self.bias.len()
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn set_confidence_threshold(&mut self, threshold: f32) {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
    }

    /// Returns the winning class index, or `NO_DECISION`.
    pub fn classify(&mut self, features: &[Feature]) -> i32 {
        debug_assert_eq!(features.len(), self.feature_count);

        for (class, score) in self.scores.iter_mut().enumerate() {
            let row = &self.weights[class * self.feature_count..(class + 1) * self.feature_count];
            *score = row.iter().zip(features).map(|(w, f)| w * f).sum::<f32>() + self.bias[class];
        }

        let (best, best_score) = arg_max(&self.scores);
        match self.family {
            ModelFamily::Margin => best as i32,
            ModelFamily::Probabilistic => {
                // exp(best - max) is 1, so the winner's probability is 1 / sum.
                let sum: f32 = self.scores.iter().map(|s| (s - best_score).exp()).sum();
                let probability = 1.0 / sum;
                if probability >= self.confidence_threshold {
                    best as i32
                } else {
                    NO_DECISION
                }
            }
        }
    }

    /// Full softmax distribution for the last scored vector, for diagnostics.
    pub fn probabilities(&self, out: &mut [f32]) {
        let (_, max) = arg_max(&self.scores);
        let mut sum = 0.0;
        for (slot, score) in out.iter_mut().zip(&self.scores) {
            *slot = (score - max).exp();
            sum += *slot;
        }
        out.iter_mut().for_each(|p| *p /= sum);
    }
}

/// First index holding the maximum, so ties go to the lowest class.
fn arg_max(scores: &[f32]) -> (usize, f32) {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (index, &score) in scores.iter().enumerate() {
        if score > best_score {
            best = index;
            best_score = score;
        }
    }
    (best, best_score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(model_type: &str, weights: Vec<Vec<f32>>, bias: Vec<f32>) -> ClassifierModel {
        let features = weights[0].len();
        ClassifierModel {
            model_type: model_type.to_string(),
            labels: Vec::new(),
            weights,
            bias,
            selected_bands: (0..features).collect(),
            gap: 1,
            raw_band_count: features + 1,
            preprocessing: Preprocessing::default(),
        }
    }

    #[test]
    fn family_is_derived_from_model_type() {
        assert_eq!(ModelFamily::from_model_type("LinearSVC"), ModelFamily::Margin);
        assert_eq!(ModelFamily::from_model_type("PLS-DA"), ModelFamily::Margin);
        assert_eq!(
            ModelFamily::from_model_type("LogisticRegression"),
            ModelFamily::Probabilistic
        );
        assert_eq!(ModelFamily::from_model_type("mystery"), ModelFamily::Probabilistic);
    }

    #[test]
    fn dominant_class_wins_under_both_policies() {
        let weights = vec![vec![0.0, 0.0], vec![5.0, 5.0]];
        for kind in ["LinearSVC", "LogisticRegression"] {
            let mut classifier =
                LinearClassifier::from_model(&model(kind, weights.clone(), vec![0.0, 0.0]), 0.75).unwrap();
            assert_eq!(classifier.classify(&[2.0, 2.0]), 1, "{kind}");
        }
    }

    #[test]
    fn margin_ties_go_to_lowest_class() {
        let weights = vec![vec![1.0], vec![1.0], vec![0.0]];
        let mut classifier =
            LinearClassifier::from_model(&model("svm", weights, vec![0.0; 3]), 0.75).unwrap();
        assert_eq!(classifier.classify(&[1.0]), 0);
    }

    #[test]
    fn uncertain_softmax_abstains() {
        let weights = vec![vec![1.0], vec![1.0]];
        let mut classifier =
            LinearClassifier::from_model(&model("logistic", weights, vec![0.0, 0.1]), 0.75).unwrap();
        assert_eq!(classifier.classify(&[1.0]), NO_DECISION);

        classifier.set_confidence_threshold(0.5);
        assert_eq!(classifier.classify(&[1.0]), 1);
    }

    #[test]
    fn softmax_is_stable_for_large_scores() {
        let weights = vec![vec![1000.0], vec![990.0]];
        let mut classifier =
            LinearClassifier::from_model(&model("softmax", weights, vec![0.0, 0.0]), 0.75).unwrap();
        assert_eq!(classifier.classify(&[1.0]), 0);

        let mut probabilities = [0.0; 2];
        classifier.probabilities(&mut probabilities);
        assert!(probabilities.iter().all(|p| p.is_finite()));
        assert!((probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn malformed_models_fail_validation() {
        let ragged = model("svm", vec![vec![1.0, 2.0], vec![1.0]], vec![0.0, 0.0]);
        assert!(matches!(
            ragged.validate(),
            Err(ConfigError::WeightLengthMismatch { class: 1, .. })
        ));

        let short_bias = model("svm", vec![vec![1.0], vec![1.0]], vec![0.0]);
        assert!(matches!(
            short_bias.validate(),
            Err(ConfigError::BiasLengthMismatch { .. })
        ));

        let mut bad_band = model("svm", vec![vec![1.0]], vec![0.0]);
        bad_band.selected_bands = vec![9];
        assert!(matches!(
            bad_band.validate(),
            Err(ConfigError::BandOutOfRange { index: 9, .. })
        ));
    }

    #[test]
    fn model_parses_from_json_with_flattened_flags() {
        let json = r#"{
            "model_type": "LogisticRegression",
            "labels": ["plastic", "paper"],
            "weights": [[1.0, 0.0], [0.0, 1.0]],
            "bias": [0.0, 0.0],
            "selected_bands": [2, 5],
            "gap": 3,
            "raw_band_count": 10,
            "snv": true,
            "absorbance": true
        }"#;
        let model = ClassifierModel::from_json_str(json).unwrap();
        assert!(model.preprocessing.snv);
        assert!(!model.preprocessing.l2);
        assert_eq!(model.formula(), FeatureFormula::LogGap);
        assert_eq!(model.family(), ModelFamily::Probabilistic);
    }
}
