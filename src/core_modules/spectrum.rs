// THEORY (Single-Sample Spectral Heuristics):
// A raw sample is the reflectance of one spatial pixel across every band the
// sensor delivers. This module holds the transforms that can be computed from
// that one sample alone, with no knowledge of neighbouring pixels or lines:
//
// - Raw domain (before feature extraction):
//   • SNV (standard normal variate): centre on the sample mean, scale by its
//     standard deviation. Removes multiplicative scatter and baseline offsets.
//   • Min-max: rescale the sample to 0..1 using its own extremes.
// - Feature domain (after extraction):
//   • L2: scale the feature vector to unit Euclidean length.
//
// All transforms run in place on caller-owned, pre-sized buffers. Nothing here
// allocates, which keeps the per-pixel hot path free of heap traffic.

use serde::{Deserialize, Serialize};

pub type Reflectance = f32;
pub type Feature = f32;

/// Degenerate spread below which a sample is treated as flat.
const FLAT_SPREAD: f32 = 1e-12;

/// Which optional transforms a model expects, as declared in its model file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preprocessing {
    /// Apply standard normal variate to the raw sample.
    pub snv: bool,
    /// Apply min-max scaling to the raw sample (after SNV when both are set).
    pub min_max: bool,
    /// Normalise the extracted feature vector to unit length.
    pub l2: bool,
    /// Features are absorbance log-ratios rather than raw band differences.
    pub absorbance: bool,
}

impl Preprocessing {
    /// Runs the enabled raw-domain transforms over `sample` in place.
    pub fn apply_raw(&self, sample: &mut [Reflectance]) {
        if self.snv {
            standard_normal_variate(sample);
        }
        if self.min_max {
            min_max_normalize(sample);
        }
    }

    /// Runs the enabled feature-domain transforms over `features` in place.
    pub fn apply_features(&self, features: &mut [Feature]) {
        if self.l2 {
            l2_normalize(features);
        }
    }
}

/// Standard normal variate, in place.
///
/// - Subtracts the sample mean from every band.
/// - Divides by the population standard deviation.
/// - A flat sample is only mean-centred (it becomes all zeros).
pub fn standard_normal_variate(sample: &mut [Reflectance]) {
    if sample.is_empty() {
        return;
    }
    let count = sample.len() as f32;
    let mean = sample.iter().sum::<f32>() / count;
    let variance = sample.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
    let std_dev = variance.sqrt();

    if std_dev <= FLAT_SPREAD {
        sample.iter_mut().for_each(|v| *v -= mean);
        return;
    }
    let inverse = 1.0 / std_dev;
    sample.iter_mut().for_each(|v| *v = (*v - mean) * inverse);
}

/// Min-max scaling to 0..1, in place. A flat sample maps to all zeros.
pub fn min_max_normalize(sample: &mut [Reflectance]) {
    let (minimum, maximum) = sample
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = maximum - minimum;
    if !range.is_finite() || range <= FLAT_SPREAD {
        sample.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let inverse = 1.0 / range;
    sample.iter_mut().for_each(|v| *v = (*v - minimum) * inverse);
}

/// Unit-length scaling, in place. A zero vector is left untouched.
pub fn l2_normalize(features: &mut [Feature]) {
    let norm = features.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= FLAT_SPREAD {
        return;
    }
    let inverse = 1.0 / norm;
    features.iter_mut().for_each(|v| *v *= inverse);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn snv_centres_and_scales() {
        let mut sample = [1.0, 2.0, 3.0, 4.0];
        standard_normal_variate(&mut sample);

        let mean: f32 = sample.iter().sum::<f32>() / 4.0;
        let variance: f32 = sample.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(close(mean, 0.0));
        assert!(close(variance, 1.0));
    }

    #[test]
    fn snv_of_flat_sample_is_zero() {
        let mut sample = [0.5; 6];
        standard_normal_variate(&mut sample);
        assert!(sample.iter().all(|v| close(*v, 0.0)));
    }

    #[test]
    fn min_max_maps_extremes_to_unit_range() {
        let mut sample = [10.0, 20.0, 15.0];
        min_max_normalize(&mut sample);
        assert_eq!(sample, [0.0, 1.0, 0.5]);
    }

    #[test]
    fn l2_produces_unit_vector() {
        let mut features = [3.0, 4.0];
        l2_normalize(&mut features);
        assert!(close(features[0], 0.6));
        assert!(close(features[1], 0.8));

        let mut zeros = [0.0, 0.0];
        l2_normalize(&mut zeros);
        assert_eq!(zeros, [0.0, 0.0]);
    }

    #[test]
    fn preprocessing_respects_flags() {
        let mut sample = [2.0, 4.0, 6.0];
        Preprocessing::default().apply_raw(&mut sample);
        assert_eq!(sample, [2.0, 4.0, 6.0]);

        let flags = Preprocessing {
            min_max: true,
            ..Preprocessing::default()
        };
        flags.apply_raw(&mut sample);
        assert_eq!(sample, [0.0, 0.5, 1.0]);
    }
}
