//! Detection aggregation.
//!
//! Reduces one image's raw detections to a [`DetectionSummary`]. The
//! confidence threshold is applied before any statistic is computed, so a
//! single threshold value determines every field of the summary.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::detect::RawDetection;

/// `bestClassName` of a summary with no detections above threshold.
pub const NO_DETECTION: &str = "no_detection";

/// Default confidence threshold of the service.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

const ROUNDING_SCALE: f64 = 10_000.0;

/// Rounds to 4 decimal places, ties away from zero.
pub fn round4(value: f64) -> f64 {
    (value * ROUNDING_SCALE).round() / ROUNDING_SCALE
}

/// True when `value` has at most 4 decimal places, so rounding a kept
/// confidence can never take it below this threshold.
pub fn on_rounding_grid(value: f64) -> bool {
    round4(value) == value
}

/// Detections at or above `threshold`, in input order. NaN never passes.
pub fn above_threshold(
    detections: &[RawDetection],
    threshold: f64,
) -> impl Iterator<Item = &RawDetection> {
    detections
        .iter()
        .filter(move |det| det.confidence >= threshold)
}

/// One kept detection as it appears in a summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDetection {
    pub class_name: String,
    pub confidence: f64,
}

/// Summary of one image's detections above a confidence threshold.
///
/// Invariants: `total_detected == detections.len() == class_counts` sum;
/// with no detections `best_class_name` is [`NO_DETECTION`] and
/// `average_confidence` is `0.0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSummary {
    pub total_detected: usize,
    pub best_class_name: String,
    pub average_confidence: f64,
    pub class_counts: IndexMap<String, usize>,
    pub detections: Vec<SummaryDetection>,
}

impl DetectionSummary {
    pub fn empty() -> Self {
        Self {
            total_detected: 0,
            best_class_name: NO_DETECTION.to_string(),
            average_confidence: 0.0,
            class_counts: IndexMap::new(),
            detections: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_detected == 0
    }

    /// Highest kept confidence, if anything was kept.
    pub fn best_confidence(&self) -> Option<f64> {
        self.detections
            .iter()
            .map(|det| det.confidence)
            .reduce(f64::max)
    }
}

/// Filters `detections` by `threshold` and summarizes what is left.
///
/// Input order is preserved. Ties for the best confidence go to the first
/// detection encountered. NaN confidences never pass the filter.
pub fn aggregate(detections: &[RawDetection], threshold: f64) -> DetectionSummary {
    let kept: Vec<&RawDetection> = above_threshold(detections, threshold).collect();

    let Some(first) = kept.first() else {
        return DetectionSummary::empty();
    };

    let mut best = *first;
    let mut sum = 0.0;
    let mut class_counts: IndexMap<String, usize> = IndexMap::new();
    for &det in &kept {
        if det.confidence > best.confidence {
            best = det;
        }
        sum += det.confidence;
        *class_counts.entry(det.class_name.clone()).or_insert(0) += 1;
    }

    DetectionSummary {
        total_detected: kept.len(),
        best_class_name: best.class_name.clone(),
        average_confidence: round4(sum / kept.len() as f64),
        class_counts,
        detections: kept
            .iter()
            .map(|det| SummaryDetection {
                class_name: det.class_name.clone(),
                confidence: round4(det.confidence),
            })
            .collect(),
    }
}
