//! YOLO (v8/v11 export layout) head decoding.
//!
//! The exported head is `[1, 4 + classes, anchors]` (or its transpose). Each
//! anchor carries `cx, cy, w, h` in letterboxed input pixels followed by one
//! score per class. Decoding here is independent of the inference runtime.

use anyhow::{anyhow, Result};

use super::catalog::ClassCatalog;
use super::result::{BoundingBox, RawDetection};

/// Upper bound on detections kept per image after NMS.
pub const MAX_DETECTIONS: usize = 300;

const BOX_FEATURES: usize = 4;

/// Geometry of a letterbox resize: source image scaled to fit a square
/// input, centered, padded on the short side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub resized_w: u32,
    pub resized_h: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl Letterbox {
    pub fn fit(orig_w: u32, orig_h: u32, input_size: u32) -> Result<Self> {
        if orig_w == 0 || orig_h == 0 {
            return Err(anyhow!("image has zero dimension {}x{}", orig_w, orig_h));
        }
        let scale = (input_size as f32 / orig_w as f32).min(input_size as f32 / orig_h as f32);
        let resized_w = ((orig_w as f32 * scale).round() as u32).clamp(1, input_size);
        let resized_h = ((orig_h as f32 * scale).round() as u32).clamp(1, input_size);
        Ok(Self {
            scale,
            pad_x: (input_size - resized_w) as f32 / 2.0,
            pad_y: (input_size - resized_h) as f32 / 2.0,
            resized_w,
            resized_h,
            orig_w,
            orig_h,
        })
    }

    /// Maps a center-format box from input space back to the source image.
    fn unproject(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let max_x = self.orig_w as f32;
        let max_y = self.orig_h as f32;
        BoundingBox::new(
            ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, max_x),
            ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, max_y),
            ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, max_x),
            ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, max_y),
        )
    }
}

/// Orientation and size of the detection head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadLayout {
    /// `true` for `[1, features, anchors]`, `false` for `[1, anchors, features]`.
    pub features_first: bool,
    pub classes: usize,
    pub anchors: usize,
}

impl HeadLayout {
    /// Works out the head layout from the output shape.
    ///
    /// With a non-empty label list the feature axis must hold exactly
    /// `4 + labels` entries. Without labels the shorter axis is taken as the
    /// feature axis, which holds for every stock export.
    pub fn resolve(shape: &[usize], labels: usize) -> Result<Self> {
        let (dim1, dim2) = match shape {
            [1, dim1, dim2] => (*dim1, *dim2),
            _ => {
                return Err(anyhow!(
                    "expected detection head shape [1, features, anchors], got {:?}",
                    shape
                ))
            }
        };

        let features_first = if labels > 0 {
            let expected = BOX_FEATURES + labels;
            if dim1 == expected {
                true
            } else if dim2 == expected {
                false
            } else {
                return Err(anyhow!(
                    "detection head {:?} does not match {} labels (expected {} features)",
                    shape,
                    labels,
                    expected
                ));
            }
        } else {
            dim1 <= dim2
        };

        let (features, anchors) = if features_first {
            (dim1, dim2)
        } else {
            (dim2, dim1)
        };
        if features <= BOX_FEATURES {
            return Err(anyhow!(
                "detection head {:?} has no class scores",
                shape
            ));
        }

        Ok(Self {
            features_first,
            classes: features - BOX_FEATURES,
            anchors,
        })
    }
}

/// Decodes raw head values into detections above `min_confidence`.
///
/// `value(anchor, feature)` reads one head entry regardless of orientation.
/// The result is sorted by descending confidence and class-wise NMS has been
/// applied.
pub fn decode<F>(
    layout: &HeadLayout,
    value: F,
    letterbox: &Letterbox,
    min_confidence: f32,
    iou_threshold: f32,
    catalog: &ClassCatalog,
) -> Vec<RawDetection>
where
    F: Fn(usize, usize) -> f32,
{
    let mut candidates = Vec::new();

    for anchor in 0..layout.anchors {
        let (class_id, score) = (0..layout.classes)
            .map(|class| (class, value(anchor, BOX_FEATURES + class)))
            .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });

        if !score.is_finite() || score < min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (
            value(anchor, 0),
            value(anchor, 1),
            value(anchor, 2),
            value(anchor, 3),
        );
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) || w <= 0.0 || h <= 0.0 {
            continue;
        }

        let bbox = letterbox.unproject(cx, cy, w, h);
        if bbox.area() <= 0.0 {
            continue;
        }

        let class_id = class_id as u32;
        candidates.push(
            RawDetection::new(class_id, catalog.name(class_id), f64::from(score)).with_bbox(bbox),
        );
    }

    non_max_suppression(candidates, iou_threshold)
}

/// Class-wise greedy NMS. Output is ordered by descending confidence and
/// capped at [`MAX_DETECTIONS`].
pub fn non_max_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_short_side() {
        let lb = Letterbox::fit(1280, 640, 640).unwrap();
        assert_eq!(lb.scale, 0.5);
        assert_eq!((lb.resized_w, lb.resized_h), (640, 320));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
    }

    #[test]
    fn letterbox_rejects_empty_image() {
        assert!(Letterbox::fit(0, 10, 640).is_err());
    }

    #[test]
    fn resolves_both_orientations() {
        let a = HeadLayout::resolve(&[1, 11, 8400], 7).unwrap();
        assert!(a.features_first);
        assert_eq!((a.classes, a.anchors), (7, 8400));

        let b = HeadLayout::resolve(&[1, 8400, 11], 7).unwrap();
        assert!(!b.features_first);
        assert_eq!((b.classes, b.anchors), (7, 8400));

        let c = HeadLayout::resolve(&[1, 84, 8400], 0).unwrap();
        assert!(c.features_first);
        assert_eq!(c.classes, 80);
    }

    #[test]
    fn rejects_mismatched_labels() {
        assert!(HeadLayout::resolve(&[1, 84, 8400], 7).is_err());
        assert!(HeadLayout::resolve(&[84, 8400], 80).is_err());
        assert!(HeadLayout::resolve(&[1, 4, 8400], 0).is_err());
    }

    fn head(rows: &[[f32; 6]]) -> (HeadLayout, Vec<[f32; 6]>) {
        let layout = HeadLayout {
            features_first: false,
            classes: 2,
            anchors: rows.len(),
        };
        (layout, rows.to_vec())
    }

    #[test]
    fn decodes_and_suppresses_overlaps() {
        let (layout, rows) = head(&[
            // cx, cy, w, h, cat, dog
            [100.0, 100.0, 50.0, 50.0, 0.90, 0.05],
            [102.0, 101.0, 50.0, 50.0, 0.80, 0.05],
            [400.0, 400.0, 40.0, 40.0, 0.10, 0.95],
            [300.0, 300.0, 40.0, 40.0, 0.10, 0.10],
        ]);
        let lb = Letterbox::fit(640, 640, 640).unwrap();
        let catalog = ClassCatalog::new(["cat", "dog"]);

        let detections = decode(&layout, |a, f| rows[a][f], &lb, 0.25, 0.7, &catalog);

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "dog");
        assert_eq!(detections[1].class_name, "cat");
        assert!((detections[1].confidence - 0.9).abs() < 1e-6);
        assert!((detections[1].bbox.x1 - 75.0).abs() < 1e-3);
        assert!((detections[1].bbox.x2 - 125.0).abs() < 1e-3);
    }

    #[test]
    fn overlapping_boxes_of_different_classes_survive() {
        let (layout, rows) = head(&[
            [100.0, 100.0, 50.0, 50.0, 0.90, 0.05],
            [100.0, 100.0, 50.0, 50.0, 0.05, 0.85],
        ]);
        let lb = Letterbox::fit(640, 640, 640).unwrap();
        let catalog = ClassCatalog::new(["cat", "dog"]);

        let detections = decode(&layout, |a, f| rows[a][f], &lb, 0.25, 0.7, &catalog);
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn maps_boxes_back_through_padding() {
        let (layout, rows) = head(&[[320.0, 320.0, 100.0, 100.0, 0.9, 0.0]]);
        // 1280x640 source: scale 0.5, 160px vertical padding.
        let lb = Letterbox::fit(1280, 640, 640).unwrap();
        let catalog = ClassCatalog::new(["cat", "dog"]);

        let detections = decode(&layout, |a, f| rows[a][f], &lb, 0.25, 0.7, &catalog);
        let bbox = detections[0].bbox;
        assert!((bbox.x1 - 540.0).abs() < 1e-3);
        assert!((bbox.y1 - 220.0).abs() < 1e-3);
        assert!((bbox.x2 - 740.0).abs() < 1e-3);
        assert!((bbox.y2 - 420.0).abs() < 1e-3);
    }

    #[test]
    fn skips_non_finite_and_degenerate_rows() {
        let (layout, rows) = head(&[
            [f32::NAN, 100.0, 50.0, 50.0, 0.9, 0.0],
            [100.0, 100.0, 0.0, 50.0, 0.9, 0.0],
            [100.0, 100.0, 50.0, 50.0, f32::NAN, f32::NAN],
        ]);
        let lb = Letterbox::fit(640, 640, 640).unwrap();
        let catalog = ClassCatalog::new(["cat", "dog"]);

        assert!(decode(&layout, |a, f| rows[a][f], &lb, 0.25, 0.7, &catalog).is_empty());
    }
}
