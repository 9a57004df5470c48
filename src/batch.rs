//! Directory-wide analysis: one summary per image plus per-class totals
//! across the whole catalog, optionally with annotated prediction images.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;

use crate::aggregate::DetectionSummary;
use crate::annotate::Annotator;
use crate::error::AnalyzeError;
use crate::service::{accepted_extension, AnalysisService};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub images: Vec<ImageReport>,
    pub failures: Vec<ImageFailure>,
    pub total_detected: usize,
    /// Every catalog class in catalog order (zeros included), then any
    /// name outside the catalog in first-seen order.
    pub class_totals: IndexMap<String, usize>,
}

#[derive(Debug, Serialize)]
pub struct ImageReport {
    pub file: String,
    pub summary: DetectionSummary,
    /// Annotated copy written for this image, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
}

/// Where and how prediction images are written.
pub struct PredictionOutput<'a> {
    pub annotator: &'a Annotator,
    pub output_dir: &'a Path,
}

#[derive(Debug, Serialize)]
pub struct ImageFailure {
    pub file: String,
    pub error: String,
}

/// Image files directly inside `dir` with an accepted extension, sorted by
/// file name. Subdirectories are not visited.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let accepted = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| accepted_extension(name).is_ok());
        if accepted {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Analyzes every image in `dir`. A failing image is recorded in
/// `failures` and does not stop the run.
pub fn analyze_directory(
    service: &AnalysisService,
    dir: &Path,
    threshold: f64,
) -> Result<BatchReport> {
    run_directory(service, dir, threshold, None)
}

/// [`analyze_directory`], also writing `pred_<file>` for every analyzed
/// image into `output.output_dir`. A failed write is logged and leaves
/// `prediction` empty.
pub fn analyze_directory_with_predictions(
    service: &AnalysisService,
    dir: &Path,
    threshold: f64,
    output: &PredictionOutput<'_>,
) -> Result<BatchReport> {
    std::fs::create_dir_all(output.output_dir).with_context(|| {
        format!("failed to create output dir {}", output.output_dir.display())
    })?;
    run_directory(service, dir, threshold, Some(output))
}

fn run_directory(
    service: &AnalysisService,
    dir: &Path,
    threshold: f64,
    output: Option<&PredictionOutput<'_>>,
) -> Result<BatchReport> {
    let mut report = BatchReport {
        images: Vec::new(),
        failures: Vec::new(),
        total_detected: 0,
        class_totals: service
            .catalog()
            .names()
            .iter()
            .map(|name| (name.clone(), 0))
            .collect(),
    };

    for path in list_images(dir)? {
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match analyze_one(service, &path, threshold, output) {
            Ok((summary, prediction)) => {
                log::info!(
                    "{}: {} detected, best {}",
                    file,
                    summary.total_detected,
                    summary.best_class_name
                );
                report.total_detected += summary.total_detected;
                for (name, count) in &summary.class_counts {
                    *report.class_totals.entry(name.clone()).or_insert(0) += count;
                }
                report.images.push(ImageReport {
                    file,
                    summary,
                    prediction,
                });
            }
            Err(err) => {
                let error = match err.details() {
                    Some(details) => format!("{err}: {details}"),
                    None => err.to_string(),
                };
                log::warn!("{}: {}", file, error);
                report.failures.push(ImageFailure { file, error });
            }
        }
    }
    Ok(report)
}

fn analyze_one(
    service: &AnalysisService,
    path: &Path,
    threshold: f64,
    output: Option<&PredictionOutput<'_>>,
) -> Result<(DetectionSummary, Option<String>), AnalyzeError> {
    let Some(output) = output else {
        return Ok((service.analyze_path(path, threshold)?, None));
    };
    let (summary, kept) = service.detect_path(path, threshold)?;
    let prediction = match output
        .annotator
        .write_prediction(path, &kept, output.output_dir)
    {
        Ok(dest) => Some(dest.to_string_lossy().into_owned()),
        Err(err) => {
            log::warn!("{}: prediction image not written: {:#}", path.display(), err);
            None
        }
    };
    Ok((summary, prediction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::{class_color, PREDICTION_PREFIX};
    use crate::detect::{BoundingBox, ClassCatalog, RawDetection, StubBackend};

    fn write_png(path: &Path) {
        image::RgbImage::new(4, 4).save(path).unwrap();
    }

    #[test]
    fn lists_only_accepted_images_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("b.png"));
        write_png(&dir.path().join("a.PNG"));
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let names: Vec<String> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.png"]);
    }

    #[test]
    fn totals_cover_the_whole_catalog() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("one.png"));
        write_png(&dir.path().join("two.jpg"));
        std::fs::write(dir.path().join("broken.png"), b"garbage").unwrap();

        let backend = StubBackend::new(ClassCatalog::new(["bug", "level 1", "level 2"]))
            .with_detections(vec![
                RawDetection::new(0, "", 0.9),
                RawDetection::new(2, "", 0.8),
                RawDetection::new(1, "", 0.3),
            ]);
        let service = AnalysisService::new(Box::new(backend));
        let report = analyze_directory(&service, dir.path(), 0.7).unwrap();

        assert_eq!(report.images.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, "broken.png");
        assert_eq!(report.total_detected, 4);
        let totals: Vec<(&str, usize)> = report
            .class_totals
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        assert_eq!(totals, vec![("bug", 2), ("level 1", 0), ("level 2", 2)]);
    }

    #[test]
    fn writes_annotated_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        image::RgbImage::new(32, 32)
            .save(dir.path().join("leaf.png"))
            .unwrap();

        let backend = StubBackend::new(ClassCatalog::new(["bug", "level 1"])).with_detections(vec![
            RawDetection::new(1, "", 0.9).with_bbox(BoundingBox::new(8.0, 8.0, 24.0, 24.0)),
            RawDetection::new(0, "", 0.2).with_bbox(BoundingBox::new(0.0, 0.0, 31.0, 31.0)),
        ]);
        let service = AnalysisService::new(Box::new(backend));
        let annotator = Annotator::default();
        let output = PredictionOutput {
            annotator: &annotator,
            output_dir: out.path(),
        };
        let report = analyze_directory_with_predictions(&service, dir.path(), 0.7, &output).unwrap();

        let written = out.path().join(format!("{PREDICTION_PREFIX}leaf.png"));
        assert!(written.is_file());
        assert_eq!(
            report.images[0].prediction.as_deref(),
            Some(written.to_string_lossy().as_ref())
        );
        assert_eq!(report.total_detected, 1);

        let annotated = image::open(&written).unwrap().to_rgb8();
        assert_eq!(*annotated.get_pixel(8, 16), class_color(1));
        assert_eq!(*annotated.get_pixel(24, 16), class_color(1));
        assert_eq!(*annotated.get_pixel(16, 16), image::Rgb([0, 0, 0]));
        // Below-threshold detections are not drawn.
        assert_eq!(*annotated.get_pixel(0, 16), image::Rgb([0, 0, 0]));
        // The source image is left untouched.
        let source = image::open(dir.path().join("leaf.png")).unwrap().to_rgb8();
        assert_eq!(*source.get_pixel(8, 16), image::Rgb([0, 0, 0]));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = AnalysisService::new(Box::new(StubBackend::default()));
        assert!(analyze_directory(&service, &dir.path().join("nope"), 0.7).is_err());
    }
}
