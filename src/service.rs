//! Analysis service: the detector handle, its catalog and the request
//! policy (threshold, staging, upload limits), constructed once and shared
//! by every request.

use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use tempfile::NamedTempFile;

use crate::aggregate::{
    aggregate, above_threshold, on_rounding_grid, DetectionSummary, DEFAULT_CONFIDENCE_THRESHOLD,
};
use crate::detect::{ClassCatalog, DetectorBackend, RawDetection};
use crate::error::AnalyzeError;

/// Upload extensions accepted for analysis (compared case-insensitively).
pub const ACCEPTED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "bmp"];

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub struct AnalysisService {
    detector: Mutex<Box<dyn DetectorBackend>>,
    backend_name: &'static str,
    catalog: ClassCatalog,
    threshold: f64,
    staging_dir: Option<PathBuf>,
    max_upload_bytes: usize,
}

impl AnalysisService {
    pub fn new(detector: Box<dyn DetectorBackend>) -> Self {
        let backend_name = detector.name();
        let catalog = detector.catalog().clone();
        Self {
            detector: Mutex::new(detector),
            backend_name,
            catalog,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            staging_dir: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Stage uploads under `dir` instead of the system temp directory.
    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Returns the per-request threshold, or the configured default.
    pub fn resolve_threshold(&self, requested: Option<f64>) -> Result<f64, AnalyzeError> {
        match requested {
            None => Ok(self.threshold),
            Some(t) if t.is_finite() && (0.0..=1.0).contains(&t) && on_rounding_grid(t) => Ok(t),
            Some(t) => Err(AnalyzeError::validation(format!(
                "threshold must be between 0 and 1 with at most 4 decimal places, got {t}"
            ))),
        }
    }

    /// Analyzes an image that already lives on this host.
    pub fn analyze_path(
        &self,
        path: &Path,
        threshold: f64,
    ) -> Result<DetectionSummary, AnalyzeError> {
        if !path.is_file() {
            return Err(AnalyzeError::NotFound(path.to_path_buf()));
        }
        self.run_detector(path, threshold)
    }

    /// Like [`analyze_path`](Self::analyze_path), also returning the kept
    /// detections with their boxes.
    pub fn detect_path(
        &self,
        path: &Path,
        threshold: f64,
    ) -> Result<(DetectionSummary, Vec<RawDetection>), AnalyzeError> {
        if !path.is_file() {
            return Err(AnalyzeError::NotFound(path.to_path_buf()));
        }
        let detections = self.infer(path)?;
        let kept = above_threshold(&detections, threshold).cloned().collect();
        Ok((aggregate(&detections, threshold), kept))
    }

    /// Validates an upload and writes it to a request-scoped temporary file.
    ///
    /// Nothing touches the disk unless the name and size checks pass. The
    /// returned [`StagedImage`] deletes its file when dropped.
    pub fn stage_upload(&self, file_name: &str, bytes: &[u8]) -> Result<StagedImage, AnalyzeError> {
        let extension = accepted_extension(file_name)?;
        if bytes.is_empty() {
            return Err(AnalyzeError::validation("uploaded file is empty"));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(AnalyzeError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            });
        }

        let suffix = format!(".{extension}");
        let mut builder = tempfile::Builder::new();
        builder.prefix("upload-").suffix(&suffix);
        let mut file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(AnalyzeError::Staging)?;
        file.write_all(bytes).map_err(AnalyzeError::Staging)?;
        file.flush().map_err(AnalyzeError::Staging)?;

        log::debug!(
            "staged upload '{}' ({} bytes) at {}",
            file_name,
            bytes.len(),
            file.path().display()
        );
        Ok(StagedImage {
            file,
            original_name: file_name.to_string(),
        })
    }

    pub fn analyze_staged(
        &self,
        staged: &StagedImage,
        threshold: f64,
    ) -> Result<DetectionSummary, AnalyzeError> {
        self.run_detector(staged.path(), threshold)
    }

    fn run_detector(&self, path: &Path, threshold: f64) -> Result<DetectionSummary, AnalyzeError> {
        let detections = self.infer(path)?;
        Ok(aggregate(&detections, threshold))
    }

    /// Runs the shared detector. A panic inside the backend fails this call
    /// only; the next request gets the detector back.
    fn infer(&self, path: &Path) -> Result<Vec<RawDetection>, AnalyzeError> {
        let mut detector = self.detector.lock().unwrap_or_else(|poisoned| {
            log::warn!("detector lock was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        });
        match panic::catch_unwind(AssertUnwindSafe(|| detector.infer(path))) {
            Ok(result) => result.map_err(AnalyzeError::Inference),
            Err(payload) => Err(AnalyzeError::Inference(anyhow!(
                "detector panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Uploaded image copied to local disk for the duration of one request.
pub struct StagedImage {
    file: NamedTempFile,
    original_name: String,
}

impl StagedImage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }
}

/// Lower-cased extension of `file_name` when it is an accepted image type.
pub fn accepted_extension(file_name: &str) -> Result<String, AnalyzeError> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(|| {
            AnalyzeError::validation(format!("file '{file_name}' has no extension"))
        })?;
    if ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(AnalyzeError::validation(format!(
            "file type '.{extension}' is not allowed (accepted: {})",
            ACCEPTED_EXTENSIONS.join(", ")
        )))
    }
}
