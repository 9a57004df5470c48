use std::path::Path;

use anyhow::{Context, Result};
use image::ImageReader;

use crate::detect::backend::DetectorBackend;
use crate::detect::catalog::ClassCatalog;
use crate::detect::result::RawDetection;

/// Stub backend for testing and dry runs.
///
/// Decodes the image so unreadable files fail the same way a real model
/// would, then returns a fixed detection list.
pub struct StubBackend {
    catalog: ClassCatalog,
    detections: Vec<RawDetection>,
}

impl StubBackend {
    pub fn new(catalog: ClassCatalog) -> Self {
        Self {
            catalog,
            detections: Vec::new(),
        }
    }

    /// Script the detections every `infer` call returns.
    ///
    /// Class names are taken from the catalog, not from the scripted values.
    pub fn with_detections(mut self, detections: Vec<RawDetection>) -> Self {
        self.detections = detections
            .into_iter()
            .map(|mut det| {
                det.class_name = self.catalog.name(det.class_id).into_owned();
                det
            })
            .collect();
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(ClassCatalog::default())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    fn infer(&mut self, image_path: &Path) -> Result<Vec<RawDetection>> {
        let image = ImageReader::open(image_path)
            .with_context(|| format!("failed to open image {}", image_path.display()))?
            .with_guessed_format()
            .with_context(|| format!("failed to guess format of {}", image_path.display()))?
            .decode()
            .with_context(|| format!("failed to decode image {}", image_path.display()))?;
        log::debug!(
            "stub backend decoded {}x{} image",
            image.width(),
            image.height()
        );
        Ok(self.detections.clone())
    }
}
