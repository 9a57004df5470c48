pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::Result;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use crate::config::{BackendKind, DetectorSettings};
use crate::detect::backend::DetectorBackend;
use crate::detect::catalog::ClassCatalog;

/// Builds and warms up the configured backend.
///
/// Any failure here is a startup failure: the caller must not start serving.
pub fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend: Box<dyn DetectorBackend> = match settings.backend {
        BackendKind::Stub => Box::new(StubBackend::new(ClassCatalog::new(
            settings.labels.iter().cloned(),
        ))),
        BackendKind::Tract => build_tract(settings)?,
    };
    backend.warm_up()?;
    log::info!(
        "detector backend '{}' ready with {} classes",
        backend.name(),
        backend.catalog().len()
    );
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("tract backend requires a model path"))?;
    let backend = TractBackend::new(model_path, settings.input_size, &settings.labels)?
        .with_min_confidence(settings.min_confidence)
        .with_iou_threshold(settings.iou_threshold);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow::anyhow!(
        "tract backend requires the backend-tract feature"
    ))
}
