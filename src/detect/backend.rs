use std::path::Path;

use anyhow::Result;

use super::catalog::ClassCatalog;
use super::result::RawDetection;

/// Detector backend trait.
///
/// A backend is loaded once at startup and then shared by every request.
/// `infer` takes `&mut self`, so callers serialize access to one instance;
/// implementations do not need to be reentrant.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Class catalog the backend labels its detections with.
    fn catalog(&self) -> &ClassCatalog;

    /// Run detection on the image stored at `image_path`.
    ///
    /// Unreadable or corrupt images are reported as errors. Detections are
    /// returned in the order the backend ranks them.
    fn infer(&mut self, image_path: &Path) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
