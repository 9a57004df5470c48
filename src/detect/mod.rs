mod backend;
mod backends;
mod catalog;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::{build_backend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use catalog::ClassCatalog;
pub use result::{BoundingBox, RawDetection};
