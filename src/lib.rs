//! Planti Vision
//!
//! Object-detection service for plant images. A client submits an image
//! (multipart upload or a host-local path), a detector produces raw
//! detections, and the aggregator reduces them to a [`DetectionSummary`]
//! above a confidence threshold.
//!
//! # Module Structure
//!
//! - `detect`: detector backends (stub, tract/ONNX), class catalog, YOLO head decoding
//! - `aggregate`: threshold filtering and summary statistics
//! - `service`: the shared analysis service (detector handle, staging, limits)
//! - `api`: axum router and server handle
//! - `batch`: directory-wide analysis with per-class totals
//! - `annotate`: prediction images with boxes and labels drawn in
//! - `config`: TOML + environment configuration

pub mod aggregate;
pub mod annotate;
pub mod api;
pub mod batch;
pub mod config;
pub mod detect;
pub mod error;
pub mod service;

pub use aggregate::{aggregate, DetectionSummary, SummaryDetection, NO_DETECTION};
pub use api::{build_router, ApiConfig, ApiHandle, ApiServer, BestResult, ErrorBody};
pub use annotate::Annotator;
pub use batch::{analyze_directory, analyze_directory_with_predictions, BatchReport, PredictionOutput};
pub use config::{BackendKind, DetectorSettings, ServiceConfig};
pub use detect::{build_backend, ClassCatalog, DetectorBackend, RawDetection, StubBackend};
pub use error::AnalyzeError;
pub use service::{AnalysisService, StagedImage};
