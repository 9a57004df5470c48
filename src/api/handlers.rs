use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::aggregate::DetectionSummary;
use crate::error::AnalyzeError;
use crate::service::{accepted_extension, AnalysisService};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzePathRequest {
    file_path: Option<String>,
    threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    view: Option<String>,
}

/// Response body shape selected by `?view=`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponseView {
    Summary,
    Best,
}

impl ResponseView {
    fn from_query(query: Result<Query<ViewQuery>, QueryRejection>) -> Result<Self, AnalyzeError> {
        let Query(query) =
            query.map_err(|e| AnalyzeError::validation(format!("invalid query: {}", e.body_text())))?;
        match query.view.as_deref() {
            None | Some("summary") => Ok(ResponseView::Summary),
            Some("best") => Ok(ResponseView::Best),
            Some(other) => Err(AnalyzeError::validation(format!(
                "unknown view '{other}' (expected 'summary' or 'best')"
            ))),
        }
    }

    fn render(self, summary: DetectionSummary) -> Response {
        match self {
            ResponseView::Summary => Json(summary).into_response(),
            ResponseView::Best => Json(BestResult::from(&summary)).into_response(),
        }
    }
}

/// Legacy single-result body: `{"objectName", "confidence"}`, or `{}` when
/// nothing passed the threshold.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BestResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl From<&DetectionSummary> for BestResult {
    fn from(summary: &DetectionSummary) -> Self {
        if summary.is_empty() {
            return BestResult::default();
        }
        BestResult {
            object_name: Some(summary.best_class_name.clone()),
            confidence: summary.best_confidence(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AnalyzeError {
    fn into_response(self) -> Response {
        let status = match &self {
            AnalyzeError::Validation(_) => StatusCode::BAD_REQUEST,
            AnalyzeError::NotFound(_) => StatusCode::NOT_FOUND,
            AnalyzeError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AnalyzeError::Staging(_) | AnalyzeError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        if status.is_server_error() {
            log::error!(
                "analysis failed: {}: {}",
                body.error,
                body.details.as_deref().unwrap_or("")
            );
        } else {
            log::warn!("request rejected ({}): {}", status.as_u16(), body.error);
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    classes: usize,
    threshold: f64,
}

pub async fn health(State(service): State<Arc<AnalysisService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: service.backend_name(),
        classes: service.catalog().len(),
        threshold: service.threshold(),
    })
}

#[derive(Debug, Serialize)]
pub struct ClassesResponse {
    classes: Vec<String>,
}

pub async fn classes(State(service): State<Arc<AnalysisService>>) -> Json<ClassesResponse> {
    Json(ClassesResponse {
        classes: service.catalog().names().to_vec(),
    })
}

pub async fn analyze_path(
    State(service): State<Arc<AnalysisService>>,
    query: Result<Query<ViewQuery>, QueryRejection>,
    body: Result<Json<AnalyzePathRequest>, JsonRejection>,
) -> Result<Response, AnalyzeError> {
    let view = ResponseView::from_query(query)?;
    let Json(request) = body
        .map_err(|e| AnalyzeError::validation(format!("invalid JSON body: {}", e.body_text())))?;
    let file_path = request
        .file_path
        .filter(|path| !path.trim().is_empty())
        .ok_or_else(|| AnalyzeError::validation("\"filePath\" is required"))?;
    let threshold = service.resolve_threshold(request.threshold)?;

    let path = PathBuf::from(&file_path);
    let worker = service.clone();
    let summary = tokio::task::spawn_blocking(move || worker.analyze_path(&path, threshold))
        .await
        .map_err(|e| AnalyzeError::Inference(anyhow!("analysis task failed: {e}")))??;

    log::info!(
        "analyzed {}: {} detected, best {}",
        file_path,
        summary.total_detected,
        summary.best_class_name
    );
    Ok(view.render(summary))
}

pub async fn analyze_upload(
    State(service): State<Arc<AnalysisService>>,
    query: Result<Query<ViewQuery>, QueryRejection>,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Response, AnalyzeError> {
    let view = ResponseView::from_query(query)?;
    let mut multipart = multipart.map_err(|e| {
        AnalyzeError::validation(format!("invalid multipart body: {}", e.body_text()))
    })?;

    let limit = service.max_upload_bytes();
    let field_error = |err: MultipartError| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AnalyzeError::PayloadTooLarge { limit }
        } else {
            AnalyzeError::validation(format!("invalid multipart body: {}", err.body_text()))
        }
    };

    let mut upload = None;
    let mut requested_threshold = None;
    while let Some(field) = multipart.next_field().await.map_err(field_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    return Err(AnalyzeError::validation("no file selected"));
                }
                // Reject before the body is read.
                accepted_extension(&file_name)?;
                let bytes = field.bytes().await.map_err(field_error)?;
                upload = Some((file_name, bytes));
            }
            Some("threshold") => {
                let text = field.text().await.map_err(field_error)?;
                let value = text.trim().parse::<f64>().map_err(|_| {
                    AnalyzeError::validation(format!("threshold '{}' is not a number", text.trim()))
                })?;
                requested_threshold = Some(value);
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        upload.ok_or_else(|| AnalyzeError::validation("\"file\" field is required"))?;
    let threshold = service.resolve_threshold(requested_threshold)?;

    let worker = service.clone();
    let log_name = file_name.clone();
    let summary = tokio::task::spawn_blocking(move || {
        let staged = worker.stage_upload(&file_name, &bytes)?;
        worker.analyze_staged(&staged, threshold)
    })
    .await
    .map_err(|e| AnalyzeError::Inference(anyhow!("analysis task failed: {e}")))??;

    log::info!(
        "analyzed upload '{}': {} detected, best {}",
        log_name,
        summary.total_detected,
        summary.best_class_name
    );
    Ok(view.render(summary))
}
