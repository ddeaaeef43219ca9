//! Request failures and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::volume_index::NavigationError;

#[derive(Error, Debug)]
pub enum AppError {
    /// A required query parameter was absent or empty
    #[error("Missing {0}")]
    MissingParameter(&'static str),

    #[error("Volume not found in image paths: {0}")]
    VolumeNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Decoding or re-encoding failed; carries the underlying cause
    #[error("Failed to convert image: {0}")]
    ConversionFailed(String),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error("Invalid request body: {0}")]
    InvalidPayload(String),

    #[error("Annotation store error: {0:#}")]
    AnnotationStore(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingParameter(_) => "missing_parameter",
            AppError::VolumeNotFound(_) => "volume_not_found",
            AppError::ImageNotFound(_) => "image_not_found",
            AppError::ConversionFailed(_) => "conversion_failed",
            AppError::Navigation(NavigationError::NoVolumes) => "no_volumes",
            AppError::Navigation(NavigationError::UnknownVolume(_)) => "unknown_volume",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::AnnotationStore(_) => "annotation_store",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            AppError::Navigation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::VolumeNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ImageNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ConversionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::AnnotationStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("request failed kind={} err={}", self.kind(), self);
        }
        let body = json!({
            "status": "error",
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
