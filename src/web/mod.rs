//! The web module for the Axum API.
//! This file declares the other files in this directory as sub-modules.

pub mod api;
pub mod auth;
pub mod models;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use printfleet_shared::StoreError;

use crate::dispatch::DispatchError;
use crate::print_job::JobError;

/// Errors surfaced by handlers. Rendered as `{"error": ...}` with the matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!("Request failed: {}", detail);
        }
        api::json_error(&self.to_string(), self.status())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::PrinterNotFound(_) | JobError::JobNotFound(_) => ApiError::NotFound(e.to_string()),
            JobError::InvalidUpload(msg) => ApiError::BadRequest(msg),
            JobError::Dispatch {
                source: DispatchError::Internal(detail),
                ..
            } => ApiError::Internal(detail),
            JobError::Dispatch { source, .. } => ApiError::BadRequest(source.to_string()),
            JobError::Store(store) => store.into(),
            JobError::Task(detail) => ApiError::Internal(detail),
        }
    }
}
