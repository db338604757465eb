//! Axum routes and handlers.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::authorization::{Basic, Bearer};
use axum_extra::headers::Authorization;
use std::sync::Arc;
use std::time::Duration;

use printfleet_shared::api_models::{PoolSyncResponse, PrintJobResponse, PrinterStatusResponse};
use printfleet_shared::{AuthBackend, Printer, PrinterRoster, PrinterType};

use super::auth::{bearer_user, check_metrics_auth};
use super::models::{PrintForm, ReprintRequest, EXPOSITION_CONTENT_TYPE};
use super::ApiError;
use crate::bambu::status_cache::{STATUS_ONLINE, STATUS_UNREACHABLE};
use crate::bambu::{BambuMqttPool, BambuStatusCache};
use crate::metrics::MetricsOrchestrator;
use crate::print_job::{PrintJobManager, SubmitPrint};
use crate::prusa::PrusaClient;

/// Helper to create a JSON error response with a message and status code
pub fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub struct AppStateInner {
    pub roster: Arc<dyn PrinterRoster>,
    pub metrics: Arc<MetricsOrchestrator>,
    /// Scrape account; `/metrics` answers 404 while unset.
    pub metrics_auth: Option<Box<dyn AuthBackend>>,
    pub jwt_secret: Vec<u8>,
    pub jobs: Arc<PrintJobManager>,
    pub bambu_pool: Arc<BambuMqttPool>,
    pub bambu_status: Arc<BambuStatusCache>,
    pub prusa: PrusaClient,
    pub prusa_status_timeout: Duration,
    pub http: reqwest::Client,
    pub max_upload_bytes: usize,
}
pub type AppState = Arc<AppStateInner>;

pub fn create_router_with_state(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes;
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/printers/{id}/status", get(printer_status))
        .route(
            "/api/v1/printers/{id}/print",
            post(submit_print).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/v1/printers/{id}/webcam", get(webcam_proxy))
        .route("/api/v1/jobs/{id}/reprint", post(reprint_job))
        .route("/api/v1/jobs/{id}/download", get(download_link))
        .route("/api/v1/bambu/sync", post(bambu_sync))
        .with_state(state)
}

/// For tests: the router over a prepared state.
pub fn app_with_state(state: AppState) -> Router {
    create_router_with_state(state)
}

/// GET /metrics
async fn metrics_handler(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
) -> Response {
    if let Err(rejection) = check_metrics_auth(state.metrics_auth.as_deref(), auth).await {
        return rejection;
    }
    let body = state.metrics.render().await;
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
}

async fn load_printer(state: &AppState, id: i64) -> Result<Printer, ApiError> {
    state
        .roster
        .get_printer(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("printer {} not found", id)))
}

/// GET /api/v1/printers/{id}/status
async fn printer_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, ApiError> {
    bearer_user(&state.jwt_secret, auth)?;
    let printer = load_printer(&state, id).await?;

    let response = match printer.printer_type {
        PrinterType::Bambu => {
            let serial = printer
                .serial()
                .ok_or_else(|| ApiError::BadRequest("printer has no serial number".to_string()))?;
            let view = state.bambu_status.query(serial, &state.bambu_pool).await;
            let status = match view.gcode_state.as_deref() {
                Some(gcode_state) if view.status == STATUS_ONLINE => gcode_state.to_string(),
                _ => view.status.clone(),
            };
            PrinterStatusResponse {
                printer_id: printer.id,
                printer_type: printer.printer_type,
                status,
                details: serde_json::to_value(&view).ok(),
            }
        }
        PrinterType::Prusa => {
            let probe = state
                .prusa
                .get_json::<serde_json::Value>(
                    &printer.ip_address,
                    printer.credential(),
                    "/api/v1/status",
                    state.prusa_status_timeout,
                )
                .await;
            match probe {
                Ok(body) => PrinterStatusResponse {
                    printer_id: printer.id,
                    printer_type: printer.printer_type,
                    status: body["printer"]["state"].as_str().unwrap_or("UNKNOWN").to_string(),
                    details: Some(body),
                },
                Err(e) => {
                    tracing::warn!("Status check of {} failed: {}", printer.name, e);
                    PrinterStatusResponse {
                        printer_id: printer.id,
                        printer_type: printer.printer_type,
                        status: STATUS_UNREACHABLE.to_string(),
                        details: None,
                    }
                }
            }
        }
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// POST /api/v1/printers/{id}/print
async fn submit_print(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let user_id = bearer_user(&state.jwt_secret, auth)?;
    let form = PrintForm::read(&mut multipart).await?;
    let job = state
        .jobs
        .submit(
            id,
            SubmitPrint {
                user_id,
                filename: form.filename,
                bytes: form.bytes,
                mode: form.mode,
                bambu: form.bambu,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(PrintJobResponse::from(job))).into_response())
}

/// POST /api/v1/jobs/{id}/reprint
async fn reprint_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user_id = bearer_user(&state.jwt_secret, auth)?;
    let request: ReprintRequest = if body.is_empty() {
        ReprintRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let job = state
        .jobs
        .reprint(id, &user_id, request.mode(), request.bambu())
        .await?;
    Ok((StatusCode::CREATED, Json(PrintJobResponse::from(job))).into_response())
}

/// GET /api/v1/jobs/{id}/download
async fn download_link(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, ApiError> {
    bearer_user(&state.jwt_secret, auth)?;
    let link = state.jobs.download_link(id).await?;
    Ok((StatusCode::OK, Json(link)).into_response())
}

/// GET /api/v1/printers/{id}/webcam
///
/// Streams the upstream body; when the client goes away the stream is dropped and the
/// upstream request with it.
async fn webcam_proxy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, ApiError> {
    bearer_user(&state.jwt_secret, auth)?;
    let printer = load_printer(&state, id).await?;
    let url = printer
        .webcam_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::NotFound("printer has no webcam".to_string()))?;

    let upstream = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::BadGateway(format!("webcam unreachable: {}", e)))?;
    if !upstream.status().is_success() {
        return Err(ApiError::BadGateway(format!("webcam returned {}", upstream.status())));
    }
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = Body::from_stream(upstream.bytes_stream());
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// POST /api/v1/bambu/sync
async fn bambu_sync(
    State(state): State<AppState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Response, ApiError> {
    bearer_user(&state.jwt_secret, auth)?;
    let report = state
        .bambu_pool
        .sync()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    Ok((
        StatusCode::OK,
        Json(PoolSyncResponse {
            pooled_printers: report.pooled,
        }),
    )
        .into_response())
}
