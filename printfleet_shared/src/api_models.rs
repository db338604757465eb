//! Shared data models for API requests and responses.

use serde::{Deserialize, Serialize};

use crate::models::{GcodePrintJob, PrinterType};

/// Response for `GET /api/v1/printers/{id}/status`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrinterStatusResponse {
    pub printer_id: i64,
    pub printer_type: PrinterType,
    /// Coarse state: device state string, "CONNECTING" or "UNREACHABLE".
    pub status: String,
    /// Protocol-specific snapshot (merged Bambu telemetry or the PrusaLink status body).
    pub details: Option<serde_json::Value>,
}

/// Response for job submission, reprint and lookup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrintJobResponse {
    pub id: i64,
    pub printer_id: i64,
    pub filename: String,
    pub status: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub dispatch_response: Option<String>,
    pub dispatch_error: Option<String>,
}

impl From<GcodePrintJob> for PrintJobResponse {
    fn from(job: GcodePrintJob) -> Self {
        Self {
            id: job.id,
            printer_id: job.printer_id,
            filename: job.filename,
            status: job.status.as_str().to_string(),
            content_hash: job.content_hash,
            size_bytes: job.size_bytes,
            dispatch_response: job.dispatch_response,
            dispatch_error: job.dispatch_error,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DownloadLinkResponse {
    pub url: String,
    pub expires_in_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolSyncResponse {
    pub pooled_printers: usize,
}
