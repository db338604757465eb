//! PrusaLink dispatch.
//!
//! Firmware generations disagree on upload and start endpoints, so both phases walk an ordered
//! candidate list. Which statuses move on to the next candidate and which abort is fixed by
//! [`UploadCandidate::should_continue`].

use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{encode_path_segment, sanitize_device_message, DispatchError, DispatchReceipt, DispatchRequest};
use crate::prusa::models::StatusV1;
use crate::prusa::{PrusaClient, PrusaError};

pub const DEFAULT_STORAGE: &str = "local";
pub const FALLBACK_STORAGES: [&str; 2] = ["local", "usb"];
pub const BLOCKED_STATES: &[&str] = &["PRINTING", "PAUSED", "BUSY", "ATTENTION"];
pub const CONFIRMED_STATES: &[&str] = &["PRINTING", "PAUSED"];

#[derive(Debug, Clone)]
pub struct PrusaDispatchSettings {
    pub status_timeout: Duration,
    pub upload_timeout: Duration,
    pub confirm_polls: u32,
    pub confirm_interval: Duration,
}

impl Default for PrusaDispatchSettings {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(300),
            confirm_polls: 4,
            confirm_interval: Duration::from_millis(750),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadVariant {
    /// `PUT /api/v1/files/{storage}/{name}` with the raw file as body.
    PutV1,
    /// `POST /api/files/{storage}` multipart (legacy OctoPrint-style API).
    PostLegacy,
    /// `POST /api/v1/files/{storage}` multipart.
    PostV1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    pub storage: String,
    pub variant: UploadVariant,
}

impl UploadCandidate {
    pub fn method(&self) -> Method {
        match self.variant {
            UploadVariant::PutV1 => Method::PUT,
            UploadVariant::PostLegacy | UploadVariant::PostV1 => Method::POST,
        }
    }

    /// Request path with storage and file name percent-encoded.
    pub fn path(&self, filename: &str) -> String {
        let storage = encode_path_segment(&self.storage);
        match self.variant {
            UploadVariant::PutV1 => format!("/api/v1/files/{}/{}", storage, encode_path_segment(filename)),
            UploadVariant::PostLegacy => format!("/api/files/{}", storage),
            UploadVariant::PostV1 => format!("/api/v1/files/{}", storage),
        }
    }

    /// Statuses that mean "this endpoint shape is wrong here", as opposed to a real rejection.
    pub fn should_continue(&self, status: u16) -> bool {
        if matches!(status, 403 | 404 | 410) {
            return true;
        }
        self.variant == UploadVariant::PutV1
            && (matches!(status, 405 | 408 | 415 | 422) || (500..600).contains(&status))
    }
}

/// Storage candidates: the detected one first, then the fallbacks, without duplicates.
pub fn storage_candidates(detected: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for storage in std::iter::once(detected).chain(FALLBACK_STORAGES) {
        if !storage.is_empty() && !out.iter().any(|s| s == storage) {
            out.push(storage.to_string());
        }
    }
    out
}

pub fn upload_candidates(detected: &str) -> Vec<UploadCandidate> {
    storage_candidates(detected)
        .into_iter()
        .flat_map(|storage| {
            [UploadVariant::PutV1, UploadVariant::PostLegacy, UploadVariant::PostV1]
                .into_iter()
                .map(move |variant| UploadCandidate {
                    storage: storage.clone(),
                    variant,
                })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartVariant {
    /// `POST /api/v1/files/{storage}/{name}`
    V1,
    /// `POST /api/files/{storage}/{name}` with `{"command":"select","print":true}`.
    LegacySelect,
}

pub fn start_candidates() -> [StartVariant; 2] {
    [StartVariant::V1, StartVariant::LegacySelect]
}

fn start_path(variant: StartVariant, storage: &str, filename: &str) -> String {
    let (storage, filename) = (encode_path_segment(storage), encode_path_segment(filename));
    match variant {
        StartVariant::V1 => format!("/api/v1/files/{}/{}", storage, filename),
        StartVariant::LegacySelect => format!("/api/files/{}/{}", storage, filename),
    }
}

/// State and storage read before touching the printer.
#[derive(Debug, Clone, PartialEq)]
pub struct Preflight {
    pub state: Option<String>,
    pub storage: String,
}

pub struct PrusaDispatcher {
    client: PrusaClient,
    settings: PrusaDispatchSettings,
}

impl PrusaDispatcher {
    pub fn new(client: PrusaClient, settings: PrusaDispatchSettings) -> Self {
        Self { client, settings }
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let address = request.ip_address.as_str();
        let key = request.credential.as_str();
        let filename = request.filename.as_str();
        if filename.is_empty() || filename.contains('/') || filename.contains("..") {
            return Err(DispatchError::Validation(format!("invalid filename '{}'", filename)));
        }

        let preflight = self.preflight(address, key).await?;
        if let Some(state) = preflight.state.as_deref() {
            if BLOCKED_STATES.contains(&state) {
                return Err(DispatchError::Busy(state.to_string()));
            }
        }

        let storage = if request.mode.uploads() {
            self.upload(address, key, filename, &request.file, &preflight.storage).await?
        } else {
            preflight.storage.clone()
        };

        let mut receipt = DispatchReceipt {
            mode: request.mode,
            storage: Some(storage.clone()),
            remote_path: Some(format!("{}/{}", storage, filename)),
            started: false,
            confirmed: None,
            detail: format!("uploaded to {}/{}", storage, filename),
        };
        if !request.mode.uploads() {
            receipt.detail = format!("selected {}/{}", storage, filename);
        }

        if request.mode.starts() {
            let endpoint = self.start(address, key, filename, &storage).await?;
            receipt.started = true;
            let confirmed = self.confirm(address, key).await;
            receipt.confirmed = confirmed;
            receipt.detail = format!("{}; started via {}", receipt.detail, endpoint);
        }
        info!("Prusa dispatch to {} finished: {}", address, receipt.detail);
        Ok(receipt)
    }

    /// Read the printer state and storage. Transport failures mean the printer is unreachable;
    /// an error status only loses the storage hint.
    pub async fn preflight(&self, address: &str, key: &str) -> Result<Preflight, DispatchError> {
        match self
            .client
            .get_json::<StatusV1>(address, key, "/api/v1/status", self.settings.status_timeout)
            .await
        {
            Ok(status) => Ok(Preflight {
                state: status.state().map(|s| s.to_ascii_uppercase()),
                storage: status.storage_name().unwrap_or_else(|| DEFAULT_STORAGE.to_string()),
            }),
            Err(PrusaError::Request(e)) => Err(DispatchError::Unreachable(sanitize_device_message(&e.to_string()))),
            Err(e) => {
                warn!("Status probe on {} failed, assuming '{}' storage: {}", address, DEFAULT_STORAGE, e);
                Ok(Preflight {
                    state: None,
                    storage: DEFAULT_STORAGE.to_string(),
                })
            }
        }
    }

    fn upload_request(&self, candidate: &UploadCandidate, address: &str, key: &str, filename: &str, bytes: &[u8]) -> Result<RequestBuilder, DispatchError> {
        let builder = self.client.request(
            candidate.method(),
            address,
            key,
            &candidate.path(filename),
            self.settings.upload_timeout,
        );
        Ok(match candidate.variant {
            UploadVariant::PutV1 => builder
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .header("Print-After-Upload", "?0")
                .body(bytes.to_vec()),
            UploadVariant::PostLegacy | UploadVariant::PostV1 => {
                let part = Part::bytes(bytes.to_vec())
                    .file_name(filename.to_string())
                    .mime_str("application/octet-stream")
                    .map_err(|e| DispatchError::Upload(e.to_string()))?;
                builder.multipart(Form::new().part("file", part).text("print", "false"))
            }
        })
    }

    /// Upload through the first candidate that accepts the file. Returns its storage.
    pub async fn upload(&self, address: &str, key: &str, filename: &str, bytes: &[u8], detected: &str) -> Result<String, DispatchError> {
        let mut last = String::new();
        for candidate in upload_candidates(detected) {
            let path = candidate.path(filename);
            let response = self
                .upload_request(&candidate, address, key, filename, bytes)?
                .send()
                .await
                .map_err(|e| DispatchError::Unreachable(sanitize_device_message(&e.to_string())))?;
            let status = response.status().as_u16();
            if response.status().is_success() || status == 409 {
                debug!("{} {} accepted upload ({})", candidate.method(), path, status);
                return Ok(candidate.storage);
            }
            if candidate.should_continue(status) {
                debug!("{} {} returned {}, trying next candidate", candidate.method(), path, status);
                last = format!("{} {} returned {}", candidate.method(), path, status);
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Upload(sanitize_device_message(&format!(
                "{} {} returned {}: {}",
                candidate.method(),
                path,
                status,
                body
            ))));
        }
        Err(DispatchError::Upload(format!("no upload endpoint accepted the file (last: {})", last)))
    }

    /// Start the print through the first endpoint answering 2xx. Returns the endpoint used.
    pub async fn start(&self, address: &str, key: &str, filename: &str, storage: &str) -> Result<String, DispatchError> {
        let mut failures = Vec::new();
        for variant in start_candidates() {
            let path = start_path(variant, storage, filename);
            let builder = self.client.request(Method::POST, address, key, &path, self.settings.status_timeout);
            let builder = match variant {
                StartVariant::V1 => builder,
                StartVariant::LegacySelect => builder.json(&serde_json::json!({"command": "select", "print": true})),
            };
            match builder.send().await {
                Ok(response) if response.status().is_success() => return Ok(format!("POST {}", path)),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    debug!("POST {} returned {}", path, status);
                    failures.push(format!("POST {} returned {} {}", path, status, body.trim()));
                }
                Err(e) => failures.push(format!("POST {} failed: {}", path, e)),
            }
        }
        Err(DispatchError::Start(sanitize_device_message(&failures.join("; "))))
    }

    /// Poll until the printer reports printing. `None` when every poll failed.
    async fn confirm(&self, address: &str, key: &str) -> Option<bool> {
        let mut observed = false;
        for _ in 0..self.settings.confirm_polls {
            tokio::time::sleep(self.settings.confirm_interval).await;
            match self
                .client
                .get_json::<StatusV1>(address, key, "/api/v1/status", self.settings.status_timeout)
                .await
            {
                Ok(status) => {
                    observed = true;
                    if let Some(state) = status.state() {
                        if CONFIRMED_STATES.contains(&state.to_ascii_uppercase().as_str()) {
                            return Some(true);
                        }
                    }
                }
                Err(e) => debug!("Confirmation poll on {} failed: {}", address, e),
            }
        }
        if observed {
            warn!("Printer {} did not report printing after start", address);
            Some(false)
        } else {
            None
        }
    }
}
