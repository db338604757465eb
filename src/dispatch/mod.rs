//! Print dispatch: file upload and print start for both printer families.

pub mod bambu;
pub mod ftps;
pub mod prusa;
pub mod validation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use printfleet_shared::PrinterType;

use crate::bambu::BambuError;

pub use bambu::{BambuDispatcher, BambuDispatchSettings};
pub use ftps::{CurlFtpsUploader, FileTransfer};
pub use prusa::{PrusaDispatchSettings, PrusaDispatcher};

/// Longest device message carried into job rows and API errors.
pub const MAX_DEVICE_MESSAGE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    UploadOnly,
    StartOnly,
    UploadAndStart,
}

impl DispatchMode {
    pub fn uploads(&self) -> bool {
        !matches!(self, DispatchMode::StartOnly)
    }

    pub fn starts(&self) -> bool {
        !matches!(self, DispatchMode::UploadOnly)
    }
}

impl FromStr for DispatchMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload_only" => Ok(DispatchMode::UploadOnly),
            "start_only" => Ok(DispatchMode::StartOnly),
            "upload_and_start" => Ok(DispatchMode::UploadAndStart),
            other => Err(DispatchError::Validation(format!("unknown dispatch mode '{}'", other))),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchMode::UploadOnly => "upload_only",
            DispatchMode::StartOnly => "start_only",
            DispatchMode::UploadAndStart => "upload_and_start",
        };
        f.write_str(s)
    }
}

/// Bambu-only print options.
#[derive(Debug, Clone, PartialEq)]
pub struct BambuStartOptions {
    pub plate: u32,
    pub use_ams: bool,
    pub ams_mapping: Vec<i32>,
}

impl Default for BambuStartOptions {
    fn default() -> Self {
        Self {
            plate: 1,
            use_ams: false,
            ams_mapping: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub printer_type: PrinterType,
    pub ip_address: String,
    pub file: Vec<u8>,
    pub filename: String,
    pub credential: String,
    pub serial: Option<String>,
    pub mode: DispatchMode,
    pub bambu: BambuStartOptions,
}

/// What the device accepted; persisted as the job's `dispatch_response`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub mode: DispatchMode,
    pub storage: Option<String>,
    pub remote_path: Option<String>,
    pub started: bool,
    /// Whether the printer was observed printing after the start command.
    pub confirmed: Option<bool>,
    pub detail: String,
}

impl DispatchReceipt {
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.detail.clone())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("printer is busy ({0})")]
    Busy(String),

    #[error("printer unreachable: {0}")]
    Unreachable(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("print start failed: {0}")]
    Start(String),

    #[error("dispatch failed: {0}")]
    Internal(String),
}

impl From<BambuError> for DispatchError {
    fn from(e: BambuError) -> Self {
        match e {
            BambuError::Invalid { .. } => DispatchError::Validation(e.to_string()),
            BambuError::Upload(msg) => DispatchError::Upload(sanitize_device_message(&msg)),
            BambuError::ConnectionFailed(msg) | BambuError::Timeout(msg) => {
                DispatchError::Unreachable(sanitize_device_message(&msg))
            }
            other => DispatchError::Start(sanitize_device_message(&other.to_string())),
        }
    }
}

/// Percent-encode `segment` for use as a single URL path segment.
pub fn encode_path_segment(segment: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse("http://device/") else {
        return segment.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}

/// Strip NUL bytes and cap the length of text coming back from a device.
pub fn sanitize_device_message(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| *c != '\0').collect();
    let trimmed = cleaned.trim();
    if trimmed.chars().count() <= MAX_DEVICE_MESSAGE {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_DEVICE_MESSAGE).collect();
    out.push_str("...");
    out
}

#[async_trait]
pub trait PrintDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}

/// Routes requests to the protocol of the target printer.
pub struct FleetDispatcher {
    prusa: PrusaDispatcher,
    bambu: BambuDispatcher,
}

impl FleetDispatcher {
    pub fn new(prusa: PrusaDispatcher, bambu: BambuDispatcher) -> Self {
        Self { prusa, bambu }
    }
}

#[async_trait]
impl PrintDispatcher for FleetDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        tracing::info!(
            "Dispatching {} to {} printer at {} ({})",
            request.filename,
            request.printer_type,
            request.ip_address,
            request.mode
        );
        match request.printer_type {
            PrinterType::Prusa => self.prusa.dispatch(&request).await,
            PrinterType::Bambu => self.bambu.dispatch(&request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(encode_path_segment("cube.gcode"), "cube.gcode");
        assert_eq!(encode_path_segment("my part #2?.gcode"), "my%20part%20%232%3F.gcode");
        assert_eq!(encode_path_segment("100%.bgcode"), "100%25.bgcode");
    }

    #[test]
    fn modes_parse_and_flag_phases() {
        let mode: DispatchMode = "upload_only".parse().unwrap();
        assert!(mode.uploads() && !mode.starts());
        let mode: DispatchMode = "start_only".parse().unwrap();
        assert!(!mode.uploads() && mode.starts());
        assert!("print_now".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn device_messages_are_sanitized() {
        assert_eq!(sanitize_device_message("bad\0 file\0"), "bad file");
        let long = "x".repeat(MAX_DEVICE_MESSAGE + 20);
        let out = sanitize_device_message(&long);
        assert_eq!(out.len(), MAX_DEVICE_MESSAGE + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn bambu_errors_map_to_dispatch_errors() {
        let e: DispatchError = BambuError::Invalid {
            field: "serial number",
            reason: "must be alphanumeric".into(),
        }
        .into();
        assert!(matches!(e, DispatchError::Validation(_)));
        let e: DispatchError = BambuError::Timeout("connect".into()).into();
        assert!(matches!(e, DispatchError::Unreachable(_)));
    }
}
