//! PrusaLink response bodies.
//!
//! Every field is optional: firmware versions differ in what they report, and a missing field
//! only means the matching sample is skipped.

use serde::Deserialize;

/// `GET /api/version`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionResponse {
    pub api: Option<String>,
    pub server: Option<String>,
    pub text: Option<String>,
    pub hostname: Option<String>,
    pub original: Option<String>,
    pub firmware: Option<String>,
}

/// `GET /api/job`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobResponse {
    pub state: Option<String>,
    pub job: Option<JobInfo>,
    pub progress: Option<JobProgress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    #[serde(rename = "estimatedPrintTime")]
    pub estimated_print_time: Option<f64>,
    pub file: Option<JobFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobFile {
    pub name: Option<String>,
    pub display: Option<String>,
    pub path: Option<String>,
    pub size: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobProgress {
    /// 0.0 ..= 1.0
    pub completion: Option<f64>,
    #[serde(rename = "printTime")]
    pub print_time: Option<f64>,
    #[serde(rename = "printTimeLeft")]
    pub print_time_left: Option<f64>,
}

/// `GET /api/printer`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrinterResponse {
    pub temperature: Option<Temperatures>,
    pub telemetry: Option<Telemetry>,
    pub state: Option<PrinterState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Temperatures {
    pub tool0: Option<TempReading>,
    pub bed: Option<TempReading>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TempReading {
    pub actual: Option<f64>,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    #[serde(rename = "print-speed")]
    pub print_speed: Option<f64>,
    #[serde(rename = "z-height")]
    pub z_height: Option<f64>,
    pub material: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrinterState {
    pub text: Option<String>,
    pub flags: StateFlags,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateFlags {
    pub operational: bool,
    pub prepared: bool,
    pub paused: bool,
    pub printing: bool,
    pub cancelling: bool,
    pub pausing: bool,
    pub error: bool,
    pub sd_ready: bool,
    pub closed_or_error: bool,
    pub ready: bool,
    pub busy: bool,
    pub finished: bool,
    pub link_state: Option<bool>,
}

impl StateFlags {
    /// Flags in priority order; the 1-based position of the first set flag is the state value.
    pub fn ordered(&self) -> [(&'static str, bool); 12] {
        [
            ("operational", self.operational),
            ("prepared", self.prepared),
            ("paused", self.paused),
            ("printing", self.printing),
            ("cancelling", self.cancelling),
            ("pausing", self.pausing),
            ("error", self.error),
            ("sdReady", self.sd_ready),
            ("closedOrError", self.closed_or_error),
            ("ready", self.ready),
            ("busy", self.busy),
            ("finished", self.finished),
        ]
    }

    pub fn state_value(&self) -> f64 {
        self.ordered()
            .iter()
            .position(|(_, set)| *set)
            .map(|i| (i + 1) as f64)
            .unwrap_or(0.0)
    }
}

/// `GET /api/v1/status`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusV1 {
    pub storage: Option<StorageV1>,
    pub printer: Option<PrinterV1>,
    pub job: Option<JobV1>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageV1 {
    pub name: Option<String>,
    pub path: Option<String>,
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrinterV1 {
    pub state: Option<String>,
    pub temp_nozzle: Option<f64>,
    pub target_nozzle: Option<f64>,
    pub temp_bed: Option<f64>,
    pub target_bed: Option<f64>,
    pub axis_z: Option<f64>,
    pub flow: Option<f64>,
    pub speed: Option<f64>,
    pub fan_hotend: Option<f64>,
    pub fan_print: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobV1 {
    pub id: Option<f64>,
    pub progress: Option<f64>,
    pub time_remaining: Option<f64>,
    pub time_printing: Option<f64>,
}

/// `GET /api/v1/info`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfoV1 {
    pub nozzle_diameter: Option<f64>,
    pub mmu: Option<bool>,
    pub serial: Option<String>,
    pub hostname: Option<String>,
    pub min_extrusion_temp: Option<f64>,
}

impl StatusV1 {
    pub fn state(&self) -> Option<&str> {
        self.printer.as_ref().and_then(|p| p.state.as_deref())
    }

    /// Storage name reported by the device, lower-cased, if any.
    pub fn storage_name(&self) -> Option<String> {
        let storage = self.storage.as_ref()?;
        storage
            .name
            .clone()
            .or_else(|| storage.path.as_ref().map(|p| p.trim_matches('/').to_string()))
            .map(|s| s.to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printing_beats_error() {
        let flags: StateFlags = serde_json::from_str(r#"{"printing": true, "error": true}"#).unwrap();
        assert_eq!(flags.state_value(), 4.0);
    }

    #[test]
    fn first_flag_wins_and_none_is_zero() {
        let flags: StateFlags =
            serde_json::from_str(r#"{"operational": true, "ready": true, "sdReady": true}"#).unwrap();
        assert_eq!(flags.state_value(), 1.0);
        assert_eq!(StateFlags::default().state_value(), 0.0);
        let flags: StateFlags = serde_json::from_str(r#"{"finished": true}"#).unwrap();
        assert_eq!(flags.state_value(), 12.0);
    }

    #[test]
    fn storage_name_falls_back_to_path() {
        let status: StatusV1 =
            serde_json::from_str(r#"{"storage": {"path": "/usb/", "read_only": false}, "printer": {"state": "IDLE"}}"#)
                .unwrap();
        assert_eq!(status.storage_name().as_deref(), Some("usb"));
        assert_eq!(status.state(), Some("IDLE"));
    }
}
