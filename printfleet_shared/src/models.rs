//! Records owned by the external store that the telemetry/dispatch core reads or writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::print_job::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrinterType {
    Prusa,
    Bambu,
}

impl fmt::Display for PrinterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterType::Prusa => write!(f, "PRUSA"),
            PrinterType::Bambu => write!(f, "BAMBU"),
        }
    }
}

/// A printer as listed in the roster.
///
/// `auth_token` is the PrusaLink API key for Prusa devices and the LAN access code for Bambu
/// devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub printer_type: PrinterType,
    pub ip_address: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub webcam_url: Option<String>,
    #[serde(default)]
    pub created_by_user_id: Option<String>,
}

impl Printer {
    pub fn credential(&self) -> &str {
        self.auth_token.as_deref().unwrap_or("")
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial_number.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcodePrintJob {
    pub id: i64,
    pub printer_id: i64,
    pub user_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub content_hash: String,
    pub size_bytes: u64,
    pub storage_key: String,
    pub dispatch_response: Option<String>,
    pub dispatch_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a job row in `STORED` state.
#[derive(Debug, Clone)]
pub struct NewPrintJob {
    pub printer_id: i64,
    pub user_id: String,
    pub filename: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub storage_key: String,
}

/// Aggregates reported by the inventory side of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub items_total: u64,
    pub quantity_total: f64,
    pub locations_total: u64,
    pub tags_total: u64,
    #[serde(default)]
    pub items_by_location: Vec<(String, u64)>,
}
