//! Bambu Lab integration: MQTT pool, report normalizer and the listeners fed by it.

pub mod commands;
pub mod connection;
pub mod metrics;
pub mod normalizer;
pub mod pool;
pub mod status_cache;

use thiserror::Error;

pub use connection::{DeviceConnector, DeviceEvent, DeviceLink, DeviceSession, DeviceTarget, MqttConnector};
pub use metrics::BambuMetricsStore;
pub use normalizer::{apply_report, BambuSnapshot, TrayState};
pub use pool::{BambuMqttPool, ConnectionState, ListenerId, ReportListener};
pub use status_cache::{BambuStatusCache, StatusView};

/// Errors from Bambu printer operations.
#[derive(Error, Debug)]
pub enum BambuError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("roster unavailable: {0}")]
    Roster(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("FTPS upload failed: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BambuError>;
