//! Shared configuration logic for the host and tests.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [metrics]
//! username = "scraper"
//! password = "s3cret"
//! bambu_enabled = false
//!
//! [[printers]]
//! id = 1
//! name = "mk4-left"
//! type = "PRUSA"
//! ip_address = "192.168.1.40"
//! auth_token = "apikey"
//! ```
//!
//! Environment variables prefixed with `PRINTFLEET_` override the file after loading.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{InventorySummary, Printer};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub bambu: BambuConfig,
    #[serde(default)]
    pub prusa: PrusaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub printers: Vec<Printer>,
    #[serde(default)]
    pub inventory: InventorySummary,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// HS256 secret for API bearer tokens. A random secret is generated at startup when unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

/// Scrape endpoint settings. `/metrics` is disabled unless both credentials are set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub prusa_enabled: bool,
    #[serde(default = "default_true")]
    pub bambu_enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            prusa_enabled: true,
            bambu_enabled: true,
        }
    }
}

impl MetricsConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BambuConfig {
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_ftps_port")]
    pub ftps_port: u16,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_status_idle_secs")]
    pub status_idle_secs: u64,
    #[serde(default = "default_ftps_timeout_secs")]
    pub ftps_timeout_secs: u64,
    /// Explicit curl binary; searched on PATH when unset.
    #[serde(default)]
    pub curl_path: Option<String>,
}

impl Default for BambuConfig {
    fn default() -> Self {
        Self {
            mqtt_port: default_mqtt_port(),
            ftps_port: default_ftps_port(),
            sync_interval_secs: default_sync_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            status_idle_secs: default_status_idle_secs(),
            ftps_timeout_secs: default_ftps_timeout_secs(),
            curl_path: None,
        }
    }
}

impl BambuConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn status_idle(&self) -> Duration {
        Duration::from_secs(self.status_idle_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrusaConfig {
    #[serde(default = "default_scrape_timeout_secs")]
    pub scrape_timeout_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_confirm_polls")]
    pub confirm_polls: u32,
    #[serde(default = "default_confirm_interval_ms")]
    pub confirm_interval_ms: u64,
}

impl Default for PrusaConfig {
    fn default() -> Self {
        Self {
            scrape_timeout_secs: default_scrape_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
            confirm_polls: default_confirm_polls(),
            confirm_interval_ms: default_confirm_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: default_public_base_url(),
            presign_ttl_secs: default_presign_ttl_secs(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for printer in &self.printers {
            if !seen.insert(printer.ip_address.as_str()) {
                return Err(format!("Duplicate printer ip_address '{}'", printer.ip_address));
            }
        }
        if self.bambu.sync_interval_secs == 0 {
            return Err("bambu.sync_interval_secs must be > 0".to_string());
        }
        if self.prusa.scrape_timeout_secs == 0 || self.prusa.status_timeout_secs == 0 {
            return Err("prusa timeouts must be > 0".to_string());
        }
        Ok(())
    }

    /// Apply `PRINTFLEET_*` overrides from `lookup`. Unparseable toggles are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PRINTFLEET_METRICS_USERNAME") {
            self.metrics.username = Some(v);
        }
        if let Some(v) = lookup("PRINTFLEET_METRICS_PASSWORD") {
            self.metrics.password = Some(v);
        }
        if let Some(v) = lookup("PRINTFLEET_METRICS_PRUSA_ENABLED") {
            apply_toggle("PRINTFLEET_METRICS_PRUSA_ENABLED", &v, &mut self.metrics.prusa_enabled);
        }
        if let Some(v) = lookup("PRINTFLEET_METRICS_BAMBU_ENABLED") {
            apply_toggle("PRINTFLEET_METRICS_BAMBU_ENABLED", &v, &mut self.metrics.bambu_enabled);
        }
        if let Some(v) = lookup("PRINTFLEET_JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Some(v) = lookup("PRINTFLEET_BIND") {
            self.server.bind = v;
        }
    }
}

fn apply_toggle(name: &str, raw: &str, target: &mut bool) {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        other => tracing::warn!("Ignoring {}={:?}: expected a boolean", name, other),
    }
}

fn default_true() -> bool { true }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_max_upload_bytes() -> usize { 512 * 1024 * 1024 }
fn default_mqtt_port() -> u16 { 8883 }
fn default_ftps_port() -> u16 { 990 }
fn default_sync_interval_secs() -> u64 { 60 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_command_timeout_secs() -> u64 { 15 }
fn default_status_idle_secs() -> u64 { 300 }
fn default_ftps_timeout_secs() -> u64 { 300 }
fn default_scrape_timeout_secs() -> u64 { 10 }
fn default_status_timeout_secs() -> u64 { 5 }
fn default_upload_timeout_secs() -> u64 { 300 }
fn default_confirm_polls() -> u32 { 4 }
fn default_confirm_interval_ms() -> u64 { 750 }
fn default_storage_root() -> String { "data/objects".to_string() }
fn default_public_base_url() -> String { "http://localhost:8080/files".to_string() }
fn default_presign_ttl_secs() -> u64 { 3600 }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PrinterType;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.bambu.mqtt_port, 8883);
        assert_eq!(config.prusa.confirm_polls, 4);
        assert!(config.metrics.prusa_enabled && config.metrics.bambu_enabled);
        assert!(config.metrics.credentials().is_none());
        assert!(config.printers.is_empty());
    }

    #[test]
    fn parses_roster_and_sections() {
        let file = write_config(
            r#"
[metrics]
username = "scraper"
password = "s3cret"
bambu_enabled = false

[[printers]]
id = 7
name = "x1c"
type = "BAMBU"
ip_address = "10.0.0.7"
auth_token = "12345678"
serial_number = "01S00A000000001"

[inventory]
items_total = 3
quantity_total = 4.5
locations_total = 1
tags_total = 2
"#,
        );
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.metrics.credentials(), Some(("scraper", "s3cret")));
        assert!(!config.metrics.bambu_enabled);
        assert_eq!(config.printers.len(), 1);
        assert_eq!(config.printers[0].printer_type, PrinterType::Bambu);
        assert_eq!(config.printers[0].serial(), Some("01S00A000000001"));
        assert_eq!(config.inventory.items_total, 3);
    }

    #[test]
    fn duplicate_ip_is_rejected() {
        let file = write_config(
            r#"
[[printers]]
id = 1
name = "a"
type = "PRUSA"
ip_address = "10.0.0.1"

[[printers]]
id = 2
name = "b"
type = "PRUSA"
ip_address = "10.0.0.1"
"#,
        );
        let err = load_config(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_and_bad_toml_are_distinguished() {
        assert!(matches!(load_config("/nonexistent/printfleet.toml"), Err(ConfigError::Io(_))));
        let file = write_config("[server\nbind = 1");
        assert!(matches!(
            load_config(file.path().to_str().unwrap()),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PRINTFLEET_METRICS_USERNAME", "u"),
            ("PRINTFLEET_METRICS_PASSWORD", "p"),
            ("PRINTFLEET_METRICS_PRUSA_ENABLED", "false"),
            ("PRINTFLEET_METRICS_BAMBU_ENABLED", "maybe"),
            ("PRINTFLEET_BIND", "127.0.0.1:9000"),
        ]);
        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.metrics.credentials(), Some(("u", "p")));
        assert!(!config.metrics.prusa_enabled);
        // unparseable toggle leaves the default
        assert!(config.metrics.bambu_enabled);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert!(config.auth.jwt_secret.is_none());
    }
}
