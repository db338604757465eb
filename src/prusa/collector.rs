//! Prusa scrape: one fan-out per printer, failures isolated per printer.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use printfleet_shared::Printer;

use super::client::PrusaClient;
use super::models::{InfoV1, JobResponse, PrinterResponse, StatusV1, VersionResponse};
use super::PrusaError;
use crate::exposition::{labels, FamilySet, Labels};

/// PrusaLink hostnames and the model they identify.
pub const MODEL_NAMES: &[(&str, &str)] = &[
    ("prusa-mk4", "MK4"),
    ("prusa-mk4s", "MK4S"),
    ("prusa-mk3.9", "MK3.9"),
    ("prusa-mk3.9s", "MK3.9S"),
    ("prusa-mk3.5", "MK3.5"),
    ("prusa-mk3.5s", "MK3.5S"),
    ("prusa-mk3", "MK3"),
    ("prusa-mk3s", "MK3S"),
    ("prusa-mini", "MINI"),
    ("prusa-xl", "XL"),
    ("prusa-core-one", "CORE One"),
    ("prusa-core-one-l", "CORE One L"),
];

pub const UNKNOWN_MODEL: &str = "unknown";

pub fn model_for_hostname(hostname: &str) -> String {
    MODEL_NAMES
        .iter()
        .find(|(host, _)| host.eq_ignore_ascii_case(hostname))
        .map(|(_, model)| model.to_string())
        .unwrap_or_else(|| hostname.to_string())
}

/// Last detected model per printer address.
#[derive(Debug, Default)]
pub struct ModelCache {
    models: RwLock<HashMap<String, String>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<String> {
        self.models.read().unwrap_or_else(|e| e.into_inner()).get(address).cloned()
    }

    pub fn set(&self, address: &str, model: &str) {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string(), model.to_string());
    }
}

pub struct PrusaCollector {
    client: PrusaClient,
    models: ModelCache,
    timeout: Duration,
}

/// Everything fetched for one reachable printer.
struct Scrape {
    version: VersionResponse,
    job: JobResponse,
    printer: PrinterResponse,
    status: Option<StatusV1>,
    info: Option<InfoV1>,
}

impl PrusaCollector {
    pub fn new(client: PrusaClient, timeout: Duration) -> Self {
        Self {
            client,
            models: ModelCache::new(),
            timeout,
        }
    }

    pub fn models(&self) -> &ModelCache {
        &self.models
    }

    /// Scrape all printers concurrently and render one exposition block.
    pub async fn collect(&self, printers: &[Printer]) -> String {
        let results = join_all(printers.iter().map(|p| async move { (p, self.scrape(p).await) })).await;

        let mut set = FamilySet::new();
        for (printer, result) in results {
            match result {
                Ok(scrape) => {
                    let model = self.detect_model(printer, &scrape);
                    let base = printer_labels(printer, &model);
                    set.gauge("prusa_up", "Printer answered the PrusaLink API", base.clone(), 1.0);
                    render_scrape(&mut set, &base, &scrape);
                }
                Err(e) => {
                    warn!("Prusa printer {} ({}) unreachable: {}", printer.name, printer.ip_address, e);
                    let model = self.models.get(&printer.ip_address).unwrap_or_else(|| UNKNOWN_MODEL.to_string());
                    set.gauge("prusa_up", "Printer answered the PrusaLink API", printer_labels(printer, &model), 0.0);
                }
            }
        }
        set.render()
    }

    async fn scrape(&self, printer: &Printer) -> Result<Scrape, PrusaError> {
        let address = printer.ip_address.as_str();
        let key = printer.credential();
        let (job, state, version) = tokio::try_join!(
            self.client.get_json::<JobResponse>(address, key, "/api/job", self.timeout),
            self.client.get_json::<PrinterResponse>(address, key, "/api/printer", self.timeout),
            self.client.get_json::<VersionResponse>(address, key, "/api/version", self.timeout),
        )?;

        let (status, info) = tokio::join!(
            self.client.get_json::<StatusV1>(address, key, "/api/v1/status", self.timeout),
            self.client.get_json::<InfoV1>(address, key, "/api/v1/info", self.timeout),
        );
        let status = status
            .map_err(|e| debug!("{}: /api/v1/status unavailable: {}", printer.name, e))
            .ok();
        let info = info
            .map_err(|e| debug!("{}: /api/v1/info unavailable: {}", printer.name, e))
            .ok();

        Ok(Scrape {
            version,
            job,
            printer: state,
            status,
            info,
        })
    }

    fn detect_model(&self, printer: &Printer, scrape: &Scrape) -> String {
        let hostname = scrape
            .version
            .hostname
            .as_deref()
            .or_else(|| scrape.info.as_ref().and_then(|i| i.hostname.as_deref()))
            .filter(|h| !h.is_empty());
        match hostname {
            Some(hostname) => {
                let model = model_for_hostname(hostname);
                self.models.set(&printer.ip_address, &model);
                model
            }
            None => self
                .models
                .get(&printer.ip_address)
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
        }
    }
}

fn printer_labels(printer: &Printer, model: &str) -> Labels {
    labels([
        ("printer_address", printer.ip_address.as_str()),
        ("printer_model", model),
        ("printer_name", printer.name.as_str()),
    ])
}

fn extend(base: &Labels, extra: &[(&str, &str)]) -> Labels {
    let mut out = base.clone();
    out.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    out
}

fn gauge_opt(set: &mut FamilySet, name: &str, help: &str, base: &Labels, value: Option<f64>) {
    if let Some(v) = value {
        set.gauge(name, help, base.clone(), v);
    }
}

fn render_scrape(set: &mut FamilySet, base: &Labels, scrape: &Scrape) {
    let v = &scrape.version;
    set.gauge(
        "prusa_info",
        "PrusaLink version information",
        extend(
            base,
            &[
                ("api", v.api.as_deref().unwrap_or("")),
                ("server", v.server.as_deref().unwrap_or("")),
                ("firmware", v.firmware.as_deref().unwrap_or("")),
                ("text", v.text.as_deref().unwrap_or("")),
            ],
        ),
        1.0,
    );

    let flags = scrape.printer.state.as_ref().map(|s| s.flags).unwrap_or_default();
    set.gauge(
        "prusa_printer_state_flag",
        "Highest-priority state flag (1 operational, 2 prepared, 3 paused, 4 printing, 5 cancelling, 6 pausing, 7 error, 8 sdReady, 9 closedOrError, 10 ready, 11 busy, 12 finished, 0 none)",
        base.clone(),
        flags.state_value(),
    );
    for (flag, on) in flags.ordered() {
        set.gauge(
            "prusa_printer_flag",
            "Raw PrusaLink state flags",
            extend(base, &[("flag", flag)]),
            if on { 1.0 } else { 0.0 },
        );
    }

    if let Some(temps) = &scrape.printer.temperature {
        let tool = temps.tool0.unwrap_or_default();
        let bed = temps.bed.unwrap_or_default();
        gauge_opt(set, "prusa_nozzle_temperature_celsius", "Nozzle temperature", base, tool.actual);
        gauge_opt(set, "prusa_nozzle_target_temperature_celsius", "Nozzle target temperature", base, tool.target);
        gauge_opt(set, "prusa_bed_temperature_celsius", "Bed temperature", base, bed.actual);
        gauge_opt(set, "prusa_bed_target_temperature_celsius", "Bed target temperature", base, bed.target);
    }
    if let Some(t) = &scrape.printer.telemetry {
        gauge_opt(set, "prusa_print_speed_percent", "Print speed multiplier in percent", base, t.print_speed);
        gauge_opt(set, "prusa_z_height_mm", "Current Z height", base, t.z_height);
        if let Some(material) = t.material.as_deref().filter(|m| !m.is_empty()) {
            set.gauge("prusa_material_info", "Loaded material", extend(base, &[("material", material)]), 1.0);
        }
    }

    if let Some(progress) = &scrape.job.progress {
        gauge_opt(set, "prusa_job_progress_ratio", "Job completion between 0 and 1", base, progress.completion);
        gauge_opt(set, "prusa_job_print_time_seconds", "Elapsed print time", base, progress.print_time);
        gauge_opt(set, "prusa_job_print_time_left_seconds", "Estimated remaining print time", base, progress.print_time_left);
    }
    if let Some(job) = &scrape.job.job {
        gauge_opt(set, "prusa_job_estimated_print_time_seconds", "Slicer estimate for the job", base, job.estimated_print_time);
        if let Some(file) = &job.file {
            if let Some(name) = file.name.as_deref() {
                let display = file.display.as_deref().unwrap_or(name);
                set.gauge("prusa_job_info", "File of the current job", extend(base, &[("file", name), ("display", display)]), 1.0);
            }
            gauge_opt(set, "prusa_job_file_size_bytes", "Size of the job file", base, file.size);
        }
    }

    if let Some(status) = &scrape.status {
        if let Some(state) = status.state() {
            set.gauge("prusa_status_info", "Printer state reported by /api/v1/status", extend(base, &[("state", state)]), 1.0);
        }
        if let Some(p) = &status.printer {
            gauge_opt(set, "prusa_axis_z_mm", "Z axis position", base, p.axis_z);
            gauge_opt(set, "prusa_flow_percent", "Flow multiplier in percent", base, p.flow);
            gauge_opt(set, "prusa_fan_hotend_rpm", "Hotend fan speed", base, p.fan_hotend);
            gauge_opt(set, "prusa_fan_print_rpm", "Part cooling fan speed", base, p.fan_print);
        }
        if let Some(job) = &status.job {
            gauge_opt(set, "prusa_job_id", "Current job id", base, job.id);
        }
        if let Some(storage) = status.storage_name() {
            set.gauge("prusa_storage_info", "Active storage device", extend(base, &[("storage", storage.as_str())]), 1.0);
        }
    }

    if let Some(info) = &scrape.info {
        gauge_opt(set, "prusa_nozzle_diameter_mm", "Installed nozzle diameter", base, info.nozzle_diameter);
        if let Some(mmu) = info.mmu {
            set.gauge("prusa_mmu_enabled", "MMU attached", base.clone(), if mmu { 1.0 } else { 0.0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hostnames_map_to_models() {
        assert_eq!(model_for_hostname("prusa-mk4"), "MK4");
        assert_eq!(model_for_hostname("PRUSA-MINI"), "MINI");
        assert_eq!(model_for_hostname("my-custom-box"), "my-custom-box");
    }

    #[test]
    fn model_cache_remembers_last_value() {
        let cache = ModelCache::new();
        assert!(cache.get("10.0.0.1").is_none());
        cache.set("10.0.0.1", "MK4");
        cache.set("10.0.0.1", "XL");
        assert_eq!(cache.get("10.0.0.1").as_deref(), Some("XL"));
    }
}
