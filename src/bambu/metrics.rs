//! Scrape-time Bambu gauges, fed only by the MQTT stream.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use super::normalizer::{
    apply_report, BambuSnapshot, FieldSpec, AMS_SYSTEM_FIELDS, AMS_UNIT_FIELDS, PRINT_FIELDS, TRAY_FIELDS,
    VIRTUAL_TRAY_ID,
};
use super::pool::{ListenerError, ReportListener};
use crate::exposition::{labels, FamilySet, Labels};

const PREFIX: &str = "bambu";

/// Help for gauges produced by the nested sub-processors.
const EXTRA_HELP: &[(&str, &str)] = &[
    ("ipcam_present", "Camera present"),
    ("ipcam_recording", "Camera recording enabled"),
    ("timelapse_enabled", "Timelapse enabled"),
    ("upload_progress_percent", "Printer-side upload progress in percent"),
    ("net_conf", "Network configuration flags"),
    ("net_interfaces", "Number of reported network interfaces"),
    ("upgrade_progress_percent", "Firmware upgrade progress in percent"),
    ("upgrade_new_version_state", "Firmware update availability state"),
    ("upgrade_force", "Firmware upgrade is mandatory"),
    ("online_ahb", "AHB module online"),
    ("online_rfid", "RFID module online"),
    ("hms_error_count", "Active HMS health messages"),
];

fn help_for(tables: &[&[FieldSpec]], gauge: &str) -> String {
    tables
        .iter()
        .flat_map(|table| table.iter())
        .find(|spec| spec.gauge == gauge)
        .map(|spec| spec.help.to_string())
        .or_else(|| {
            EXTRA_HELP
                .iter()
                .find(|(name, _)| *name == gauge)
                .map(|(_, help)| help.to_string())
        })
        .unwrap_or_else(|| {
            if gauge.starts_with("light_") {
                "Light mode (0 off, 1 on, 2 flashing)".to_string()
            } else {
                format!("Bambu {}", gauge.replace('_', " "))
            }
        })
}

struct PrinterMetrics {
    name: String,
    snapshot: BambuSnapshot,
    last_report_ms: i64,
}

/// Per-printer, per-AMS-unit and per-tray gauges.
#[derive(Default)]
pub struct BambuMetricsStore {
    printers: RwLock<HashMap<String, PrinterMetrics>>,
}

impl BambuMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.printers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget printers that are no longer pooled.
    pub fn retain(&self, serials: &[String]) {
        self.printers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|serial, _| serials.contains(serial));
    }

    /// Render every known printer as exposition text, or an empty string when none reported.
    pub fn render(&self) -> String {
        let printers = self.printers.read().unwrap_or_else(|e| e.into_inner());
        let mut serials: Vec<&String> = printers.keys().collect();
        serials.sort();

        let mut set = FamilySet::new();
        for serial in serials {
            let printer = &printers[serial];
            let base = labels([("serial", serial.as_str()), ("printer", printer.name.as_str())]);
            render_printer(&mut set, &base, printer);
        }
        set.render()
    }
}

fn with(base: &Labels, extra: &[(&str, String)]) -> Labels {
    let mut out = base.clone();
    out.extend(extra.iter().map(|(k, v)| (k.to_string(), v.clone())));
    out
}

fn render_printer(set: &mut FamilySet, base: &Labels, printer: &PrinterMetrics) {
    let snap = &printer.snapshot;
    set.gauge(
        &format!("{}_last_report_timestamp_seconds", PREFIX),
        "Unix time of the last report received from the printer",
        base.clone(),
        printer.last_report_ms as f64 / 1000.0,
    );

    for (gauge, value) in &snap.gauges {
        let help = help_for(&[PRINT_FIELDS, AMS_SYSTEM_FIELDS], gauge);
        set.gauge(&format!("{}_{}", PREFIX, gauge), &help, base.clone(), *value);
    }

    let text = |key: &str| snap.text.get(key).cloned().unwrap_or_default();
    set.gauge(
        &format!("{}_print_info", PREFIX),
        "Current print job identity",
        with(
            base,
            &[
                ("gcode_state", text("gcode_state")),
                ("gcode_file", text("gcode_file")),
                ("subtask", text("subtask_name")),
                ("active_filament", snap.active_filament.clone().unwrap_or_default()),
            ],
        ),
        1.0,
    );

    for (unit, state) in &snap.ams_units {
        let unit_labels = with(base, &[("ams", unit.to_string())]);
        for (gauge, value) in &state.gauges {
            set.gauge(
                &format!("{}_ams_{}", PREFIX, gauge),
                &help_for(&[AMS_UNIT_FIELDS], gauge),
                unit_labels.clone(),
                *value,
            );
        }
    }

    for (id, tray) in &snap.trays {
        let ams = if tray.ams_unit == VIRTUAL_TRAY_ID { "external".to_string() } else { tray.ams_unit.to_string() };
        let tray_labels = with(base, &[("ams", ams), ("tray", tray.slot.to_string()), ("tray_id", id.to_string())]);
        set.gauge(
            &format!("{}_tray_empty", PREFIX),
            "Tray holds no spool",
            tray_labels.clone(),
            if tray.empty { 1.0 } else { 0.0 },
        );
        set.gauge(
            &format!("{}_tray_active", PREFIX),
            "Tray currently feeding the nozzle",
            tray_labels.clone(),
            if snap.active_tray == Some(*id) { 1.0 } else { 0.0 },
        );
        if tray.empty {
            continue;
        }
        let info = |key: &str| tray.text.get(key).cloned().unwrap_or_default();
        set.gauge(
            &format!("{}_tray_info", PREFIX),
            "Filament loaded in the tray",
            with(
                &tray_labels,
                &[
                    ("type", info("tray_type")),
                    ("sub_brand", info("tray_sub_brands")),
                    ("color", info("tray_color")),
                ],
            ),
            1.0,
        );
        for (gauge, value) in &tray.gauges {
            set.gauge(
                &format!("{}_tray_{}", PREFIX, gauge),
                &help_for(&[TRAY_FIELDS], gauge),
                tray_labels.clone(),
                *value,
            );
        }
    }
}

impl ReportListener for BambuMetricsStore {
    fn on_report(&self, serial: &str, printer_name: &str, report: &Value) -> Result<(), ListenerError> {
        let mut printers = self.printers.write().unwrap_or_else(|e| e.into_inner());
        let entry = printers.entry(serial.to_string()).or_insert_with(|| PrinterMetrics {
            name: printer_name.to_string(),
            snapshot: BambuSnapshot::default(),
            last_report_ms: 0,
        });
        entry.name = printer_name.to_string();
        if apply_report(&mut entry.snapshot, report) {
            entry.last_report_ms = Utc::now().timestamp_millis();
        }
        Ok(())
    }
}
