//! Bambu report normalization.
//!
//! Device reports arrive as `{"print": {...}}` objects, usually partial. [`apply_report`]
//! merges each one into a [`BambuSnapshot`] through a declarative field table; fields not in
//! the table are dropped so new firmware keys never break the pipeline.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::exposition::{safe_bool, safe_float64};

/// Global id of the external spool holder.
pub const VIRTUAL_TRAY_ID: u32 = 254;
pub const TRAYS_PER_AMS: u32 = 4;
/// `tray_now` value the firmware also uses for the external spool.
const ALT_VIRTUAL_TRAY_ID: u32 = 255;

/// How a raw report value becomes a gauge.
#[derive(Debug, Clone, Copy)]
pub enum Coercion {
    Float,
    Bool,
    /// Fixed string → small integer dictionary, 0 for anything else.
    Enum(&'static [(&'static str, f64)]),
    /// Hex-encoded bitmask such as `"1"` or `"0003"`.
    Hex,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub gauge: &'static str,
    pub help: &'static str,
    pub coercion: Coercion,
}

const fn field(key: &'static str, gauge: &'static str, help: &'static str, coercion: Coercion) -> FieldSpec {
    FieldSpec { key, gauge, help, coercion }
}

pub const GCODE_STATES: &[(&str, f64)] = &[
    ("IDLE", 1.0),
    ("PREPARE", 2.0),
    ("RUNNING", 3.0),
    ("PAUSE", 4.0),
    ("FINISH", 5.0),
    ("FAILED", 6.0),
    ("SLICING", 7.0),
];

pub const PRINT_TYPES: &[(&str, f64)] = &[
    ("idle", 1.0),
    ("local", 2.0),
    ("cloud", 3.0),
    ("system", 4.0),
];

pub const PRODUCTION_STATES: &[(&str, f64)] = &[("inactive", 1.0), ("active", 2.0)];

use Coercion::{Bool, Enum, Float, Hex};

/// Whitelisted top-level `print` fields.
pub const PRINT_FIELDS: &[FieldSpec] = &[
    field("nozzle_temper", "nozzle_temperature", "Nozzle temperature in Celsius", Float),
    field("nozzle_target_temper", "nozzle_target_temperature", "Nozzle target temperature in Celsius", Float),
    field("bed_temper", "bed_temperature", "Bed temperature in Celsius", Float),
    field("bed_target_temper", "bed_target_temperature", "Bed target temperature in Celsius", Float),
    field("chamber_temper", "chamber_temperature", "Chamber temperature in Celsius", Float),
    field("frame_temper", "frame_temperature", "Frame temperature in Celsius", Float),
    field("mc_percent", "print_progress_percent", "Print progress in percent", Float),
    field("mc_remaining_time", "remaining_time_minutes", "Estimated remaining print time in minutes", Float),
    field("mc_print_stage", "print_stage", "Motion controller print stage", Float),
    field("mc_print_sub_stage", "print_sub_stage", "Motion controller print sub stage", Float),
    field("mc_print_error_code", "print_error_code", "Motion controller error code", Float),
    field("mc_print_line_number", "print_line_number", "Current G-code line number", Float),
    field("print_error", "print_error", "Printer error code, 0 when healthy", Float),
    field("layer_num", "layer_number", "Current layer", Float),
    field("total_layer_num", "total_layers", "Total layers of the current print", Float),
    field("gcode_file_prepare_percent", "prepare_percent", "File preparation progress in percent", Float),
    field("stg_cur", "stage_current", "Current stage id", Float),
    field("print_real_action", "print_real_action", "Current print action id", Float),
    field("spd_lvl", "speed_level", "Speed profile (1 silent .. 4 ludicrous)", Float),
    field("spd_mag", "speed_magnitude_percent", "Speed magnitude in percent", Float),
    field("heatbreak_fan_speed", "heatbreak_fan_speed", "Heatbreak fan speed step", Float),
    field("cooling_fan_speed", "cooling_fan_speed", "Part cooling fan speed step", Float),
    field("big_fan1_speed", "aux_fan_speed", "Auxiliary fan speed step", Float),
    field("big_fan2_speed", "chamber_fan_speed", "Chamber fan speed step", Float),
    field("fan_gear", "fan_gear", "Combined fan gear value", Float),
    field("wifi_signal", "wifi_signal_dbm", "WiFi signal strength in dBm", Float),
    field("nozzle_diameter", "nozzle_diameter_mm", "Installed nozzle diameter in mm", Float),
    field("home_flag", "home_flag", "Home/status flag bitfield", Float),
    field("hw_switch_state", "filament_switch_state", "Filament runout switch state", Float),
    field("queue_number", "queue_number", "Position in the cloud queue", Float),
    field("queue_total", "queue_total", "Total jobs in the cloud queue", Float),
    field("queue_est", "queue_estimate_seconds", "Estimated queue wait in seconds", Float),
    field("queue_sts", "queue_status", "Cloud queue status", Float),
    field("lifecycle_stage", "lifecycle_stage", "Lifecycle stage id", Float),
    field("sdcard", "sdcard_present", "SD card inserted", Bool),
    field("force_upgrade", "force_upgrade", "Firmware upgrade is mandatory", Bool),
    field("gcode_state", "state", "Print state (1 idle, 2 prepare, 3 running, 4 pause, 5 finish, 6 failed, 7 slicing)", Enum(GCODE_STATES)),
    field("print_type", "print_type", "Print source (1 idle, 2 local, 3 cloud, 4 system)", Enum(PRINT_TYPES)),
    field("mess_production_state", "production_state", "Production state (1 inactive, 2 active)", Enum(PRODUCTION_STATES)),
];

/// Fields inside the `ams` sub-report that describe the whole AMS system.
pub const AMS_SYSTEM_FIELDS: &[FieldSpec] = &[
    field("ams_exist_bits", "ams_exist_bits", "Bitmask of connected AMS units", Hex),
    field("tray_exist_bits", "tray_exist_bits", "Bitmask of trays holding a spool", Hex),
    field("tray_is_bbl_bits", "tray_is_bbl_bits", "Bitmask of trays with first-party spools", Hex),
    field("tray_read_done_bits", "tray_read_done_bits", "Bitmask of trays whose RFID read finished", Hex),
    field("tray_reading_bits", "tray_reading_bits", "Bitmask of trays currently reading RFID", Hex),
    field("tray_tar", "tray_target", "Target tray of the current filament change", Float),
    field("tray_pre", "tray_previous", "Previously loaded tray", Float),
    field("insert_flag", "ams_insert_flag", "Read RFID on spool insertion", Bool),
    field("power_on_flag", "ams_power_on_flag", "Read RFID on power on", Bool),
    field("version", "ams_version", "AMS report version counter", Float),
];

/// Per-unit AMS fields.
pub const AMS_UNIT_FIELDS: &[FieldSpec] = &[
    field("humidity", "humidity_level", "AMS humidity level (1 wet .. 5 dry)", Float),
    field("humidity_raw", "humidity_percent", "AMS relative humidity in percent", Float),
    field("temp", "temperature", "AMS temperature in Celsius", Float),
];

/// Per-tray fields.
pub const TRAY_FIELDS: &[FieldSpec] = &[
    field("remain", "remain_percent", "Remaining filament in percent, -1 when unknown", Float),
    field("nozzle_temp_min", "nozzle_temp_min", "Minimum nozzle temperature for the loaded filament", Float),
    field("nozzle_temp_max", "nozzle_temp_max", "Maximum nozzle temperature for the loaded filament", Float),
    field("bed_temp", "bed_temp", "Recommended bed temperature for the loaded filament", Float),
    field("tray_temp", "drying_temp", "Drying temperature for the loaded filament", Float),
    field("tray_time", "drying_time_hours", "Drying time for the loaded filament", Float),
    field("tray_weight", "weight_grams", "Spool weight in grams", Float),
    field("tray_diameter", "diameter_mm", "Filament diameter in mm", Float),
    field("k", "pressure_advance", "Pressure advance factor", Float),
    field("n", "flow_ratio", "Flow dynamics factor", Float),
];

/// Text attributes kept for info labels and the status API.
const PRINT_TEXT_FIELDS: &[&str] = &["gcode_state", "gcode_file", "subtask_name", "print_type", "nozzle_type"];
const TRAY_TEXT_FIELDS: &[&str] = &["tray_type", "tray_sub_brands", "tray_color", "tray_info_idx", "tag_uid", "tray_uuid"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AmsUnitState {
    pub gauges: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrayState {
    /// AMS unit index, or [`VIRTUAL_TRAY_ID`] for the external spool.
    pub ams_unit: u32,
    pub slot: u32,
    pub empty: bool,
    pub gauges: BTreeMap<String, f64>,
    pub text: BTreeMap<String, String>,
}

impl TrayState {
    pub fn tray_type(&self) -> Option<&str> {
        self.text.get("tray_type").map(String::as_str).filter(|t| !t.is_empty())
    }
}

/// Everything known about one printer, accumulated across reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BambuSnapshot {
    pub gauges: BTreeMap<String, f64>,
    pub text: BTreeMap<String, String>,
    pub ams_units: BTreeMap<u32, AmsUnitState>,
    /// Trays keyed by global id (`unit * 4 + slot`, or 254).
    pub trays: BTreeMap<u32, TrayState>,
    pub active_tray: Option<u32>,
    pub active_filament: Option<String>,
}

impl BambuSnapshot {
    pub fn gcode_state(&self) -> Option<&str> {
        self.text.get("gcode_state").map(String::as_str)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }
}

/// Global tray id of `slot` in `ams_unit`. `None` when the pair cannot name an AMS tray: the
/// slot is out of range, the id overflows, or it lands on the external spool ids.
pub fn tray_global_id(ams_unit: u32, slot: u32) -> Option<u32> {
    if slot >= TRAYS_PER_AMS {
        return None;
    }
    ams_unit
        .checked_mul(TRAYS_PER_AMS)
        .and_then(|base| base.checked_add(slot))
        .filter(|id| !matches!(*id, VIRTUAL_TRAY_ID | ALT_VIRTUAL_TRAY_ID))
}

/// Merge one device message into `snapshot`. Returns false when the message has no `print`
/// object (other top-level keys are ignored).
pub fn apply_report(snapshot: &mut BambuSnapshot, message: &Value) -> bool {
    let Some(print) = message.get("print").and_then(Value::as_object) else {
        return false;
    };

    apply_fields(PRINT_FIELDS, print, &mut snapshot.gauges);
    copy_text(PRINT_TEXT_FIELDS, print, &mut snapshot.text);

    for (key, value) in print {
        match key.as_str() {
            "ipcam" => process_ipcam(snapshot, value),
            "upload" => process_upload(snapshot, value),
            "net" => process_net(snapshot, value),
            "ams" => process_ams(snapshot, value),
            "vt_tray" => process_tray(snapshot, VIRTUAL_TRAY_ID, 0, value),
            "lights_report" => process_lights(snapshot, value),
            "upgrade_state" => process_upgrade(snapshot, value),
            "online" => process_online(snapshot, value),
            "hms" => {
                if let Some(list) = value.as_array() {
                    snapshot.gauges.insert("hms_error_count".to_string(), list.len() as f64);
                }
            }
            _ => {}
        }
    }

    resolve_active_filament(snapshot);
    true
}

/// Coerce a raw report value. `None` means the value is unusable and must not overwrite
/// anything already known.
pub fn coerce(value: &Value, coercion: Coercion) -> Option<f64> {
    let number = match coercion {
        Float => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(safe_float64(s)),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        },
        Bool => match value {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => n.as_f64().map(|v| if v != 0.0 { 1.0 } else { 0.0 }),
            Value::String(s) => Some(safe_bool(s)),
            _ => None,
        },
        Enum(table) => match value {
            Value::String(s) => Some(
                table
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(s))
                    .map(|(_, v)| *v)
                    .unwrap_or(0.0),
            ),
            _ => Some(0.0),
        },
        Hex => match value {
            Value::String(s) => {
                let digits = s.trim().trim_start_matches("0x");
                u64::from_str_radix(digits, 16).ok().map(|v| v as f64)
            }
            Value::Number(n) => n.as_f64(),
            _ => None,
        },
    };
    number.filter(|v| !v.is_nan())
}

fn apply_fields(table: &[FieldSpec], source: &Map<String, Value>, target: &mut BTreeMap<String, f64>) {
    for spec in table {
        if let Some(raw) = source.get(spec.key) {
            match coerce(raw, spec.coercion) {
                Some(v) => {
                    target.insert(spec.gauge.to_string(), v);
                }
                None => tracing::debug!("Dropping unusable value for {}: {}", spec.key, raw),
            }
        }
    }
}

fn copy_text(keys: &[&str], source: &Map<String, Value>, target: &mut BTreeMap<String, String>) {
    for key in keys {
        if let Some(s) = source.get(*key).and_then(Value::as_str) {
            target.insert(key.to_string(), s.to_string());
        }
    }
}

fn set_gauge(snapshot: &mut BambuSnapshot, name: &str, value: Option<f64>) {
    if let Some(v) = value.filter(|v| !v.is_nan()) {
        snapshot.gauges.insert(name.to_string(), v);
    }
}

fn process_ipcam(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(cam) = value.as_object() else { return };
    for (key, gauge) in [("ipcam_dev", "ipcam_present"), ("ipcam_record", "ipcam_recording"), ("timelapse", "timelapse_enabled")] {
        set_gauge(snapshot, gauge, cam.get(key).and_then(|v| coerce(v, Bool)));
    }
    if let Some(res) = cam.get("resolution").and_then(Value::as_str) {
        snapshot.text.insert("ipcam_resolution".to_string(), res.to_string());
    }
}

fn process_upload(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(upload) = value.as_object() else { return };
    set_gauge(snapshot, "upload_progress_percent", upload.get("progress").and_then(|v| coerce(v, Float)));
    if let Some(status) = upload.get("status").and_then(Value::as_str) {
        snapshot.text.insert("upload_status".to_string(), status.to_string());
    }
}

fn process_net(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(net) = value.as_object() else { return };
    set_gauge(snapshot, "net_conf", net.get("conf").and_then(|v| coerce(v, Float)));
    if let Some(info) = net.get("info").and_then(Value::as_array) {
        snapshot.gauges.insert("net_interfaces".to_string(), info.len() as f64);
        // Addresses are little-endian u32s; 0 means the interface is down.
        let address = info
            .iter()
            .filter_map(|i| i.get("ip").and_then(Value::as_u64))
            .find(|ip| *ip != 0)
            .map(|ip| {
                let b = (ip as u32).to_le_bytes();
                format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
            });
        if let Some(address) = address {
            snapshot.text.insert("net_ip".to_string(), address);
        }
    }
}

fn process_ams(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(ams) = value.as_object() else { return };
    apply_fields(AMS_SYSTEM_FIELDS, ams, &mut snapshot.gauges);
    if let Some(now) = ams.get("tray_now").and_then(Value::as_str) {
        snapshot.text.insert("tray_now".to_string(), now.to_string());
    }

    let Some(units) = ams.get("ams").and_then(Value::as_array) else { return };
    for (position, unit) in units.iter().enumerate() {
        let Some(unit) = unit.as_object() else { continue };
        let index = match unit.get("id") {
            Some(id) => index_of(id),
            None => u32::try_from(position).ok(),
        };
        let Some(index) = index.filter(|i| tray_global_id(*i, 0).is_some()) else {
            tracing::debug!("Skipping AMS unit with unusable id {:?}", unit.get("id"));
            continue;
        };
        let state = snapshot.ams_units.entry(index).or_default();
        apply_fields(AMS_UNIT_FIELDS, unit, &mut state.gauges);

        if let Some(trays) = unit.get("tray").and_then(Value::as_array) {
            for (slot_position, tray) in trays.iter().enumerate() {
                let slot = match tray.get("id") {
                    Some(id) => index_of(id),
                    None => u32::try_from(slot_position).ok(),
                };
                match slot {
                    Some(slot) => process_tray(snapshot, index, slot, tray),
                    None => tracing::debug!("Skipping tray with unusable id in AMS {}", index),
                }
            }
        }
    }
}

fn process_tray(snapshot: &mut BambuSnapshot, ams_unit: u32, slot: u32, value: &Value) {
    let Some(tray) = value.as_object() else { return };
    let (global, slot) = if ams_unit == VIRTUAL_TRAY_ID {
        (VIRTUAL_TRAY_ID, 0)
    } else {
        match tray_global_id(ams_unit, slot) {
            Some(global) => (global, slot),
            None => {
                tracing::debug!("Skipping tray {} of AMS {}: id out of range", slot, ams_unit);
                return;
            }
        }
    };
    let empty = tray.keys().all(|k| k == "id" || k == "state");

    let state = snapshot.trays.entry(global).or_insert_with(|| TrayState {
        ams_unit,
        slot,
        ..TrayState::default()
    });
    state.empty = empty;
    if empty {
        // The spool was removed; what we knew about it no longer applies.
        state.gauges.clear();
        state.text.clear();
        return;
    }
    apply_fields(TRAY_FIELDS, tray, &mut state.gauges);
    copy_text(TRAY_TEXT_FIELDS, tray, &mut state.text);
}

fn process_lights(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(lights) = value.as_array() else { return };
    for light in lights {
        let node = light.get("node").and_then(Value::as_str);
        let mode = light.get("mode").and_then(Value::as_str);
        if let (Some(node), Some(mode)) = (node, mode) {
            let name = format!("light_{}_on", sanitize_metric_part(node));
            let on = match mode {
                "on" => 1.0,
                "flashing" => 2.0,
                _ => 0.0,
            };
            snapshot.gauges.insert(name, on);
        }
    }
}

fn process_upgrade(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(upgrade) = value.as_object() else { return };
    set_gauge(snapshot, "upgrade_progress_percent", upgrade.get("progress").and_then(|v| coerce(v, Float)));
    set_gauge(snapshot, "upgrade_new_version_state", upgrade.get("new_version_state").and_then(|v| coerce(v, Float)));
    set_gauge(snapshot, "upgrade_force", upgrade.get("force_upgrade").and_then(|v| coerce(v, Bool)));
    if let Some(status) = upgrade.get("status").and_then(Value::as_str) {
        snapshot.text.insert("upgrade_status".to_string(), status.to_string());
    }
}

fn process_online(snapshot: &mut BambuSnapshot, value: &Value) {
    let Some(online) = value.as_object() else { return };
    set_gauge(snapshot, "online_ahb", online.get("ahb").and_then(|v| coerce(v, Bool)));
    set_gauge(snapshot, "online_rfid", online.get("rfid").and_then(|v| coerce(v, Bool)));
}

fn resolve_active_filament(snapshot: &mut BambuSnapshot) {
    let Some(now) = snapshot.text.get("tray_now") else { return };
    let active = match now.as_str() {
        "254" | "255" => Some(VIRTUAL_TRAY_ID),
        other => other
            .parse::<u32>()
            .ok()
            .and_then(|id| tray_global_id(id / TRAYS_PER_AMS, id % TRAYS_PER_AMS)),
    };
    snapshot.active_tray = active;
    // Follows the active tray even when it has no known type.
    snapshot.active_filament = active
        .and_then(|id| snapshot.trays.get(&id))
        .and_then(TrayState::tray_type)
        .map(str::to_string);
}

fn index_of(value: &Value) -> Option<u32> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        _ => None,
    }
}

fn sanitize_metric_part(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_print_key_is_processed() {
        let mut snap = BambuSnapshot::default();
        assert!(!apply_report(&mut snap, &json!({"info": {"nozzle_temper": 1}})));
        assert!(snap.gauges.is_empty());
    }

    #[test]
    fn table_fields_and_unknowns() {
        let mut snap = BambuSnapshot::default();
        apply_report(
            &mut snap,
            &json!({"print": {
                "nozzle_temper": 210.5,
                "wifi_signal": "-47dBm",
                "sdcard": true,
                "gcode_state": "RUNNING",
                "print_type": "mystery",
                "brand_new_field": 42
            }}),
        );
        assert_eq!(snap.gauge("nozzle_temperature"), Some(210.5));
        assert_eq!(snap.gauge("wifi_signal_dbm"), Some(-47.0));
        assert_eq!(snap.gauge("sdcard_present"), Some(1.0));
        assert_eq!(snap.gauge("state"), Some(3.0));
        assert_eq!(snap.gauge("print_type"), Some(0.0));
        assert_eq!(snap.gcode_state(), Some("RUNNING"));
        assert!(!snap.gauges.contains_key("brand_new_field"));
    }

    #[test]
    fn partial_reports_merge() {
        let mut snap = BambuSnapshot::default();
        apply_report(&mut snap, &json!({"print": {"bed_temper": 60, "mc_percent": 10}}));
        apply_report(&mut snap, &json!({"print": {"mc_percent": 11, "wifi_signal": "garbage"}}));
        assert_eq!(snap.gauge("bed_temperature"), Some(60.0));
        assert_eq!(snap.gauge("print_progress_percent"), Some(11.0));
        assert!(snap.gauge("wifi_signal_dbm").is_none());
    }

    #[test]
    fn tray_ids_follow_unit_and_slot() {
        let mut snap = BambuSnapshot::default();
        apply_report(
            &mut snap,
            &json!({"print": {"ams": {"ams": [
                {"id": "0", "tray": [{"id": "0"}]},
                {"id": "1", "humidity": "4", "tray": [{"id": "2", "tray_type": "PETG", "remain": 80}]}
            ]}}}),
        );
        let tray = &snap.trays[&6];
        assert_eq!((tray.ams_unit, tray.slot), (1, 2));
        assert_eq!(tray.tray_type(), Some("PETG"));
        assert_eq!(tray.gauges["remain_percent"], 80.0);
        assert_eq!(snap.ams_units[&1].gauges["humidity_level"], 4.0);
        assert!(snap.trays[&0].empty);
    }

    #[test]
    fn tray_now_254_uses_external_spool() {
        let mut snap = BambuSnapshot::default();
        apply_report(
            &mut snap,
            &json!({"print": {
                "vt_tray": {"id": "254", "tray_type": "TPU"},
                "ams": {"tray_now": "254", "ams": [{"id": "0", "tray": [{"id": "0", "tray_type": "PLA"}]}]}
            }}),
        );
        assert_eq!(snap.active_tray, Some(VIRTUAL_TRAY_ID));
        assert_eq!(snap.active_filament.as_deref(), Some("TPU"));
        assert_eq!(snap.trays[&VIRTUAL_TRAY_ID].ams_unit, VIRTUAL_TRAY_ID);
    }

    #[test]
    fn ams_bitmasks_parse_as_hex() {
        let mut snap = BambuSnapshot::default();
        apply_report(&mut snap, &json!({"print": {"ams": {"ams_exist_bits": "3", "tray_exist_bits": "f0"}}}));
        assert_eq!(snap.gauge("ams_exist_bits"), Some(3.0));
        assert_eq!(snap.gauge("tray_exist_bits"), Some(240.0));
    }

    #[test]
    fn nested_sub_reports() {
        let mut snap = BambuSnapshot::default();
        apply_report(
            &mut snap,
            &json!({"print": {
                "ipcam": {"ipcam_dev": "1", "timelapse": "disable", "resolution": "1080p"},
                "upload": {"status": "idle", "progress": 0},
                "net": {"conf": 16, "info": [{"ip": 0}, {"ip": 16820416u64}]},
                "lights_report": [{"node": "chamber_light", "mode": "on"}],
                "upgrade_state": {"progress": "35", "status": "UPGRADING"},
                "online": {"ahb": false, "rfid": true},
                "hms": [{"attr": 1, "code": 2}]
            }}),
        );
        assert_eq!(snap.gauge("ipcam_present"), Some(1.0));
        assert_eq!(snap.gauge("timelapse_enabled"), Some(0.0));
        assert_eq!(snap.gauge("upload_progress_percent"), Some(0.0));
        assert_eq!(snap.text["net_ip"], "192.168.0.1");
        assert_eq!(snap.gauge("light_chamber_light_on"), Some(1.0));
        assert_eq!(snap.gauge("upgrade_progress_percent"), Some(35.0));
        assert_eq!(snap.gauge("online_rfid"), Some(1.0));
        assert_eq!(snap.gauge("hms_error_count"), Some(1.0));
    }

    #[test]
    fn out_of_range_ams_ids_are_skipped() {
        let mut snap = BambuSnapshot::default();
        assert!(apply_report(
            &mut snap,
            &json!({"print": {"nozzle_temper": 200, "ams": {"ams": [
                {"id": "1073741824", "humidity": "2", "tray": [{"id": "0", "tray_type": "PLA"}]},
                {"id": "0", "tray": [{"id": "7", "tray_type": "ABS"}, {"id": "1", "tray_type": "PETG"}]}
            ]}}}),
        ));
        assert!(!snap.ams_units.contains_key(&1073741824));
        assert_eq!(snap.trays.len(), 1);
        assert_eq!(snap.trays[&1].tray_type(), Some("PETG"));
        assert_eq!(snap.gauge("nozzle_temperature"), Some(200.0));
        assert_eq!(tray_global_id(u32::MAX, 0), None);
        assert_eq!(tray_global_id(63, 2), None);
        assert_eq!(tray_global_id(128, 1), Some(513));
    }

    #[test]
    fn active_filament_follows_tray_now() {
        let mut snap = BambuSnapshot::default();
        apply_report(
            &mut snap,
            &json!({"print": {"ams": {"tray_now": "1", "ams": [
                {"id": "0", "tray": [{"id": "1", "tray_type": "PLA"}, {"id": "3"}]}
            ]}}}),
        );
        assert_eq!(snap.active_filament.as_deref(), Some("PLA"));

        apply_report(&mut snap, &json!({"print": {"ams": {"tray_now": "3"}}}));
        assert_eq!(snap.active_tray, Some(3));
        assert_eq!(snap.active_filament, None);

        apply_report(&mut snap, &json!({"print": {"ams": {"tray_now": "1"}}}));
        assert_eq!(snap.active_filament.as_deref(), Some("PLA"));
    }

    #[test]
    fn removed_spool_clears_tray() {
        let mut snap = BambuSnapshot::default();
        apply_report(&mut snap, &json!({"print": {"ams": {"ams": [{"id": "0", "tray": [{"id": "1", "tray_type": "PLA"}]}]}}}));
        apply_report(&mut snap, &json!({"print": {"ams": {"ams": [{"id": "0", "tray": [{"id": "1", "state": 0}]}]}}}));
        assert!(snap.trays[&1].empty);
        assert!(snap.trays[&1].tray_type().is_none());
    }
}
