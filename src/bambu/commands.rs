//! Bambu MQTT topics and command payloads.

use serde_json::{json, Value};

pub fn report_topic(serial: &str) -> String {
    format!("device/{}/report", serial)
}

pub fn request_topic(serial: &str) -> String {
    format!("device/{}/request", serial)
}

/// Ask the printer for a full status dump.
pub fn pushall() -> Value {
    json!({
        "pushing": {
            "sequence_id": "0",
            "command": "pushall",
            "version": 1,
            "push_target": 1
        }
    })
}

/// Parameters of a `project_file` print start.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectFile {
    /// File name under `cache/` on the printer's storage.
    pub filename: String,
    pub plate: u32,
    pub use_ams: bool,
    /// Tray per filament slot of the project; `-1` leaves a slot unmapped.
    pub ams_mapping: Vec<i32>,
    pub bed_leveling: bool,
    pub timelapse: bool,
}

impl ProjectFile {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            plate: 1,
            use_ams: false,
            ams_mapping: Vec::new(),
            bed_leveling: true,
            timelapse: false,
        }
    }

    pub fn remote_path(&self) -> String {
        format!("cache/{}", self.filename)
    }

    pub fn to_json(&self) -> Value {
        let subtask = self.filename.trim_end_matches(".3mf");
        let mut cmd = json!({
            "print": {
                "sequence_id": "0",
                "command": "project_file",
                "param": format!("Metadata/plate_{}.gcode", self.plate),
                "subtask_name": subtask,
                "url": format!("ftp:///{}", self.remote_path()),
                "file": self.filename,
                "md5": "",
                "bed_type": "auto",
                "timelapse": self.timelapse,
                "bed_leveling": self.bed_leveling,
                "flow_cali": false,
                "vibration_cali": false,
                "layer_inspect": false,
                "use_ams": self.use_ams,
                "profile_id": "0",
                "project_id": "0",
                "subtask_id": "0",
                "task_id": "0"
            }
        });
        if !self.ams_mapping.is_empty() {
            if let Some(print) = cmd.get_mut("print") {
                print["ams_mapping"] = json!(self.ams_mapping);
            }
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics() {
        assert_eq!(report_topic("01S00A1"), "device/01S00A1/report");
        assert_eq!(request_topic("01S00A1"), "device/01S00A1/request");
        assert_eq!(pushall()["pushing"]["command"], "pushall");
    }

    #[test]
    fn project_file_payload() {
        let mut cmd = ProjectFile::new("benchy.3mf");
        cmd.plate = 2;
        cmd.use_ams = true;
        cmd.ams_mapping = vec![0, -1, 3];
        let v = cmd.to_json();
        let print = &v["print"];
        assert_eq!(print["command"], "project_file");
        assert_eq!(print["param"], "Metadata/plate_2.gcode");
        assert_eq!(print["url"], "ftp:///cache/benchy.3mf");
        assert_eq!(print["subtask_name"], "benchy");
        assert_eq!(print["use_ams"], true);
        assert_eq!(print["ams_mapping"], json!([0, -1, 3]));
    }

    #[test]
    fn mapping_omitted_when_empty() {
        let v = ProjectFile::new("a.3mf").to_json();
        assert!(v["print"].get("ams_mapping").is_none());
    }
}
