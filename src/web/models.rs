//! Request bodies of the print API.

use axum::extract::Multipart;
use serde::Deserialize;

use crate::dispatch::{BambuStartOptions, DispatchMode};

use super::ApiError;

/// `Content-Type` of the scrape endpoint.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Fields of `POST /api/v1/printers/{id}/print`.
#[derive(Debug)]
pub struct PrintForm {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mode: DispatchMode,
    pub bambu: BambuStartOptions,
}

fn bad_field(field: &str, value: &str) -> ApiError {
    ApiError::BadRequest(format!("invalid {} '{}'", field, value))
}

/// `[0,1,-1]` or `0,1,-1`.
pub fn parse_ams_mapping(raw: &str) -> Result<Vec<i32>, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|_| bad_field("ams_mapping", raw));
    }
    trimmed
        .split(',')
        .map(|s| s.trim().parse::<i32>().map_err(|_| bad_field("ams_mapping", raw)))
        .collect()
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ApiError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" | "" => Ok(false),
        _ => Err(bad_field(field, raw)),
    }
}

impl PrintForm {
    pub async fn read(multipart: &mut Multipart) -> Result<Self, ApiError> {
        let mut file: Option<(String, Vec<u8>)> = None;
        let mut mode = DispatchMode::UploadAndStart;
        let mut bambu = BambuStartOptions::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("file part has no filename".to_string()))?;
                let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.body_text()))?;
                file = Some((filename, bytes.to_vec()));
                continue;
            }
            let value = field.text().await.map_err(|e| ApiError::BadRequest(e.body_text()))?;
            match name.as_str() {
                "mode" => mode = value.trim().parse().map_err(|_| bad_field("mode", &value))?,
                "plate" => bambu.plate = value.trim().parse().map_err(|_| bad_field("plate", &value))?,
                "use_ams" => bambu.use_ams = parse_bool("use_ams", &value)?,
                "ams_mapping" => bambu.ams_mapping = parse_ams_mapping(&value)?,
                other => tracing::debug!("Ignoring form field {}", other),
            }
        }

        let (filename, bytes) = file.ok_or_else(|| ApiError::BadRequest("missing file part".to_string()))?;
        Ok(Self {
            filename,
            bytes,
            mode,
            bambu,
        })
    }
}

/// Optional JSON body of `POST /api/v1/jobs/{id}/reprint`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReprintRequest {
    pub mode: Option<DispatchMode>,
    pub plate: Option<u32>,
    pub use_ams: Option<bool>,
    pub ams_mapping: Option<Vec<i32>>,
}

impl ReprintRequest {
    pub fn mode(&self) -> DispatchMode {
        self.mode.unwrap_or(DispatchMode::UploadAndStart)
    }

    pub fn bambu(&self) -> BambuStartOptions {
        let defaults = BambuStartOptions::default();
        BambuStartOptions {
            plate: self.plate.unwrap_or(defaults.plate),
            use_ams: self.use_ams.unwrap_or(defaults.use_ams),
            ams_mapping: self.ams_mapping.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ams_mapping_accepts_json_or_csv() {
        assert_eq!(parse_ams_mapping("[0, 2, -1]").unwrap(), vec![0, 2, -1]);
        assert_eq!(parse_ams_mapping("1,3").unwrap(), vec![1, 3]);
        assert!(parse_ams_mapping("").unwrap().is_empty());
        assert!(parse_ams_mapping("a,b").is_err());
    }

    #[test]
    fn reprint_defaults() {
        let req: ReprintRequest = serde_json::from_str(r#"{"mode":"upload_only","plate":3}"#).unwrap();
        assert_eq!(req.mode(), DispatchMode::UploadOnly);
        assert_eq!(req.bambu().plate, 3);
        assert_eq!(ReprintRequest::default().mode(), DispatchMode::UploadAndStart);
    }
}
