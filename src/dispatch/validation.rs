//! Allow-list checks for values that end up in MQTT topics, FTPS URLs and file paths.

use std::net::IpAddr;

use crate::bambu::BambuError;

const MAX_FILENAME_LEN: usize = 200;

fn invalid(field: &'static str, reason: impl Into<String>) -> BambuError {
    BambuError::Invalid {
        field,
        reason: reason.into(),
    }
}

pub fn validate_ip(ip: &str) -> Result<IpAddr, BambuError> {
    ip.parse::<IpAddr>()
        .map_err(|_| invalid("ip address", format!("'{}' is not an IP address", ip)))
}

/// LAN access codes are short alphanumeric strings.
pub fn validate_access_code(code: &str) -> Result<(), BambuError> {
    if !(4..=32).contains(&code.len()) {
        return Err(invalid("access code", "must be 4 to 32 characters"));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("access code", "must be alphanumeric"));
    }
    Ok(())
}

/// Serials are interpolated into topics, so `/`, `+` and `#` must never get through.
pub fn validate_serial(serial: &str) -> Result<(), BambuError> {
    if !(6..=32).contains(&serial.len()) {
        return Err(invalid("serial number", "must be 6 to 32 characters"));
    }
    if !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("serial number", "must be alphanumeric"));
    }
    Ok(())
}

/// Project files uploaded to `cache/` on the printer.
pub fn validate_bambu_filename(filename: &str) -> Result<(), BambuError> {
    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return Err(invalid("filename", format!("must be 1 to {} characters", MAX_FILENAME_LEN)));
    }
    if filename.starts_with('.') || filename.contains("..") {
        return Err(invalid("filename", "must not start with '.' or contain '..'"));
    }
    if !filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ' | '(' | ')'))
    {
        return Err(invalid("filename", "contains characters outside [A-Za-z0-9._-() ]"));
    }
    if !filename.to_ascii_lowercase().ends_with(".3mf") {
        return Err(invalid("filename", "must be a .3mf project"));
    }
    Ok(())
}

/// Reduce an uploaded name to a safe object-key component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let mut out: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    if out.is_empty() {
        out.push_str("upload");
    }
    out
}
