//! Implicit-TLS FTPS upload to a Bambu printer's `cache/` directory.
//!
//! Uploads run the curl binary as an external process. Native FTPS clients hang when the printer
//! tears down the TLS session of the data channel; curl tolerates it.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::bambu::connection::LAN_USER;
use crate::bambu::{BambuError, Result};
use crate::dispatch::encode_path_segment;

#[async_trait]
pub trait FileTransfer: Send + Sync + 'static {
    async fn upload(&self, ip: &str, access_code: &str, filename: &str, bytes: &[u8]) -> Result<()>;
}

pub struct CurlFtpsUploader {
    explicit: Option<PathBuf>,
    port: u16,
    timeout: Duration,
    connect_timeout: Duration,
    resolved: OnceCell<PathBuf>,
}

impl CurlFtpsUploader {
    pub fn new(explicit: Option<PathBuf>, port: u16, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            explicit,
            port,
            timeout,
            connect_timeout,
            resolved: OnceCell::new(),
        }
    }

    /// `ftps://{ip}:{port}/cache/{name}` with the name percent-encoded.
    pub fn target_url(&self, ip: &str, filename: &str) -> String {
        format!("ftps://{}:{}/cache/{}", ip, self.port, encode_path_segment(filename))
    }

    /// Arguments for one upload. Credentials are not among them; they go through stdin.
    fn curl_args(&self, staged: &Path, url: &str) -> Vec<OsString> {
        vec![
            "--silent".into(),
            "--show-error".into(),
            "--ssl-reqd".into(),
            "--insecure".into(),
            "--connect-timeout".into(),
            self.connect_timeout.as_secs().max(1).to_string().into(),
            "--config".into(),
            "-".into(),
            "-T".into(),
            staged.as_os_str().to_owned(),
            url.into(),
        ]
    }

    async fn curl(&self) -> Result<&PathBuf> {
        self.resolved
            .get_or_try_init(|| async {
                match &self.explicit {
                    Some(path) if path.is_file() => Ok(path.clone()),
                    Some(path) => Err(BambuError::Upload(format!("curl not found at {}", path.display()))),
                    None => find_on_path("curl")
                        .ok_or_else(|| BambuError::Upload("curl executable not found on PATH".to_string())),
                }
            })
            .await
    }
}

/// curl config line carrying the LAN user and access code.
fn credentials_config(access_code: &str) -> String {
    let escaped = format!("{}:{}", LAN_USER, access_code)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!("user = \"{}\"\n", escaped)
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl FileTransfer for CurlFtpsUploader {
    async fn upload(&self, ip: &str, access_code: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let curl = self.curl().await?.clone();

        let staged = tempfile::Builder::new().prefix("printfleet-").suffix(".3mf").tempfile()?;
        let staged_path = staged.path().to_path_buf();
        let mut file = tokio::fs::File::create(&staged_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        let url = self.target_url(ip, filename);
        debug!("Uploading {} bytes to {}", bytes.len(), url);
        let mut child = Command::new(&curl)
            .args(self.curl_args(&staged_path, &url))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        // Kept off the command line, where other local users could read it.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(credentials_config(access_code).as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BambuError::Timeout(format!("FTPS upload to {} exceeded {:?}", ip, self.timeout)))??;
        drop(staged);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BambuError::Upload(format!(
                "curl exited with {}: {}",
                output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                stderr.trim()
            )));
        }
        info!("Uploaded {} to {}", filename, ip);
        Ok(())
    }
}
