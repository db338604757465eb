use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::PrusaError;

pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Thin PrusaLink HTTP client. Timeouts are per request so scrapes and status checks can use
/// different budgets over one connection pool.
#[derive(Debug, Clone)]
pub struct PrusaClient {
    http: Client,
}

impl PrusaClient {
    pub fn new() -> Result<Self, PrusaError> {
        let http = Client::builder()
            .user_agent(concat!("printfleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// `http://{address}`; the address may carry a port.
    pub fn base_url(address: &str) -> String {
        format!("http://{}", address)
    }

    pub fn url(address: &str, path: &str) -> String {
        format!("{}{}", Self::base_url(address), path)
    }

    pub fn request(&self, method: Method, address: &str, api_key: &str, path: &str, timeout: Duration) -> RequestBuilder {
        let builder = self.http.request(method, Self::url(address, path)).timeout(timeout);
        if api_key.is_empty() {
            builder
        } else {
            builder.header(API_KEY_HEADER, api_key)
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        address: &str,
        api_key: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<T, PrusaError> {
        let response = self.request(Method::GET, address, api_key, path, timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PrusaError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| PrusaError::Decode(format!("{}: {}", path, e)))
    }
}
