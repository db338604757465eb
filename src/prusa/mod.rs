//! PrusaLink REST integration.

pub mod client;
pub mod collector;
pub mod models;

use thiserror::Error;

pub use client::PrusaClient;
pub use collector::{ModelCache, PrusaCollector};

#[derive(Debug, Error)]
pub enum PrusaError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{path} returned HTTP {status}")]
    Status { path: String, status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}
