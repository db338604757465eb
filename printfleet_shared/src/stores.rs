//! Interfaces to the external store and object storage.
//!
//! The telemetry/dispatch core only depends on these traits; the relational schema and the
//! storage backend live elsewhere.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::{GcodePrintJob, InventorySummary, NewPrintJob, Printer, PrinterType};
use crate::print_job::{DispatchOutcome, JobStatus, PrintJobError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Job(#[from] PrintJobError),
}

/// Read access to the printer roster.
#[async_trait]
pub trait PrinterRoster: Send + Sync + 'static {
    async fn list_printers(&self) -> Result<Vec<Printer>, StoreError>;

    async fn get_printer(&self, id: i64) -> Result<Option<Printer>, StoreError>;

    async fn list_by_type(&self, printer_type: PrinterType) -> Result<Vec<Printer>, StoreError> {
        Ok(self
            .list_printers()
            .await?
            .into_iter()
            .filter(|p| p.printer_type == printer_type)
            .collect())
    }
}

/// Print-job rows. Rows are created and updated, never deleted.
#[async_trait]
pub trait PrintJobStore: Send + Sync + 'static {
    async fn create_job(&self, job: NewPrintJob) -> Result<GcodePrintJob, StoreError>;

    /// Persist the outcome of a dispatch attempt. Fails with `InvalidTransition` when the job
    /// already left `STORED`.
    async fn record_dispatch(
        &self,
        id: i64,
        outcome: DispatchOutcome,
    ) -> Result<GcodePrintJob, StoreError>;

    async fn get_job(&self, id: i64) -> Result<Option<GcodePrintJob>, StoreError>;

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError>;
}

/// Inventory count/sum queries used by the metrics endpoint.
#[async_trait]
pub trait InventoryStats: Send + Sync + 'static {
    async fn inventory_summary(&self) -> Result<InventorySummary, StoreError>;
}

/// Object storage for uploaded print files.
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    async fn upload_file(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn download_file(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String, StoreError>;
}
