//! In-memory store implementations for single-node runs and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::models::{GcodePrintJob, InventorySummary, NewPrintJob, Printer};
use crate::print_job::{DispatchOutcome, JobStatus};
use crate::stores::{InventoryStats, ObjectStorage, PrintJobStore, PrinterRoster, StoreError};

/// Roster backed by a vector that can be swapped at runtime.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRoster {
    printers: Arc<RwLock<Vec<Printer>>>,
}

impl InMemoryRoster {
    pub fn new(printers: Vec<Printer>) -> Self {
        Self { printers: Arc::new(RwLock::new(printers)) }
    }

    pub async fn replace(&self, printers: Vec<Printer>) {
        *self.printers.write().await = printers;
    }
}

#[async_trait]
impl PrinterRoster for InMemoryRoster {
    async fn list_printers(&self) -> Result<Vec<Printer>, StoreError> {
        Ok(self.printers.read().await.clone())
    }

    async fn get_printer(&self, id: i64) -> Result<Option<Printer>, StoreError> {
        Ok(self.printers.read().await.iter().find(|p| p.id == id).cloned())
    }
}

#[derive(Debug, Default)]
struct JobTable {
    next_id: i64,
    rows: HashMap<i64, GcodePrintJob>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<RwLock<JobTable>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_jobs(&self) -> Vec<GcodePrintJob> {
        let table = self.inner.read().await;
        let mut jobs: Vec<_> = table.rows.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

#[async_trait]
impl PrintJobStore for InMemoryJobStore {
    async fn create_job(&self, job: NewPrintJob) -> Result<GcodePrintJob, StoreError> {
        let mut table = self.inner.write().await;
        table.next_id += 1;
        let now = Utc::now();
        let row = GcodePrintJob {
            id: table.next_id,
            printer_id: job.printer_id,
            user_id: job.user_id,
            filename: job.filename,
            status: JobStatus::Stored,
            content_hash: job.content_hash,
            size_bytes: job.size_bytes,
            storage_key: job.storage_key,
            dispatch_response: None,
            dispatch_error: None,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn record_dispatch(
        &self,
        id: i64,
        outcome: DispatchOutcome,
    ) -> Result<GcodePrintJob, StoreError> {
        let mut table = self.inner.write().await;
        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("print job {}", id)))?;
        row.status = row.status.transition(&outcome)?;
        match outcome {
            DispatchOutcome::Dispatched { response } => {
                row.dispatch_response = Some(response);
                row.dispatch_error = None;
            }
            DispatchOutcome::Failed { error } => {
                row.dispatch_response = None;
                row.dispatch_error = Some(error);
            }
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn get_job(&self, id: i64) -> Result<Option<GcodePrintJob>, StoreError> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError> {
        let table = self.inner.read().await;
        Ok(JobStatus::ALL
            .iter()
            .map(|status| {
                let count = table.rows.values().filter(|j| j.status == *status).count() as u64;
                (*status, count)
            })
            .collect())
    }
}

/// Inventory aggregates supplied up front (from config or a test).
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    summary: Arc<RwLock<InventorySummary>>,
}

impl StaticInventory {
    pub fn new(summary: InventorySummary) -> Self {
        Self { summary: Arc::new(RwLock::new(summary)) }
    }
}

#[async_trait]
impl InventoryStats for StaticInventory {
    async fn inventory_summary(&self) -> Result<InventorySummary, StoreError> {
        Ok(self.summary.read().await.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStorage {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload_file(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn download_file(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        if !self.objects.read().await.contains_key(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?ttl={}", key, ttl.as_secs()))
    }
}
