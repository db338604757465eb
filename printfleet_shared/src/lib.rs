// printfleet_shared: data model, store interfaces and config shared by the host and its tests

pub mod api_models;
pub mod auth_backend;
pub mod config;
pub mod memory;
pub mod models;
pub mod object_storage;
pub mod print_job;
pub mod stores;

pub use auth_backend::InMemoryAuthBackend;
pub use models::{GcodePrintJob, Printer, PrinterType};
pub use print_job::{JobStatus, PrintJobError};
pub use stores::{InventoryStats, ObjectStorage, PrintJobStore, PrinterRoster, StoreError};

// AuthBackend trait
use async_trait::async_trait;
#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    /// Validate credentials. Returns true if valid.
    async fn validate(&self, username: &str, password: &str) -> bool;
}
