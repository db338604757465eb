//! Print submission: store the file, create the job row, dispatch, persist the outcome.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use printfleet_shared::api_models::DownloadLinkResponse;
use printfleet_shared::models::NewPrintJob;
use printfleet_shared::print_job::DispatchOutcome;
use printfleet_shared::{GcodePrintJob, ObjectStorage, PrintJobStore, Printer, PrinterRoster, PrinterType, StoreError};

use crate::dispatch::validation::sanitize_filename;
use crate::dispatch::{BambuStartOptions, DispatchError, DispatchMode, DispatchRequest, PrintDispatcher};

const HASH_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("printer {0} not found")]
    PrinterNotFound(i64),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// The job row exists and carries the error; `source` is what the device said.
    #[error("{source}")]
    Dispatch {
        job_id: i64,
        #[source]
        source: DispatchError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dispatch task failed: {0}")]
    Task(String),
}

/// A user's upload.
#[derive(Debug, Clone)]
pub struct SubmitPrint {
    pub user_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mode: DispatchMode,
    pub bambu: BambuStartOptions,
}

/// `prints/{user}/{timestamp}_{hash prefix}_{name}`
pub fn object_key(user_id: &str, at: DateTime<Utc>, content_hash: &str, sanitized_name: &str) -> String {
    let prefix: String = content_hash.chars().take(HASH_PREFIX_LEN).collect();
    format!(
        "prints/{}/{}_{}_{}",
        sanitize_filename(user_id),
        at.format("%Y%m%dT%H%M%SZ"),
        prefix,
        sanitized_name
    )
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn allowed_extensions(printer_type: PrinterType) -> &'static [&'static str] {
    match printer_type {
        PrinterType::Prusa => &[".gcode", ".bgcode"],
        PrinterType::Bambu => &[".3mf"],
    }
}

pub struct PrintJobManager {
    roster: Arc<dyn PrinterRoster>,
    jobs: Arc<dyn PrintJobStore>,
    storage: Arc<dyn ObjectStorage>,
    dispatcher: Arc<dyn PrintDispatcher>,
    max_upload_bytes: u64,
    presign_ttl: Duration,
}

impl PrintJobManager {
    pub fn new(
        roster: Arc<dyn PrinterRoster>,
        jobs: Arc<dyn PrintJobStore>,
        storage: Arc<dyn ObjectStorage>,
        dispatcher: Arc<dyn PrintDispatcher>,
    ) -> Self {
        Self {
            roster,
            jobs,
            storage,
            dispatcher,
            max_upload_bytes: 512 * 1024 * 1024,
            presign_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_limits(mut self, max_upload_bytes: u64, presign_ttl: Duration) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self.presign_ttl = presign_ttl;
        self
    }

    async fn printer(&self, id: i64) -> Result<Printer, JobError> {
        self.roster.get_printer(id).await?.ok_or(JobError::PrinterNotFound(id))
    }

    /// Store and dispatch a new upload. The returned job is already out of `STORED`.
    pub async fn submit(&self, printer_id: i64, upload: SubmitPrint) -> Result<GcodePrintJob, JobError> {
        let printer = self.printer(printer_id).await?;
        if upload.bytes.is_empty() {
            return Err(JobError::InvalidUpload("file is empty".to_string()));
        }
        if upload.bytes.len() as u64 > self.max_upload_bytes {
            return Err(JobError::InvalidUpload(format!(
                "file exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        let name = sanitize_filename(&upload.filename);
        let lower = name.to_ascii_lowercase();
        let allowed = allowed_extensions(printer.printer_type);
        if !allowed.iter().any(|ext| lower.ends_with(ext)) {
            return Err(JobError::InvalidUpload(format!(
                "{} printers accept {}",
                printer.printer_type,
                allowed.join(", ")
            )));
        }

        let hash = content_hash(&upload.bytes);
        let key = object_key(&upload.user_id, Utc::now(), &hash, &name);
        self.storage.upload_file(&key, upload.bytes.clone()).await?;

        let new_job = NewPrintJob {
            printer_id,
            user_id: upload.user_id.clone(),
            filename: name,
            content_hash: hash,
            size_bytes: upload.bytes.len() as u64,
            storage_key: key,
        };
        self.spawn_dispatch(printer, new_job, upload.bytes, upload.mode, upload.bambu)
            .await
    }

    /// Dispatch a stored job's file again as a new job row.
    pub async fn reprint(
        &self,
        job_id: i64,
        user_id: &str,
        mode: DispatchMode,
        bambu: BambuStartOptions,
    ) -> Result<GcodePrintJob, JobError> {
        let original = self.jobs.get_job(job_id).await?.ok_or(JobError::JobNotFound(job_id))?;
        let printer = self.printer(original.printer_id).await?;
        let bytes = self.storage.download_file(&original.storage_key).await?;

        info!("Reprinting job {} on {}", job_id, printer.name);

        let new_job = NewPrintJob {
            printer_id: original.printer_id,
            user_id: user_id.to_string(),
            filename: original.filename,
            content_hash: original.content_hash,
            size_bytes: bytes.len() as u64,
            storage_key: original.storage_key,
        };
        self.spawn_dispatch(printer, new_job, bytes, mode, bambu).await
    }

    pub async fn download_link(&self, job_id: i64) -> Result<DownloadLinkResponse, JobError> {
        let job = self.jobs.get_job(job_id).await?.ok_or(JobError::JobNotFound(job_id))?;
        let url = self.storage.presign_download(&job.storage_key, self.presign_ttl).await?;
        Ok(DownloadLinkResponse {
            url,
            expires_in_secs: self.presign_ttl.as_secs(),
        })
    }

    /// Create the job row and dispatch it on a detached task. Dropping the returned future
    /// does not stop the task, so a created row always leaves `STORED`.
    async fn spawn_dispatch(
        &self,
        printer: Printer,
        new_job: NewPrintJob,
        bytes: Vec<u8>,
        mode: DispatchMode,
        bambu: BambuStartOptions,
    ) -> Result<GcodePrintJob, JobError> {
        let task = tokio::spawn(create_and_dispatch(
            self.jobs.clone(),
            self.dispatcher.clone(),
            printer,
            new_job,
            bytes,
            mode,
            bambu,
        ));
        task.await.map_err(|e| JobError::Task(e.to_string()))?
    }
}

async fn create_and_dispatch(
    jobs: Arc<dyn PrintJobStore>,
    dispatcher: Arc<dyn PrintDispatcher>,
    printer: Printer,
    new_job: NewPrintJob,
    bytes: Vec<u8>,
    mode: DispatchMode,
    bambu: BambuStartOptions,
) -> Result<GcodePrintJob, JobError> {
    let job = jobs.create_job(new_job).await?;
    info!("Stored job {} ({}) for printer {}", job.id, job.filename, printer.name);

    let request = DispatchRequest {
        printer_type: printer.printer_type,
        ip_address: printer.ip_address.clone(),
        file: bytes,
        filename: job.filename.clone(),
        credential: printer.credential().to_string(),
        serial: printer.serial().map(str::to_string),
        mode,
        bambu,
    };

    let result = match AssertUnwindSafe(dispatcher.dispatch(request)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Internal("dispatcher panicked".to_string())),
    };

    match result {
        Ok(receipt) => {
            let job = jobs
                .record_dispatch(
                    job.id,
                    DispatchOutcome::Dispatched {
                        response: receipt.to_json_string(),
                    },
                )
                .await?;
            info!("Job {} dispatched to {}", job.id, printer.name);
            Ok(job)
        }
        Err(e) => {
            error!("Job {} dispatch to {} failed: {}", job.id, printer.name, e);
            if let Err(store_err) = jobs
                .record_dispatch(job.id, DispatchOutcome::Failed { error: e.to_string() })
                .await
            {
                error!("Recording failure of job {} failed: {}", job.id, store_err);
            }
            Err(JobError::Dispatch { job_id: job.id, source: e })
        }
    }
}
