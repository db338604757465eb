use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PrintJobError {
    #[error("Job not found: {0}")]
    NotFound(i64),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

/// Dispatch state of a stored print job.
///
/// A job row is created `Stored` and leaves that state exactly once. A reprint creates a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Stored,
    Dispatched,
    DispatchFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 3] = [JobStatus::Stored, JobStatus::Dispatched, JobStatus::DispatchFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Stored => "STORED",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::DispatchFailed => "DISPATCH_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Stored)
    }

    /// Validate a transition and return the new state.
    pub fn transition(self, outcome: &DispatchOutcome) -> Result<JobStatus, PrintJobError> {
        match self {
            JobStatus::Stored => Ok(match outcome {
                DispatchOutcome::Dispatched { .. } => JobStatus::Dispatched,
                DispatchOutcome::Failed { .. } => JobStatus::DispatchFailed,
            }),
            JobStatus::Dispatched => Err(PrintJobError::InvalidTransition(
                "Job was already dispatched".to_string(),
            )),
            JobStatus::DispatchFailed => Err(PrintJobError::InvalidTransition(
                "Job dispatch already failed; reprint creates a new job".to_string(),
            )),
        }
    }
}

/// Result of one dispatch attempt, persisted onto the job row.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched { response: String },
    Failed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_moves_to_either_terminal_state() {
        let ok = DispatchOutcome::Dispatched { response: "ok".into() };
        let failed = DispatchOutcome::Failed { error: "boom".into() };
        assert_eq!(JobStatus::Stored.transition(&ok).unwrap(), JobStatus::Dispatched);
        assert_eq!(JobStatus::Stored.transition(&failed).unwrap(), JobStatus::DispatchFailed);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let ok = DispatchOutcome::Dispatched { response: "ok".into() };
        let err = JobStatus::Dispatched.transition(&ok).unwrap_err();
        assert!(matches!(err, PrintJobError::InvalidTransition(_)));
        let err = JobStatus::DispatchFailed.transition(&ok).unwrap_err();
        assert!(matches!(err, PrintJobError::InvalidTransition(_)));
    }

    #[test]
    fn status_serializes_as_store_enum() {
        let json = serde_json::to_string(&JobStatus::DispatchFailed).unwrap();
        assert_eq!(json, "\"DISPATCH_FAILED\"");
        assert_eq!(JobStatus::Stored.as_str(), "STORED");
    }
}
