use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded into a [`crate::types::Job`].
    #[error("Invalid job {id}: {reason}")]
    InvalidJob { id: String, reason: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job exists but carries no claim marker.
    #[error("Job is not claimed: {id}")]
    NotClaimed { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that abort a whole run. Everything else is reported per job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing credentials or an unusable engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The due-scan itself failed; no job was claimed.
    #[error("Selection failed: {0}")]
    Selection(#[source] SchedulerError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Selection(_) => "SELECTION_ERROR",
        }
    }
}

impl From<fleetsched_core::FleetError> for EngineError {
    fn from(e: fleetsched_core::FleetError) -> Self {
        EngineError::Config(e.to_string())
    }
}
