//! ClipJobs Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

use super::{ClipId, JobId};

/// Core scheduler error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Clip not found: {0}")]
    ClipNotFound(ClipId),

    #[error("Clip {clip_id} is not part of job {job_id}")]
    ClipNotInJob { job_id: JobId, clip_id: ClipId },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    // =========================================================================
    // History Errors
    // =========================================================================
    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Nothing to redo")]
    NothingToRedo,

    #[error("History step failed: {0}")]
    HistoryStepFailed(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;
