use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by pipeline lifecycle and execution operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline \"{0}\" cannot be found")]
    NotFound(String),
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("pipeline \"{0}\" already exists")]
    AlreadyExists(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("pipeline {pipeline}: command failed: {source}")]
    CommandFailed {
        pipeline: String,
        #[source]
        source: CommandError,
    },
    #[error("timed out after {timeout:?} waiting for writers on {relation}")]
    ResolutionTimeout { relation: String, timeout: Duration },
    #[error("scheduler error: {0}")]
    SchedulerError(String),
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration(message.into())
    }
}

/// A failure raised by the user command itself, as opposed to the engine around it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CommandError {
    pub message: String,
    // Cancellations and statement timeouts are reported the same way as errors
    pub cancelled: bool,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: true,
        }
    }
}
