//! Error types for annoforge-core
//!
//! Per-image failures (inference, a single caption write) are recorded on the
//! record and never abort a batch. Structural errors (unknown prompt type,
//! malformed CSV) are returned to the caller before any state changes.

use crate::models::AnnotationState;
use crate::services::corpus_scanner::ScanError;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    /// Prompt type not present in the registry
    #[error("Invalid prompt type: {0}")]
    InvalidPromptType(String),

    /// No record with this id
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Operation not allowed in the record's current state
    #[error("Cannot {operation} record {id} in state {state}")]
    InvalidTransition {
        id: String,
        state: AnnotationState,
        operation: &'static str,
    },

    /// Caption changed since a find-replace preview was taken
    #[error("Caption for {0} changed since preview")]
    StaleEdit(String),

    /// Caption file read/write failure
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV file could not be parsed or validated
    #[error("Malformed CSV at line {line}: {message}")]
    MalformedCsv { line: usize, message: String },

    /// Find pattern rejected
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Generation scheduler no longer accepts work
    #[error("Generation scheduler is shut down")]
    SchedulerStopped,

    /// Corpus scan error
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// annoforge-common error
    #[error("Common error: {0}")]
    Common(#[from] annoforge_common::Error),
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
