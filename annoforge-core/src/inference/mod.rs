//! Inference engine seam
//!
//! The model itself is external. The scheduler only needs a blocking
//! `infer(image, prompt)` call that either yields text or one of three
//! failure kinds.

pub mod command_engine;

pub use command_engine::CommandInferenceEngine;

use crate::models::{ErrorKind, PromptType, RecordError};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Inference failure; every variant routes to `fail_generation`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// Deadline exceeded
    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    /// Model ran but reported an error
    #[error("Model error: {0}")]
    ModelError(String),

    /// Image missing or unreadable by the model
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Timeout(_) => ErrorKind::Timeout,
            InferenceError::ModelError(_) => ErrorKind::ModelError,
            InferenceError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Error as stored on a failed record
    pub fn to_record_error(&self) -> RecordError {
        let message = match self {
            InferenceError::Timeout(limit) => format!("timed out after {}s", limit.as_secs()),
            InferenceError::ModelError(msg) | InferenceError::InvalidInput(msg) => msg.clone(),
        };
        RecordError::new(self.kind(), message)
    }
}

/// Produces caption text for one image
///
/// Called from the blocking thread pool; implementations may block for the
/// whole inference.
pub trait InferenceEngine: Send + Sync {
    fn infer(&self, image_path: &Path, prompt_type: &PromptType) -> Result<String, InferenceError>;
}
