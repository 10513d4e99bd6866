//! Per-image annotation state
//!
//! State progression for a single record:
//! UNANNOTATED → PENDING → GENERATING → DONE | FAILED
//!
//! `Pending` and `Generating` are the in-flight states guarded by
//! `CaptionStore::begin_generation`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Annotation state of one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationState {
    /// No caption yet
    Unannotated,
    /// Accepted for generation, waiting in the work queue
    Pending,
    /// A worker is running inference for this image
    Generating,
    /// Caption present (generated, loaded from disk, or edited)
    Done,
    /// Last generation attempt failed; see `last_error`
    Failed,
}

impl AnnotationState {
    /// True while a generation job owns the record
    pub fn is_in_flight(self) -> bool {
        matches!(self, AnnotationState::Pending | AnnotationState::Generating)
    }
}

impl fmt::Display for AnnotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnnotationState::Unannotated => "UNANNOTATED",
            AnnotationState::Pending => "PENDING",
            AnnotationState::Generating => "GENERATING",
            AnnotationState::Done => "DONE",
            AnnotationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Kind of a per-image failure, kept for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    ModelError,
    InvalidInput,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ModelError => "ModelError",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Io => "Io",
        };
        f.write_str(name)
    }
}

/// Error recorded on a `Failed` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One image in the corpus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Identifier derived from the file name relative to the corpus root
    pub id: String,

    /// Source image location (owned by the filesystem)
    pub path: PathBuf,

    /// Assigned prompt type identifier
    pub prompt_type: String,

    /// Current caption, may be empty
    pub caption_text: String,

    pub state: AnnotationState,

    /// Present only while `state == Failed`
    pub last_error: Option<RecordError>,

    /// In-memory caption differs from the caption file
    pub dirty: bool,
}

impl ImageRecord {
    /// New record for a freshly discovered image
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, prompt_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            prompt_type: prompt_type.into(),
            caption_text: String::new(),
            state: AnnotationState::Unannotated,
            last_error: None,
            dirty: false,
        }
    }

    /// CSV projection
    pub fn to_export_row(&self) -> ExportRow {
        ExportRow {
            id: self.id.clone(),
            path: self.path.to_string_lossy().into_owned(),
            prompt_type: self.prompt_type.clone(),
            caption_text: self.caption_text.clone(),
        }
    }
}

/// Denormalized read-only projection of a record for CSV transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    pub id: String,
    pub path: String,
    pub prompt_type: String,
    pub caption_text: String,
}
