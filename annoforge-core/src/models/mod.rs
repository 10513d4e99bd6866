//! Data models for the annotation pipeline

pub mod generation_job;
pub mod image_record;
pub mod prompt_type;

pub use generation_job::{GenerationJob, SubmitReceipt};
pub use image_record::{AnnotationState, ErrorKind, ExportRow, ImageRecord, RecordError};
pub use prompt_type::PromptType;
