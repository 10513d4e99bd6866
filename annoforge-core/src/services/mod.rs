//! Services for the annotation pipeline

pub mod corpus_scanner;
pub mod csv_transfer;
pub mod generation_scheduler;
pub mod prompt_registry;
pub mod text_operations;

pub use corpus_scanner::{CorpusScanner, ImageScanner, ScanError, ScanReport};
pub use csv_transfer::{export_csv, import_csv, ImportReport};
pub use generation_scheduler::GenerationScheduler;
pub use prompt_registry::PromptRegistry;
pub use text_operations::{
    commit, find_replace, search, CommitReport, FindPattern, FindReplacePreview, PreviewEntry,
    Scope, SearchQuery,
};
