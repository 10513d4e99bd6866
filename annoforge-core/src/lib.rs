//! annoforge-core library interface
//!
//! Batch caption generation and editing for image corpora. The
//! [`CaptionStore`] is the single source of truth; the scanner, scheduler,
//! text operations and CSV transfer all work through it.

pub mod error;
pub mod inference;
pub mod models;
pub mod services;
pub mod store;

pub use crate::error::{CoreError, CoreResult};
pub use crate::store::CaptionStore;

use annoforge_common::config::{SessionDefaults, TomlConfig};
use annoforge_common::events::EventBus;
use chrono::{DateTime, Utc};
use services::{CorpusScanner, GenerationScheduler, PromptRegistry, ScanReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::CaptionFiles;

/// One open corpus folder with its store
pub struct CorpusSession {
    folder: PathBuf,
    store: Arc<CaptionStore>,
    scanner: CorpusScanner,
    /// Session start, for status output
    pub opened_at: DateTime<Utc>,
}

impl CorpusSession {
    /// Build a store for `folder` from config and session defaults, then scan it
    pub fn open(
        folder: impl Into<PathBuf>,
        config: &TomlConfig,
        defaults: &SessionDefaults,
        event_bus: EventBus,
    ) -> CoreResult<(Self, ScanReport)> {
        let store = CaptionStore::new(
            PromptRegistry::builtin(),
            &defaults.default_prompt_type,
            CaptionFiles::new(config.generation.caption_extension.as_str()),
            event_bus,
        )?;
        let session = Self {
            folder: folder.into(),
            store: Arc::new(store),
            scanner: CorpusScanner::new(config.scan.max_depth),
            opened_at: Utc::now(),
        };
        let report = session.rescan()?;
        Ok((session, report))
    }

    /// Reconcile the store with the folder contents
    pub fn rescan(&self) -> CoreResult<ScanReport> {
        self.scanner.scan(&self.folder, &self.store)
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn store(&self) -> &Arc<CaptionStore> {
        &self.store
    }

    /// Start a scheduler over this session's store
    pub fn start_scheduler(
        &self,
        engine: Arc<dyn inference::InferenceEngine>,
        worker_limit: usize,
    ) -> GenerationScheduler {
        GenerationScheduler::start(Arc::clone(&self.store), engine, worker_limit)
    }
}
