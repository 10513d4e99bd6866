//! Caption Record Store
//!
//! Single source of truth for per-image annotation state. Every mutation
//! goes through a method here; the record index sits behind one `RwLock`
//! and caption file writes are serialized by a separate write gate, so
//! readers never wait on disk I/O.
//!
//! Every operation applies its in-memory transition first and only then
//! writes the caption file. A failed write leaves the record `dirty`.
//!
//! # Generation ownership
//!
//! [`CaptionStore::begin_generation`] is the de-duplication guard: it admits
//! a record into the in-flight states (`Pending`, then `Generating`) only if
//! no other job holds it. Whoever got `true` back owns the record until it
//! calls `complete_generation`, `fail_generation` or `cancel_generation`.

pub mod caption_file;

pub use caption_file::{CaptionFiles, CommitHook};

use crate::error::{CoreError, CoreResult};
use crate::models::{AnnotationState, ErrorKind, ImageRecord, RecordError};
use crate::services::prompt_registry::PromptRegistry;
use annoforge_common::events::{AnnotationEvent, EventBus};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// State saved when a record is admitted for generation, restored on cancel
#[derive(Debug, Clone)]
struct Claim {
    prior_state: AnnotationState,
    prior_prompt_type: String,
    prior_error: Option<RecordError>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Keyed by id; iteration order is corpus scan order
    records: BTreeMap<String, ImageRecord>,
    claims: HashMap<String, Claim>,
}

/// Outcome of [`CaptionStore::flush_dirty`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub written: Vec<String>,
    pub failed: Vec<String>,
}

/// In-memory record index plus durable caption files
pub struct CaptionStore {
    inner: RwLock<StoreInner>,
    // Held across a transition and its file write; orders disk writes the
    // same way as the transitions that produced them
    write_gate: Mutex<()>,
    files: CaptionFiles,
    registry: Arc<PromptRegistry>,
    default_prompt_type: String,
    event_bus: EventBus,
}

impl CaptionStore {
    /// Create an empty store
    ///
    /// `default_prompt_type` must resolve in `registry`; it is stored by its
    /// canonical identifier.
    pub fn new(
        registry: Arc<PromptRegistry>,
        default_prompt_type: &str,
        files: CaptionFiles,
        event_bus: EventBus,
    ) -> CoreResult<Self> {
        let default_prompt_type = registry.resolve(default_prompt_type)?.id.clone();
        Ok(Self {
            inner: RwLock::new(StoreInner::default()),
            write_gate: Mutex::new(()),
            files,
            registry,
            default_prompt_type,
            event_bus,
        })
    }

    pub fn registry(&self) -> &Arc<PromptRegistry> {
        &self.registry
    }

    pub fn default_prompt_type(&self) -> &str {
        &self.default_prompt_type
    }

    pub fn caption_files(&self) -> &CaptionFiles {
        &self.files
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    // ------------------------------------------------------------------
    // Corpus membership
    // ------------------------------------------------------------------

    /// Add a record if unseen; otherwise refresh its path. Returns `true` if added.
    pub fn upsert(&self, id: &str, path: &Path) -> bool {
        self.insert_scanned(id, path, None)
    }

    /// Add a record discovered by a scan together with its existing caption
    ///
    /// Non-empty caption text marks the record `Done` and clean. Existing
    /// records are left as they are (only the path is refreshed). The record
    /// is published fully formed, under one write lock.
    pub fn insert_scanned(&self, id: &str, path: &Path, caption: Option<String>) -> bool {
        let mut inner = self.write();
        if let Some(record) = inner.records.get_mut(id) {
            if record.path != path {
                debug!(image_id = %id, path = %path.display(), "Record path refreshed");
                record.path = path.to_path_buf();
            }
            return false;
        }

        let mut record = ImageRecord::new(id, path, self.default_prompt_type.clone());
        if let Some(text) = caption.filter(|t| !t.is_empty()) {
            record.caption_text = text;
            record.state = AnnotationState::Done;
        }
        inner.records.insert(id.to_string(), record);
        true
    }

    /// Drop a record whose image disappeared; the caption file is kept
    pub fn remove(&self, id: &str) -> Option<ImageRecord> {
        let mut inner = self.write();
        inner.claims.remove(id);
        let removed = inner.records.remove(id);
        if let Some(record) = &removed {
            if record.state.is_in_flight() {
                warn!(image_id = %id, state = %record.state, "Removed record that was in flight");
            }
        }
        removed
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.read().records.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Ids in corpus scan order
    pub fn ids(&self) -> Vec<String> {
        self.read().records.keys().cloned().collect()
    }

    /// Read-only copy of all records in corpus scan order
    pub fn snapshot(&self) -> Vec<ImageRecord> {
        self.read().records.values().cloned().collect()
    }

    /// Caption file location for a record
    pub fn caption_path(&self, id: &str) -> Option<PathBuf> {
        self.read()
            .records
            .get(id)
            .map(|r| self.files.caption_path(&r.path))
    }

    // ------------------------------------------------------------------
    // Prompt types
    // ------------------------------------------------------------------

    /// Assign a prompt type to many records
    ///
    /// The prompt type is validated before anything changes. Returns the ids
    /// that have no record. Caption text and state are not touched.
    pub fn set_prompt_type(&self, ids: &[String], prompt_type: &str) -> CoreResult<Vec<String>> {
        let prompt = self.registry.resolve(prompt_type)?;

        let mut not_found = Vec::new();
        let mut assigned = Vec::new();
        {
            let mut inner = self.write();
            let StoreInner { records, claims } = &mut *inner;
            for id in ids {
                match records.get_mut(id) {
                    Some(record) => {
                        record.prompt_type = prompt.id.clone();
                        // Keep the assignment if the running job is cancelled
                        if let Some(claim) = claims.get_mut(id) {
                            claim.prior_prompt_type = prompt.id.clone();
                        }
                        assigned.push(id.clone());
                    }
                    None => not_found.push(id.clone()),
                }
            }
        }

        if !assigned.is_empty() {
            self.event_bus.emit_lossy(AnnotationEvent::PromptTypeAssigned {
                image_ids: assigned,
                prompt_type: prompt.id.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(not_found)
    }

    // ------------------------------------------------------------------
    // Generation lifecycle
    // ------------------------------------------------------------------

    /// De-duplication guard
    ///
    /// `Unannotated | Done | Failed -> Pending` and adopts `prompt_type`.
    /// Returns `Ok(false)` without changing anything if the record is already
    /// `Pending` or `Generating`.
    pub fn begin_generation(&self, id: &str, prompt_type: &str) -> CoreResult<bool> {
        let mut inner = self.write();
        let StoreInner { records, claims } = &mut *inner;
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::RecordNotFound(id.to_string()))?;

        if record.state.is_in_flight() {
            debug!(image_id = %id, state = %record.state, "Generation already in flight");
            return Ok(false);
        }

        claims.insert(
            id.to_string(),
            Claim {
                prior_state: record.state,
                prior_prompt_type: record.prompt_type.clone(),
                prior_error: record.last_error.clone(),
            },
        );
        record.state = AnnotationState::Pending;
        record.prompt_type = prompt_type.to_string();
        record.last_error = None;
        Ok(true)
    }

    /// `Pending -> Generating` when a worker dequeues the job
    pub fn start_generation(&self, id: &str) -> CoreResult<ImageRecord> {
        let mut inner = self.write();
        let record = Self::record_in_state(&mut inner, id, AnnotationState::Pending, "start generation")?;
        record.state = AnnotationState::Generating;
        Ok(record.clone())
    }

    /// `Generating -> Done` with the generated text, then write the caption file
    ///
    /// If the write fails the record becomes `Failed` with an `Io` error,
    /// keeps the new text and stays dirty.
    pub fn complete_generation(&self, id: &str, text: &str) -> CoreResult<()> {
        let _gate = self.gate();

        let image_path = {
            let mut inner = self.write();
            let record =
                Self::record_in_state(&mut inner, id, AnnotationState::Generating, "complete generation")?;
            record.state = AnnotationState::Done;
            record.caption_text = text.to_string();
            record.last_error = None;
            record.dirty = true;
            let path = record.path.clone();
            inner.claims.remove(id);
            path
        };

        match self.persist(id, &image_path, text) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut inner = self.write();
                if let Some(record) = inner.records.get_mut(id) {
                    if record.state == AnnotationState::Done && record.caption_text == text {
                        record.state = AnnotationState::Failed;
                        record.last_error = Some(RecordError::new(ErrorKind::Io, err.to_string()));
                    }
                }
                Err(err)
            }
        }
    }

    /// `Generating -> Failed`; caption text unchanged
    pub fn fail_generation(&self, id: &str, error: RecordError) -> CoreResult<()> {
        let mut inner = self.write();
        let record = Self::record_in_state(&mut inner, id, AnnotationState::Generating, "fail generation")?;
        warn!(image_id = %id, error = %error, "Generation failed");
        record.state = AnnotationState::Failed;
        record.last_error = Some(error);
        inner.claims.remove(id);
        Ok(())
    }

    /// `Pending | Generating -> previous state`; not recorded as an error
    pub fn cancel_generation(&self, id: &str) -> CoreResult<()> {
        let mut inner = self.write();
        let StoreInner { records, claims } = &mut *inner;
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::RecordNotFound(id.to_string()))?;

        if !record.state.is_in_flight() {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                state: record.state,
                operation: "cancel generation",
            });
        }

        match claims.remove(id) {
            Some(claim) => {
                record.state = claim.prior_state;
                record.prompt_type = claim.prior_prompt_type;
                record.last_error = claim.prior_error;
            }
            None => {
                // Claim lost (should not happen); fall back to what the text implies
                record.state = if record.caption_text.is_empty() {
                    AnnotationState::Unannotated
                } else {
                    AnnotationState::Done
                };
            }
        }
        debug!(image_id = %id, state = %record.state, "Generation cancelled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// Direct edit; state is unchanged (`Failed` stays `Failed`)
    pub fn edit_caption(&self, id: &str, text: &str) -> CoreResult<()> {
        self.apply_edit(id, text, None)
    }

    /// Edit only if the current caption equals `expected`
    ///
    /// Returns [`CoreError::StaleEdit`] without writing otherwise.
    pub fn replace_caption_if(&self, id: &str, expected: &str, text: &str) -> CoreResult<()> {
        self.apply_edit(id, text, Some(expected))
    }

    fn apply_edit(&self, id: &str, text: &str, expected: Option<&str>) -> CoreResult<()> {
        let _gate = self.gate();

        let image_path = {
            let mut inner = self.write();
            let record = inner
                .records
                .get_mut(id)
                .ok_or_else(|| CoreError::RecordNotFound(id.to_string()))?;

            if let Some(expected) = expected {
                if record.caption_text != expected {
                    return Err(CoreError::StaleEdit(id.to_string()));
                }
            }
            if record.caption_text == text && !record.dirty {
                return Ok(());
            }
            record.caption_text = text.to_string();
            record.dirty = true;
            record.path.clone()
        };

        self.event_bus.emit_lossy(AnnotationEvent::CaptionEdited {
            image_id: id.to_string(),
            timestamp: Utc::now(),
        });
        self.persist(id, &image_path, text)
    }

    /// Retry the caption write for every dirty record that is not in flight
    pub fn flush_dirty(&self) -> FlushReport {
        let dirty: Vec<(String, PathBuf, String)> = self
            .read()
            .records
            .values()
            .filter(|r| r.dirty && !r.state.is_in_flight())
            .map(|r| (r.id.clone(), r.path.clone(), r.caption_text.clone()))
            .collect();

        let mut report = FlushReport::default();
        for (id, path, text) in dirty {
            let _gate = self.gate();
            // Text may have changed since the scan above; write the current one
            let current = match self.get(&id) {
                Some(record) if record.dirty && record.caption_text == text => text,
                Some(record) if record.dirty => record.caption_text,
                _ => continue,
            };
            match self.persist(&id, &path, &current) {
                Ok(()) => report.written.push(id),
                Err(_) => report.failed.push(id),
            }
        }

        if !report.written.is_empty() || !report.failed.is_empty() {
            info!(
                written = report.written.len(),
                failed = report.failed.len(),
                "Flushed dirty captions"
            );
        }
        report
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Write `text` to the caption file; caller holds the write gate.
    /// Clears `dirty` if the record still carries exactly this text.
    fn persist(&self, id: &str, image_path: &Path, text: &str) -> CoreResult<()> {
        match self.files.write(image_path, text) {
            Ok(caption_path) => {
                {
                    let mut inner = self.write();
                    if let Some(record) = inner.records.get_mut(id) {
                        if record.caption_text == text {
                            record.dirty = false;
                        }
                    }
                }
                debug!(image_id = %id, path = %caption_path.display(), "Caption written");
                self.event_bus.emit_lossy(AnnotationEvent::CaptionWritten {
                    image_id: id.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(source) => {
                let caption_path = self.files.caption_path(image_path);
                warn!(
                    image_id = %id,
                    path = %caption_path.display(),
                    error = %source,
                    "Caption write failed"
                );
                Err(CoreError::io(caption_path, source))
            }
        }
    }

    fn record_in_state<'a>(
        inner: &'a mut StoreInner,
        id: &str,
        expected: AnnotationState,
        operation: &'static str,
    ) -> CoreResult<&'a mut ImageRecord> {
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| CoreError::RecordNotFound(id.to_string()))?;
        if record.state != expected {
            return Err(CoreError::InvalidTransition {
                id: id.to_string(),
                state: record.state,
                operation,
            });
        }
        Ok(record)
    }

    // Poisoning is recovered: every critical section leaves the index consistent

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CaptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptionStore")
            .field("records", &self.len())
            .field("default_prompt_type", &self.default_prompt_type)
            .field("files", &self.files)
            .finish()
    }
}
