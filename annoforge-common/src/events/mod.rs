//! Event types for the AnnoForge event system
//!
//! The core never calls back into presentation code. It emits
//! [`AnnotationEvent`]s on an [`EventBus`] and the shell renders them.

mod progress_types;

pub use progress_types::BatchProgress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// AnnoForge event types
///
/// Events are broadcast via EventBus and can be serialized for any
/// transport the presentation layer chooses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnnotationEvent {
    /// Corpus folder scanned and reconciled with the store
    CorpusScanned {
        folder: PathBuf,
        added: usize,
        removed: usize,
        /// Records in the store after reconciliation
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Caption text written to its sidecar file
    CaptionWritten {
        image_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Caption text changed by a direct edit (user, find-replace, import)
    CaptionEdited {
        image_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Prompt type assigned to one or more records
    PromptTypeAssigned {
        image_ids: Vec<String>,
        prompt_type: String,
        timestamp: DateTime<Utc>,
    },

    /// Worker dequeued a job and is calling the inference engine
    GenerationStarted {
        batch_id: Uuid,
        image_id: String,
        prompt_type: String,
        timestamp: DateTime<Utc>,
    },

    /// Generated caption committed
    GenerationCompleted {
        batch_id: Uuid,
        image_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Generation failed; the record is in `Failed`
    GenerationFailed {
        batch_id: Uuid,
        image_id: String,
        /// Error kind (Timeout, ModelError, InvalidInput, Io)
        error_kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Queued jobs dropped by cancellation or shutdown
    GenerationCancelled {
        batch_id: Uuid,
        image_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Batch counts changed
    BatchProgressUpdated {
        batch_id: Uuid,
        progress: BatchProgress,
        timestamp: DateTime<Utc>,
    },

    /// No job of the batch is queued or running any more
    BatchFinished {
        batch_id: Uuid,
        progress: BatchProgress,
        timestamp: DateTime<Utc>,
    },

    /// Workers stopped dequeuing
    QueuePaused { timestamp: DateTime<Utc> },

    /// Workers resumed dequeuing
    QueueResumed { timestamp: DateTime<Utc> },

    /// Find-and-replace commit finished
    FindReplaceCommitted {
        applied: usize,
        skipped_stale: usize,
        timestamp: DateTime<Utc>,
    },

    /// Store snapshot exported to CSV
    CsvExported {
        path: PathBuf,
        rows: usize,
        timestamp: DateTime<Utc>,
    },

    /// CSV imported into the store
    CsvImported {
        path: PathBuf,
        updated: usize,
        not_found: usize,
        timestamp: DateTime<Utc>,
    },
}

impl AnnotationEvent {
    /// Event name as serialized in the `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            AnnotationEvent::CorpusScanned { .. } => "CorpusScanned",
            AnnotationEvent::CaptionWritten { .. } => "CaptionWritten",
            AnnotationEvent::CaptionEdited { .. } => "CaptionEdited",
            AnnotationEvent::PromptTypeAssigned { .. } => "PromptTypeAssigned",
            AnnotationEvent::GenerationStarted { .. } => "GenerationStarted",
            AnnotationEvent::GenerationCompleted { .. } => "GenerationCompleted",
            AnnotationEvent::GenerationFailed { .. } => "GenerationFailed",
            AnnotationEvent::GenerationCancelled { .. } => "GenerationCancelled",
            AnnotationEvent::BatchProgressUpdated { .. } => "BatchProgressUpdated",
            AnnotationEvent::BatchFinished { .. } => "BatchFinished",
            AnnotationEvent::QueuePaused { .. } => "QueuePaused",
            AnnotationEvent::QueueResumed { .. } => "QueueResumed",
            AnnotationEvent::FindReplaceCommitted { .. } => "FindReplaceCommitted",
            AnnotationEvent::CsvExported { .. } => "CsvExported",
            AnnotationEvent::CsvImported { .. } => "CsvImported",
        }
    }
}

/// Broadcast channel for [`AnnotationEvent`]s
///
/// Cloning is cheap; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AnnotationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    ///
    /// # Examples
    ///
    /// ```
    /// use annoforge_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AnnotationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: AnnotationEvent,
    ) -> Result<usize, broadcast::error::SendError<AnnotationEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AnnotationEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
