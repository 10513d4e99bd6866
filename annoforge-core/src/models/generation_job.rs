//! Ephemeral generation work units

use crate::models::PromptType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One queued generation request; never persisted
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub batch_id: Uuid,
    pub image_id: String,
    /// Prompt type resolved at submission time
    pub prompt_type: Arc<PromptType>,
}

/// Result of `GenerationScheduler::submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub batch_id: Uuid,
    /// Ids queued for generation, in submission order
    pub accepted: Vec<String>,
    /// Ids already in flight or unknown to the store
    pub skipped: Vec<String>,
}
