//! Batch progress type definitions
//!
//! Supporting types for generation batch progress reporting.

use serde::{Deserialize, Serialize};

/// Per-batch job counts
///
/// Every accepted job is in exactly one of `queued`, `in_flight`, `done`,
/// `failed` or `cancelled`; `skipped` counts ids rejected at submission.
/// Counts only ever move toward completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Ids named in the submission
    pub total: usize,
    /// Accepted, waiting for a worker
    pub queued: usize,
    /// Dequeued by a worker, inference running
    pub in_flight: usize,
    /// Caption generated and written
    pub done: usize,
    /// Inference or write failed
    pub failed: usize,
    /// Rejected at submission (already in flight or unknown id)
    pub skipped: usize,
    /// Dropped from the queue by cancellation
    pub cancelled: usize,
}

impl BatchProgress {
    /// True once no job of the batch is queued or running
    pub fn is_complete(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }

    /// Jobs that reached a terminal outcome (done, failed, cancelled)
    pub fn resolved(&self) -> usize {
        self.done + self.failed + self.cancelled
    }

    /// Percentage of accepted jobs resolved (100.0 for an empty batch)
    pub fn percentage(&self) -> f64 {
        let accepted = self.total.saturating_sub(self.skipped);
        if accepted == 0 {
            100.0
        } else {
            (self.resolved() as f64 / accepted as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batch_is_complete() {
        let progress = BatchProgress {
            total: 3,
            skipped: 3,
            ..Default::default()
        };
        assert!(progress.is_complete());
        assert_eq!(progress.percentage(), 100.0);
    }

    #[test]
    fn test_percentage_ignores_skipped() {
        let progress = BatchProgress {
            total: 5,
            queued: 2,
            done: 1,
            failed: 1,
            skipped: 1,
            ..Default::default()
        };
        assert!(!progress.is_complete());
        assert_eq!(progress.resolved(), 2);
        assert_eq!(progress.percentage(), 50.0);
    }
}
