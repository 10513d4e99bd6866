//! Shared FIFO of generation jobs
//!
//! Workers block in [`JobQueue::pop_unless`]; cancellation removes a batch's jobs
//! under the same lock, so a job is either popped by exactly one worker or
//! drained, never both.

use crate::models::GenerationJob;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    jobs: Mutex<VecDeque<GenerationJob>>,
    notify: Notify,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_many(&self, jobs: Vec<GenerationJob>) {
        let count = jobs.len();
        self.lock().extend(jobs);
        for _ in 0..count {
            self.notify.notify_one();
        }
    }

    /// Wait for the next job
    ///
    /// `held` is checked under the queue lock before every dequeue; once it
    /// returns `true` the call yields `None` and the queue is left intact.
    pub(crate) async fn pop_unless<F>(&self, held: F) -> Option<GenerationJob>
    where
        F: Fn() -> bool,
    {
        loop {
            let notified = self.notify.notified();
            let (next, remaining) = {
                let mut jobs = self.lock();
                if held() {
                    return None;
                }
                let next = jobs.pop_front();
                (next, jobs.len())
            };
            if let Some(job) = next {
                // Notify keeps a single permit; pass the wakeup on
                if remaining > 0 {
                    self.notify.notify_one();
                }
                return Some(job);
            }
            notified.await;
        }
    }

    /// Remove every queued job of one batch, preserving order
    pub(crate) fn drain_batch(&self, batch_id: Uuid) -> Vec<GenerationJob> {
        let mut jobs = self.lock();
        let (drained, kept): (VecDeque<_>, VecDeque<_>) =
            jobs.drain(..).partition(|job| job.batch_id == batch_id);
        *jobs = kept;
        drained.into()
    }

    pub(crate) fn drain_all(&self) -> Vec<GenerationJob> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<GenerationJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
