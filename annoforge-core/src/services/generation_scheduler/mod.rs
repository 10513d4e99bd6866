//! Generation Scheduler
//!
//! Runs caption generation for batches of images with at most `W`
//! concurrent inference calls. Accepted images become jobs on a shared
//! queue consumed by exactly `W` worker tasks; excess work waits.
//!
//! # Job lifecycle
//!
//! ```text
//! submit ──► begin_generation (PENDING) ──► queue ──► worker pops
//!                   │                          │          │
//!                   └─ skipped            cancel│     start_generation (GENERATING)
//!                                              ▼          │
//!                                     cancel_generation   infer (blocking pool)
//!                                     (prior state)       │
//!                                                 complete / fail_generation
//! ```
//!
//! A failed job never aborts its batch and is never retried automatically.

mod job_queue;

use crate::error::{CoreError, CoreResult};
use crate::inference::InferenceEngine;
use crate::models::{ErrorKind, GenerationJob, PromptType, RecordError, SubmitReceipt};
use crate::services::prompt_registry::PromptRegistry;
use crate::store::CaptionStore;
use annoforge_common::events::{AnnotationEvent, BatchProgress, EventBus};
use chrono::Utc;
use job_queue::JobQueue;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal result of one job, for progress accounting
enum JobOutcome {
    Done,
    Failed(RecordError),
    /// Record vanished or changed state under the job
    Dropped,
}

struct Shared {
    store: Arc<CaptionStore>,
    registry: Arc<PromptRegistry>,
    engine: Arc<dyn InferenceEngine>,
    event_bus: EventBus,
    queue: JobQueue,
    batches: Mutex<HashMap<Uuid, Arc<watch::Sender<BatchProgress>>>>,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Bounded worker pool for caption generation
pub struct GenerationScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_limit: usize,
}

impl GenerationScheduler {
    /// Spawn `worker_limit` workers (at least one) on the current tokio runtime
    pub fn start(store: Arc<CaptionStore>, engine: Arc<dyn InferenceEngine>, worker_limit: usize) -> Self {
        let worker_limit = worker_limit.max(1);
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Arc::clone(store.registry()),
            event_bus: store.event_bus().clone(),
            store,
            engine,
            queue: JobQueue::new(),
            batches: Mutex::new(HashMap::new()),
            paused,
            shutdown: CancellationToken::new(),
        });

        let workers = (0..worker_limit)
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&shared), worker_id)))
            .collect();

        info!(workers = worker_limit, "Generation scheduler started");

        Self {
            shared,
            workers: Mutex::new(workers),
            worker_limit,
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Queue generation for `image_ids`
    ///
    /// The effective prompt type is the override, else the record's own,
    /// else the store default. An override that does not resolve fails the
    /// whole call before any record changes. Ids already in flight or
    /// without a record are reported as skipped.
    pub fn submit(&self, image_ids: &[String], prompt_type_override: Option<&str>) -> CoreResult<SubmitReceipt> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(CoreError::SchedulerStopped);
        }

        let override_prompt = prompt_type_override
            .map(|name| shared.registry.resolve(name))
            .transpose()?;

        let batch_id = Uuid::new_v4();
        let mut accepted = Vec::new();
        let mut skipped = Vec::new();
        let mut jobs = Vec::new();

        for id in image_ids {
            let record = match shared.store.get(id) {
                Some(record) => record,
                None => {
                    debug!(image_id = %id, "Submitted id has no record");
                    skipped.push(id.clone());
                    continue;
                }
            };
            let prompt = match &override_prompt {
                Some(prompt) => Arc::clone(prompt),
                None => shared.effective_prompt_type(&record.prompt_type)?,
            };

            match shared.store.begin_generation(id, &prompt.id) {
                Ok(true) => {
                    accepted.push(id.clone());
                    jobs.push(GenerationJob {
                        batch_id,
                        image_id: id.clone(),
                        prompt_type: prompt,
                    });
                }
                Ok(false) | Err(CoreError::RecordNotFound(_)) => skipped.push(id.clone()),
                Err(e) => return Err(e),
            }
        }

        let progress = BatchProgress {
            total: image_ids.len(),
            queued: jobs.len(),
            skipped: skipped.len(),
            ..Default::default()
        };
        let (tx, _) = watch::channel(progress);
        shared.lock_batches().insert(batch_id, Arc::new(tx));

        info!(
            batch_id = %batch_id,
            accepted = accepted.len(),
            skipped = skipped.len(),
            "Generation batch submitted"
        );

        shared.emit_progress(batch_id, progress);
        if progress.is_complete() {
            shared.emit_finished(batch_id, progress);
        }
        shared.queue.push_many(jobs);

        // Shutdown raced with submission; nothing will consume these jobs
        if shared.shutdown.is_cancelled() {
            shared.cancel_batch(batch_id);
        }

        Ok(SubmitReceipt {
            batch_id,
            accepted,
            skipped,
        })
    }

    /// Drop the batch's queued jobs, reverting their records
    ///
    /// Jobs already running finish and commit. Returns the reverted ids.
    pub fn cancel(&self, batch_id: Uuid) -> Vec<String> {
        self.shared.cancel_batch(batch_id)
    }

    /// Latest counts for a batch
    pub fn progress(&self, batch_id: Uuid) -> Option<BatchProgress> {
        self.shared
            .batch(batch_id)
            .map(|tx| *tx.borrow())
    }

    /// Watch a batch's counts
    pub fn subscribe(&self, batch_id: Uuid) -> Option<watch::Receiver<BatchProgress>> {
        self.shared.batch(batch_id).map(|tx| tx.subscribe())
    }

    /// Wait until no job of the batch is queued or running
    pub async fn wait(&self, batch_id: Uuid) -> Option<BatchProgress> {
        let mut rx = self.subscribe(batch_id)?;
        let outcome = rx.wait_for(|p| p.is_complete()).await.map(|p| *p);
        Some(match outcome {
            Ok(progress) => progress,
            Err(_) => *rx.borrow(),
        })
    }

    /// Stop dequeuing; running jobs finish
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("Generation queue paused");
            self.shared.event_bus.emit_lossy(AnnotationEvent::QueuePaused {
                timestamp: Utc::now(),
            });
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            info!("Generation queue resumed");
            self.shared.event_bus.emit_lossy(AnnotationEvent::QueueResumed {
                timestamp: Utc::now(),
            });
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Jobs waiting for a worker across all batches
    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop all workers after their current job and cancel everything queued
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let mut by_batch: HashMap<Uuid, Vec<GenerationJob>> = HashMap::new();
        for job in self.shared.queue.drain_all() {
            by_batch.entry(job.batch_id).or_default().push(job);
        }
        for (batch_id, jobs) in by_batch {
            self.shared.revert_jobs(batch_id, jobs);
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Generation worker terminated abnormally");
            }
        }
        info!("Generation scheduler stopped");
    }
}

impl Drop for GenerationScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn effective_prompt_type(&self, assigned: &str) -> CoreResult<Arc<PromptType>> {
        match self.registry.resolve(assigned) {
            Ok(prompt) => Ok(prompt),
            Err(_) => {
                warn!(prompt_type = %assigned, "Record prompt type unknown; using default");
                self.registry.resolve(self.store.default_prompt_type())
            }
        }
    }

    fn lock_batches(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<watch::Sender<BatchProgress>>>> {
        self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn batch(&self, batch_id: Uuid) -> Option<Arc<watch::Sender<BatchProgress>>> {
        self.lock_batches().get(&batch_id).cloned()
    }

    fn cancel_batch(&self, batch_id: Uuid) -> Vec<String> {
        let jobs = self.queue.drain_batch(batch_id);
        self.revert_jobs(batch_id, jobs)
    }

    fn revert_jobs(&self, batch_id: Uuid, jobs: Vec<GenerationJob>) -> Vec<String> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let mut reverted = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Err(e) = self.store.cancel_generation(&job.image_id) {
                warn!(image_id = %job.image_id, error = %e, "Could not revert cancelled job");
            }
            reverted.push(job.image_id);
        }

        let count = reverted.len();
        info!(batch_id = %batch_id, cancelled = count, "Queued jobs cancelled");
        self.event_bus.emit_lossy(AnnotationEvent::GenerationCancelled {
            batch_id,
            image_ids: reverted.clone(),
            timestamp: Utc::now(),
        });
        self.update_progress(batch_id, |p| {
            p.queued = p.queued.saturating_sub(count);
            p.cancelled += count;
        });
        reverted
    }

    fn update_progress(&self, batch_id: Uuid, change: impl FnOnce(&mut BatchProgress)) {
        let Some(tx) = self.batch(batch_id) else {
            return;
        };
        let mut finished = None;
        tx.send_modify(|p| {
            let was_complete = p.is_complete();
            change(p);
            // Emitted under the watch lock so bus subscribers see updates in order
            self.emit_progress(batch_id, *p);
            if !was_complete && p.is_complete() {
                finished = Some(*p);
            }
        });

        if let Some(progress) = finished {
            self.emit_finished(batch_id, progress);
        }
    }

    fn emit_progress(&self, batch_id: Uuid, progress: BatchProgress) {
        self.event_bus.emit_lossy(AnnotationEvent::BatchProgressUpdated {
            batch_id,
            progress,
            timestamp: Utc::now(),
        });
    }

    fn emit_finished(&self, batch_id: Uuid, progress: BatchProgress) {
        info!(
            batch_id = %batch_id,
            done = progress.done,
            failed = progress.failed,
            cancelled = progress.cancelled,
            skipped = progress.skipped,
            "Generation batch finished"
        );
        self.event_bus.emit_lossy(AnnotationEvent::BatchFinished {
            batch_id,
            progress,
            timestamp: Utc::now(),
        });
    }

    async fn run_job(self: &Arc<Self>, job: GenerationJob) {
        let batch_id = job.batch_id;

        let record = match self.store.start_generation(&job.image_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(batch_id = %batch_id, image_id = %job.image_id, error = %e, "Job dropped");
                self.finish_job(batch_id, JobOutcome::Dropped, true);
                return;
            }
        };

        self.update_progress(batch_id, |p| {
            p.queued = p.queued.saturating_sub(1);
            p.in_flight += 1;
        });
        self.event_bus.emit_lossy(AnnotationEvent::GenerationStarted {
            batch_id,
            image_id: job.image_id.clone(),
            prompt_type: job.prompt_type.id.clone(),
            timestamp: Utc::now(),
        });

        let image_id = job.image_id.clone();
        let task = {
            let shared = Arc::clone(self);
            let prompt = Arc::clone(&job.prompt_type);
            let image_id = image_id.clone();
            tokio::task::spawn_blocking(move || shared.infer_and_commit(&image_id, &record.path, &prompt))
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(batch_id = %batch_id, image_id = %image_id, error = %e, "Inference task panicked");
                let error = RecordError::new(ErrorKind::ModelError, format!("Inference task panicked: {}", e));
                self.record_failure(&image_id, error.clone());
                JobOutcome::Failed(error)
            }
        };

        match &outcome {
            JobOutcome::Done => {
                self.event_bus.emit_lossy(AnnotationEvent::GenerationCompleted {
                    batch_id,
                    image_id: image_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            JobOutcome::Failed(error) => {
                self.event_bus.emit_lossy(AnnotationEvent::GenerationFailed {
                    batch_id,
                    image_id: image_id.clone(),
                    error_kind: error.kind.to_string(),
                    message: error.message.clone(),
                    timestamp: Utc::now(),
                });
            }
            JobOutcome::Dropped => {}
        }

        self.finish_job(batch_id, outcome, false);
    }

    /// Runs on the blocking pool: inference, then the store commit
    fn infer_and_commit(&self, image_id: &str, image_path: &Path, prompt: &PromptType) -> JobOutcome {
        let text = match self.engine.infer(image_path, prompt) {
            Ok(raw) => prompt.normalize_output(&raw),
            Err(e) => {
                let error = e.to_record_error();
                self.record_failure(image_id, error.clone());
                return JobOutcome::Failed(error);
            }
        };

        if text.is_empty() {
            let error = RecordError::new(ErrorKind::ModelError, "Model returned empty output");
            self.record_failure(image_id, error.clone());
            return JobOutcome::Failed(error);
        }

        match self.store.complete_generation(image_id, &text) {
            Ok(()) => {
                debug!(image_id = %image_id, "Caption generated");
                JobOutcome::Done
            }
            // Record already moved to Failed by the store
            Err(CoreError::Io { path, source }) => JobOutcome::Failed(RecordError::new(
                ErrorKind::Io,
                format!("{}: {}", path.display(), source),
            )),
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "Generated caption not committed");
                JobOutcome::Dropped
            }
        }
    }

    fn record_failure(&self, image_id: &str, error: RecordError) {
        if let Err(e) = self.store.fail_generation(image_id, error) {
            warn!(image_id = %image_id, error = %e, "Could not record failure");
        }
    }

    fn finish_job(&self, batch_id: Uuid, outcome: JobOutcome, was_queued: bool) {
        self.update_progress(batch_id, |p| {
            if was_queued {
                p.queued = p.queued.saturating_sub(1);
            } else {
                p.in_flight = p.in_flight.saturating_sub(1);
            }
            match outcome {
                JobOutcome::Done => p.done += 1,
                JobOutcome::Failed(_) => p.failed += 1,
                JobOutcome::Dropped => p.cancelled += 1,
            }
        });
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Generation worker started");
    let mut paused = shared.paused.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            resumed = wait_until_resumed(&mut paused) => {
                if !resumed {
                    break;
                }
            }
        }

        let job = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            job = shared.queue.pop_unless(|| *paused.borrow()) => job,
        };

        // Paused while waiting; the job stays queued where cancel can drain it
        let Some(job) = job else {
            continue;
        };

        shared.run_job(job).await;
    }

    debug!(worker_id, "Generation worker stopped");
}

async fn wait_until_resumed(paused: &mut watch::Receiver<bool>) -> bool {
    paused.wait_for(|is_paused| !*is_paused).await.is_ok()
}
