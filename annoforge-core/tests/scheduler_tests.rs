//! Generation scheduler integration tests

mod helpers;

use annoforge_common::events::AnnotationEvent;
use annoforge_core::inference::InferenceError;
use annoforge_core::models::{AnnotationState, ErrorKind};
use annoforge_core::services::GenerationScheduler;
use annoforge_core::CoreError;
use helpers::{open_store, ScriptedEngine, TestCorpus};
use std::sync::Arc;
use std::time::Duration;

fn ids(store: &annoforge_core::CaptionStore) -> Vec<String> {
    store.ids()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_image_scenario() {
    let corpus = TestCorpus::new();
    corpus.image("img1.jpg");
    let store = open_store(&corpus, "detailed_description");
    let engine = Arc::new(ScriptedEngine::new().respond("img1.jpg", "  a red car\n"));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine.clone(), 2);

    let receipt = scheduler
        .submit(&["img1.jpg".to_string()], Some("caption"))
        .unwrap();
    assert_eq!(receipt.accepted, vec!["img1.jpg".to_string()]);

    let progress = scheduler.wait(receipt.batch_id).await.unwrap();
    assert_eq!(progress.done, 1);
    assert_eq!(progress.failed, 0);

    let record = store.get("img1.jpg").unwrap();
    assert_eq!(record.state, AnnotationState::Done);
    assert_eq!(record.caption_text, "a red car");
    assert_eq!(record.prompt_type, "caption");
    assert_eq!(corpus.read_caption("img1.jpg").as_deref(), Some("a red car"));
    assert_eq!(engine.seen(), vec![("img1.jpg".to_string(), "<CAPTION>".to_string())]);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_right_after_submit() {
    let corpus = TestCorpus::with_images(10);
    corpus.caption("img05.jpg", "kept caption");
    let store = open_store(&corpus, "caption");
    let before = store.snapshot();

    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(200)));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine, 2);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    assert_eq!(receipt.accepted.len(), 10);
    let cancelled = scheduler.cancel(receipt.batch_id);

    let progress = scheduler.wait(receipt.batch_id).await.unwrap();
    assert!(progress.done + progress.failed <= 2, "{:?}", progress);
    assert_eq!(progress.done + progress.failed + progress.cancelled, 10);
    assert_eq!(progress.cancelled, cancelled.len());

    for id in &cancelled {
        let original = before.iter().find(|r| &r.id == id).unwrap();
        let record = store.get(id).unwrap();
        assert_eq!(record.state, original.state, "{} not restored", id);
        assert_eq!(record.caption_text, original.caption_text);
        assert_eq!(record.prompt_type, original.prompt_type);
    }

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_does_not_abort_batch() {
    let corpus = TestCorpus::with_images(3);
    let store = open_store(&corpus, "caption");
    let engine = Arc::new(
        ScriptedEngine::new().fail("img01.jpg", InferenceError::ModelError("CUDA out of memory".into())),
    );
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine, 2);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    let progress = scheduler.wait(receipt.batch_id).await.unwrap();
    assert_eq!((progress.done, progress.failed), (2, 1));

    let failed = store.get("img01.jpg").unwrap();
    assert_eq!(failed.state, AnnotationState::Failed);
    assert_eq!(failed.caption_text, "");
    let error = failed.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::ModelError);
    assert_eq!(error.message, "CUDA out of memory");

    assert_eq!(store.get("img00.jpg").unwrap().state, AnnotationState::Done);
    assert_eq!(store.get("img02.jpg").unwrap().caption_text, "caption for img02.jpg");

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_limit_bounds_concurrency() {
    let corpus = TestCorpus::with_images(9);
    let store = open_store(&corpus, "caption");
    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(40)));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine.clone(), 3);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    let progress = scheduler.wait(receipt.batch_id).await.unwrap();

    assert_eq!(progress.done, 9);
    assert_eq!(engine.calls(), 9);
    assert!(engine.max_in_flight() <= 3, "max in flight {}", engine.max_in_flight());

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_ids_are_skipped() {
    let corpus = TestCorpus::with_images(2);
    let store = open_store(&corpus, "caption");
    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(100)));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine.clone(), 1);

    let first = scheduler.submit(&ids(&store), None).unwrap();
    let second = scheduler
        .submit(&["img00.jpg".to_string(), "ghost.jpg".to_string()], None)
        .unwrap();

    assert!(second.accepted.is_empty());
    assert_eq!(second.skipped, vec!["img00.jpg".to_string(), "ghost.jpg".to_string()]);
    let progress = scheduler.progress(second.batch_id).unwrap();
    assert!(progress.is_complete());
    assert_eq!(progress.skipped, 2);

    scheduler.wait(first.batch_id).await.unwrap();
    assert_eq!(engine.calls(), 2);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_override_rejected_without_changes() {
    let corpus = TestCorpus::with_images(2);
    let store = open_store(&corpus, "caption");
    let before = store.snapshot();
    let scheduler = GenerationScheduler::start(Arc::clone(&store), Arc::new(ScriptedEngine::new()), 2);

    match scheduler.submit(&ids(&store), Some("limerick")) {
        Err(CoreError::InvalidPromptType(name)) => assert_eq!(name, "limerick"),
        other => panic!("Expected InvalidPromptType, got {:?}", other),
    }
    assert_eq!(store.snapshot(), before);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_holds_queue_until_resume() {
    let corpus = TestCorpus::with_images(3);
    let store = open_store(&corpus, "caption");
    let engine = Arc::new(ScriptedEngine::new());
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine.clone(), 2);

    scheduler.pause();
    assert!(scheduler.is_paused());
    let receipt = scheduler.submit(&ids(&store), None).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.calls(), 0);
    assert_eq!(scheduler.progress(receipt.batch_id).unwrap().queued, 3);
    assert_eq!(store.get("img00.jpg").unwrap().state, AnnotationState::Pending);

    scheduler.resume();
    let progress = tokio::time::timeout(Duration::from_secs(5), scheduler.wait(receipt.batch_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.done, 3);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tag_output_is_limited() {
    let corpus = TestCorpus::new();
    corpus.image("tags.jpg");
    let store = open_store(&corpus, "caption");
    let raw: Vec<String> = (0..40).map(|i| format!("tag{}", i)).collect();
    let engine = Arc::new(ScriptedEngine::new().respond("tags.jpg", &raw.join(",")));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine, 1);

    let receipt = scheduler
        .submit(&["tags.jpg".to_string()], Some("general_tags"))
        .unwrap();
    scheduler.wait(receipt.batch_id).await.unwrap();

    let caption = store.get("tags.jpg").unwrap().caption_text;
    assert_eq!(caption.split(", ").count(), 30);
    assert!(caption.starts_with("tag0, tag1, "));

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_reverts_queued_jobs() {
    let corpus = TestCorpus::with_images(6);
    let store = open_store(&corpus, "caption");
    let engine = Arc::new(ScriptedEngine::new().with_delay(Duration::from_millis(150)));
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine, 1);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    scheduler.shutdown().await;

    let progress = scheduler.progress(receipt.batch_id).unwrap();
    assert!(progress.is_complete(), "{:?}", progress);
    assert!(progress.done <= 1);
    for record in store.snapshot() {
        assert!(!record.state.is_in_flight(), "{} still {}", record.id, record.state);
    }

    assert!(matches!(
        scheduler.submit(&ids(&store), None),
        Err(CoreError::SchedulerStopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_events_are_broadcast() {
    let corpus = TestCorpus::with_images(2);
    let store = open_store(&corpus, "caption");
    let mut events = store.event_bus().subscribe();
    let scheduler = GenerationScheduler::start(Arc::clone(&store), Arc::new(ScriptedEngine::new()), 2);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    scheduler.wait(receipt.batch_id).await.unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(AnnotationEvent::BatchFinished { batch_id, progress, .. }) => {
                    break (batch_id, progress);
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {:?}", e),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(finished.0, receipt.batch_id);
    assert_eq!(finished.1.done, 2);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_updates_only_move_forward() {
    let corpus = TestCorpus::with_images(8);
    let store = open_store(&corpus, "caption");
    let mut events = store.event_bus().subscribe();
    let engine = Arc::new(
        ScriptedEngine::new()
            .with_delay(Duration::from_millis(50))
            .fail("img01.jpg", InferenceError::ModelError("bad weights".into())),
    );
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine, 2);

    let receipt = scheduler.submit(&ids(&store), None).unwrap();
    let mut updates = scheduler.subscribe(receipt.batch_id).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|p| p.done + p.failed >= 2),
    )
    .await
    .unwrap()
    .unwrap();
    scheduler.cancel(receipt.batch_id);
    let last = scheduler.wait(receipt.batch_id).await.unwrap();

    // Popped jobs always finish, so img00 and img01 resolve before the cancel
    assert_eq!(last.failed, 1);
    assert!(last.done >= 1);
    assert!(last.cancelled > 0, "{:?}", last);
    assert_eq!(last.resolved(), 8);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AnnotationEvent::BatchProgressUpdated { batch_id, progress, .. } = event {
            if batch_id == receipt.batch_id {
                seen.push(progress);
            }
        }
    }
    assert!(seen.len() > 2, "only {} updates", seen.len());
    assert_eq!(*seen.last().unwrap(), last);

    for pair in seen.windows(2) {
        let (before, after) = (pair[0], pair[1]);
        assert!(after.done >= before.done, "{:?} -> {:?}", before, after);
        assert!(after.failed >= before.failed, "{:?} -> {:?}", before, after);
        assert!(after.cancelled >= before.cancelled, "{:?} -> {:?}", before, after);
        assert!(
            after.queued + after.in_flight <= before.queued + before.in_flight,
            "{:?} -> {:?}",
            before,
            after
        );
    }

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_paused_reverts_every_job() {
    let corpus = TestCorpus::with_images(4);
    corpus.caption("img02.jpg", "kept caption");
    let store = open_store(&corpus, "caption");
    let before = store.snapshot();
    let engine = Arc::new(ScriptedEngine::new());
    let scheduler = GenerationScheduler::start(Arc::clone(&store), engine.clone(), 2);

    for _ in 0..50 {
        scheduler.pause();
        let receipt = scheduler.submit(&ids(&store), None).unwrap();
        // Give workers the chance to wake on the new jobs while paused
        tokio::task::yield_now().await;
        let cancelled = scheduler.cancel(receipt.batch_id);

        assert_eq!(cancelled.len(), 4);
        let progress = scheduler.progress(receipt.batch_id).unwrap();
        assert!(progress.is_complete(), "{:?}", progress);
        assert_eq!(progress.cancelled, 4);
        assert_eq!(store.snapshot(), before);
        assert_eq!(scheduler.queued_jobs(), 0);
        scheduler.resume();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.calls(), 0);

    scheduler.shutdown().await;
}
