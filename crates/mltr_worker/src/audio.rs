//! Audio worker: speech-to-text, then transcript scoring and multilingual
//! translation run as two concurrent engine calls, joined before the task
//! record is advanced to TO_PACKING.

use crate::stage::{decode_message, finish_message, load_task_expecting, retry_no_delay, MessageOutcome};
use crate::translation::ensure_covers;
use crate::{WorkerContext, WorkerError};
use mltr_broker::{stage_consumer, Stage};
use mltr_db::DbError;
use mltr_types::{translations_into_map, QueuedTask, TaskStatus, TaskType};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consume loop of the audio stage. Messages are processed strictly
/// sequentially; the offset of a message is committed only after its
/// outcome is decided.
pub async fn run_audio_worker(
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let consumer = stage_consumer(&ctx.config.broker, Stage::Audio)?;
    info!("Audio worker started, waiting for incoming audio tasks...");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Audio worker shutting down.");
                return Ok(());
            }
            received = consumer.recv() => {
                match received {
                    Ok(message) => {
                        let payload = message.payload().unwrap_or_default();
                        let outcome = handle_audio_message(&ctx, payload).await;
                        finish_message(&consumer, &message, outcome);
                    }
                    Err(e) => {
                        error!("Consumer receive error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Per-message pipeline: validate -> load -> process -> persist -> publish,
/// collapsed into a commit/drop/retry outcome for the loop.
pub async fn handle_audio_message(ctx: &WorkerContext, payload: &[u8]) -> MessageOutcome {
    let Some(queued) = decode_message(payload) else {
        return MessageOutcome::Dropped;
    };
    if queued.task_type != TaskType::Audio || queued.source_file.is_none() {
        error!(task_id = %queued.task_id, "Queued task is not a well-formed audio task");
        return MessageOutcome::Dropped;
    }

    match load_task_expecting(ctx, queued.task_id, TaskStatus::Pending).await {
        Ok(Some(_)) => {}
        Ok(None) => return MessageOutcome::Dropped,
        Err(e) => return MessageOutcome::Retry(e),
    }

    match retry_no_delay("Audio task processing", || process_audio_task(ctx, &queued)).await {
        Ok(()) => MessageOutcome::Processed,
        Err(WorkerError::StatusConflict(task_id)) => {
            // Cancelled (or otherwise advanced) while the engine calls were
            // in flight; the results are discarded at the status guard.
            warn!(%task_id, "Task left PENDING mid-flight, discarding results");
            MessageOutcome::Dropped
        }
        Err(e) => MessageOutcome::Retry(e),
    }
}

async fn process_audio_task(ctx: &WorkerContext, queued: &QueuedTask) -> Result<(), WorkerError> {
    // Presence is guaranteed by the shape check in handle_audio_message.
    let source_file = queued.source_file.as_deref().unwrap_or_default();
    let audio_path = ctx.config.storage.uploads_dir.join(source_file);

    info!(
        task_id = %queued.task_id,
        source = %audio_path.display(),
        languages = ?queued.target_languages,
        "Audio task started"
    );

    let transcript = ctx.engine.transcribe(&audio_path).await?;
    debug!(task_id = %queued.task_id, chars = transcript.len(), "STT completed");

    // Score and translate as two concurrent in-flight engine calls, joined
    // before the store update. No shared mutable state between them.
    let reference = queued.reference_text.as_deref().unwrap_or_default();
    let (score, items) = tokio::try_join!(
        ctx.engine.score_transcript(reference, &transcript),
        ctx.engine.translate(&transcript, &queued.target_languages),
    )?;
    let translations = translations_into_map(items);
    ensure_covers(&translations, &queued.target_languages)?;

    info!(
        task_id = %queued.task_id,
        total_score = score.total_score,
        acceptable = score.acceptable,
        "Scoring and translation completed"
    );

    // Transition and publish inside one transaction: a failed publish rolls
    // the PENDING -> TO_PACKING write back, so the next delivery sees the
    // same PENDING state.
    let mut tx = ctx.db_pool.begin().await.map_err(DbError::from)?;
    let advanced = mltr_db::mark_to_packing(
        &mut *tx,
        queued.task_id,
        Some(&transcript),
        Some(&score),
        &translations,
    )
    .await?;
    if !advanced {
        return Err(WorkerError::StatusConflict(queued.task_id));
    }
    ctx.publisher
        .publish(&ctx.config.broker.package_topic, queued)
        .await?;
    tx.commit().await.map_err(DbError::from)?;

    debug!(task_id = %queued.task_id, "Task moved to TO_PACKING and handed to packaging");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{payload_for, test_context, RecordingPublisher, StubEngine};
    use assert_matches::assert_matches;
    use mltr_types::{LanguageCode, TranslationTask};
    use std::sync::Arc;
    use uuid::Uuid;

    fn audio_task() -> TranslationTask {
        TranslationTask::new_pending(
            Uuid::new_v4(),
            TaskType::Audio,
            Some("sample.mp3".to_string()),
            Some("Hello".to_string()),
            None,
            vec![LanguageCode::EnUs, LanguageCode::ZhCn],
        )
    }

    #[tokio::test]
    async fn test_successful_processing_advances_and_publishes() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Processed);

        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::ToPacking);
        assert_eq!(stored.stt_result.as_deref(), Some("hello"));
        assert!(stored.stt_score.is_some());
        let translations = stored.translations.unwrap();
        assert_eq!(translations.len(), 2);
        assert!(translations.contains_key(&LanguageCode::EnUs));

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1, "Exactly one hand-off message per task");
        assert_eq!(published[0].0, ctx.config.broker.package_topic);
        assert_eq!(published[0].1.task_id, task.task_id);
    }

    #[tokio::test]
    async fn test_unknown_task_is_dropped() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task(); // never inserted
        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Dropped);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_task_is_dropped_without_side_effects() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();
        mltr_db::cancel_task(&ctx.db_pool, task.task_id).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Dropped);

        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher).await;

        let outcome = handle_audio_message(&ctx, b"{\"broken\":").await;
        assert_matches!(outcome, MessageOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_text_message_on_audio_topic_is_dropped() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher).await;

        let task = TranslationTask::new_pending(
            Uuid::new_v4(),
            TaskType::Text,
            None,
            None,
            Some("hello".to_string()),
            vec![LanguageCode::EnUs],
        );
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_transient_engine_failure_is_retried_to_success() {
        let engine = Arc::new(StubEngine::new("hello").failing_translations(2));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Processed);

        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::ToPacking);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_engine_failure_leaves_task_pending() {
        let engine = Arc::new(StubEngine::new("hello").failing_translations(99));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Retry(_));

        // Rollback discipline: the record still looks untouched
        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.stt_result.is_none());
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_translation_coverage_is_not_persisted() {
        let engine = Arc::new(StubEngine::new("hello").omitting(LanguageCode::ZhCn));
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Retry(_));

        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back_transition() {
        let engine = Arc::new(StubEngine::new("hello"));
        let publisher = Arc::new(RecordingPublisher::new().failing_publishes(99));
        let ctx = test_context(engine, publisher.clone()).await;

        let task = audio_task();
        mltr_db::insert_task(&ctx.db_pool, &task).await.unwrap();

        let outcome = handle_audio_message(&ctx, &payload_for(&task)).await;
        assert_matches!(outcome, MessageOutcome::Retry(_));

        let stored = mltr_db::get_task(&ctx.db_pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending, "Publish failure must revert the transition");
    }
}
