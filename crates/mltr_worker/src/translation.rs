//! Translation worker: multilingual translation of plain text tasks.
//! Same skeleton as the audio worker, minus the STT and scoring calls.

use crate::stage::{decode_message, finish_message, load_task_expecting, retry_no_delay, MessageOutcome};
use crate::{WorkerContext, WorkerError};
use mltr_broker::{stage_consumer, Stage};
use mltr_db::DbError;
use mltr_types::{translations_into_map, LanguageCode, QueuedTask, TaskStatus, TaskType, TranslationMap};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Every requested language must be covered before a task may leave
/// PENDING; a partial engine response is treated as a transient failure.
pub(crate) fn ensure_covers(
    translations: &TranslationMap,
    requested: &[LanguageCode],
) -> Result<(), WorkerError> {
    for lang in requested {
        if !translations.contains_key(lang) {
            return Err(WorkerError::MissingTranslation(*lang));
        }
    }
    Ok(())
}

pub async fn run_translation_worker(
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let consumer = stage_consumer(&ctx.config.broker, Stage::Translation)?;
    info!("Translation worker started, waiting for incoming text tasks...");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Translation worker shutting down.");
                return Ok(());
            }
            received = consumer.recv() => {
                match received {
                    Ok(message) => {
                        let payload = message.payload().unwrap_or_default();
                        let outcome = handle_translation_message(&ctx, payload).await;
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

pub async fn handle_translation_message(ctx: &WorkerContext, payload: &[u8]) -> MessageOutcome {
    let Some(queued) = decode_message(payload) else {
        return MessageOutcome::Dropped;
    };
    if queued.task_type != TaskType::Text || queued.text.is_none() {
        error!(task_id = %queued.task_id, "Queued task is not a well-formed text task");
        return MessageOutcome::Dropped;
    }

    match load_task_expecting(ctx, queued.task_id, TaskStatus::Pending).await {
        Ok(Some(_)) => {}
        Ok(None) => return MessageOutcome::Dropped,
        Err(e) => return MessageOutcome::Retry(e),
    }

    match retry_no_delay("Translation task processing", || process_translation_task(ctx, &queued)).await
    {
        Ok(()) => MessageOutcome::Processed,
        Err(WorkerError::StatusConflict(task_id)) => {
            warn!(%task_id, "Task left PENDING mid-flight, discarding results");
            MessageOutcome::Dropped
        }
        Err(e) => MessageOutcome::Retry(e),
    }
}

async fn process_translation_task(ctx: &WorkerContext, queued: &QueuedTask) -> Result<(), WorkerError> {
    // Presence is guaranteed by the shape check in handle_translation_message.
    let text = queued.text.as_deref().unwrap_or_default();

    info!(
        task_id = %queued.task_id,
        languages = ?queued.target_languages,
        "Translation task started"
    );

    let items = ctx.engine.translate(text, &queued.target_languages).await?;
    let translations = translations_into_map(items);
    ensure_covers(&translations, &queued.target_languages)?;

    debug!(task_id = %queued.task_id, count = translations.len(), "Translation completed");

    let mut tx = ctx.db_pool.begin().await.map_err(DbError::from)?;
    let advanced =
        mltr_db::mark_to_packing(&mut *tx, queued.task_id, None, None, &translations).await?;
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
