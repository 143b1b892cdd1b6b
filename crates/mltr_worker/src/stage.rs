//! Shared plumbing for the stage processing loops: message decoding, the
//! task status guard, the bounded retry policy and offset acknowledgement.

use crate::{WorkerContext, WorkerError};
use mltr_broker::commit_message;
use mltr_types::{QueuedTask, TaskStatus, TranslationTask};
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use std::future::Future;
use tracing::{error, warn};
use uuid::Uuid;

/// Maximum processing attempts per message, with no inter-attempt delay.
pub const MAX_ATTEMPTS: u32 = 3;

/// What the consume loop should do with a message after processing.
#[derive(Debug)]
pub enum MessageOutcome {
    /// State advanced and the follow-up message (if any) was published;
    /// commit the offset.
    Processed,
    /// Message undeliverable: malformed, unknown task, or task not in the
    /// expected status. Commit the offset without side effects.
    Dropped,
    /// Transient failure after all attempts; leave the offset uncommitted
    /// so the broker redelivers the message.
    Retry(WorkerError),
}

/// Decodes a `QueuedTask` payload; malformed messages are logged and
/// reported as undecodable.
pub(crate) fn decode_message(payload: &[u8]) -> Option<QueuedTask> {
    match serde_json::from_slice(payload) {
        Ok(queued) => Some(queued),
        Err(e) => {
            error!("Message validation failed: {}", e);
            None
        }
    }
}

/// Reloads the task record and checks it is in the status this stage
/// expects. Returns `Ok(None)` (drop the message) when the task is missing
/// or out of phase; that is what makes redelivered and stale messages
/// harmless.
pub(crate) async fn load_task_expecting(
    ctx: &WorkerContext,
    task_id: Uuid,
    expected: TaskStatus,
) -> Result<Option<TranslationTask>, WorkerError> {
    let task = mltr_db::get_task(&ctx.db_pool, task_id).await?;
    let Some(task) = task else {
        error!(%task_id, "Task not found in database");
        return Ok(None);
    };
    if task.status != expected {
        warn!(
            %task_id,
            status = %task.status,
            expected = %expected,
            "Task in unexpected status, dropping message"
        );
        return Ok(None);
    }
    Ok(Some(task))
}

/// Runs `operation` up to [`MAX_ATTEMPTS`] times with no delay between
/// attempts. Non-retriable errors short-circuit.
pub(crate) async fn retry_no_delay<T, F, Fut>(label: &str, mut operation: F) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_ATTEMPTS && e.is_retriable() => {
                warn!(attempt, "{} failed, retrying: {}", label, e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Acknowledges or withholds the offset according to the outcome.
pub(crate) fn finish_message(
    consumer: &StreamConsumer,
    message: &BorrowedMessage<'_>,
    outcome: MessageOutcome,
) {
    match outcome {
        MessageOutcome::Processed | MessageOutcome::Dropped => {
            if let Err(e) = commit_message(consumer, message) {
                error!(offset = message.offset(), "Failed to commit offset: {}", e);
            }
        }
        MessageOutcome::Retry(err) => {
            error!(
                offset = message.offset(),
                "Processing failed after {} attempts, leaving offset uncommitted for redelivery: {}",
                MAX_ATTEMPTS,
                err
            );
        }
    }
}
