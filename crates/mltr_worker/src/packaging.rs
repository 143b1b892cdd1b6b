//! Packaging worker: consumes the package topic in adaptive batches,
//! writes one binary package file per task and completes the task record.
//!
//! Unlike the other stages, messages of a partition batch are processed
//! concurrently. The committed offset per partition is the largest offset
//! below which every message succeeded, plus one. A failure at a low
//! offset holds the commit position back so the broker redelivers it.

use crate::stage::{decode_message, load_task_expecting, retry_no_delay, MessageOutcome};
use crate::{WorkerContext, WorkerError};
use futures_util::future::join_all;
use mltr_broker::{commit_partition, stage_consumer, Stage};
use mltr_package::{TaskData, TextSource};
use mltr_types::{TaskStatus, TranslationTask};
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Batch size under normal memory pressure.
pub const BASE_BATCH_SIZE: usize = 50;
/// How often the memory sampler re-evaluates the batch size.
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Window for accumulating one batch from the consumer.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between polls when the topic is idle.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Batch size for the given system memory utilisation (percent used).
pub fn batch_size_for_memory(used_percent: f32) -> usize {
    if used_percent >= 90.0 {
        (BASE_BATCH_SIZE / 4).max(10)
    } else if used_percent >= 80.0 {
        BASE_BATCH_SIZE / 2
    } else if used_percent >= 70.0 {
        BASE_BATCH_SIZE
    } else {
        (BASE_BATCH_SIZE * 2).min(200)
    }
}

/// Constant-time memory sample: one `/proc` refresh, no per-process scan.
fn sample_memory_percent(sys: &mut System) -> f32 {
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    (sys.used_memory() as f32 / total as f32) * 100.0
}

/// Next commit position for one partition, given `(offset, succeeded)`
/// results: one past the largest offset `o` such that every message with
/// offset <= `o` succeeded. `None` when the lowest offset failed or the
/// batch was empty; nothing may be committed then, or the failed message
/// would be lost.
pub fn commit_position(results: &[(i64, bool)]) -> Option<i64> {
    let mut sorted: Vec<(i64, bool)> = results.to_vec();
    sorted.sort_by_key(|(offset, _)| *offset);

    let mut position = None;
    for (offset, succeeded) in sorted {
        if !succeeded {
            break;
        }
        position = Some(offset + 1);
    }
    position
}

/// Builds the package record for a task: every translation under the TEXT
/// source, and (when a transcript exists) the transcript under the AUDIO
/// source for each requested language.
pub fn build_package_data(task: &TranslationTask) -> TaskData {
    let mut data = TaskData::new(task.task_id.to_string());

    if let Some(translations) = &task.translations {
        for (lang, text) in translations {
            data.add_translation(TextSource::Text, *lang, text.clone());
        }
    }

    if let Some(stt_result) = &task.stt_result {
        for lang in &task.target_languages {
            data.add_translation(TextSource::Audio, *lang, stt_result.clone());
        }
    }

    data
}

fn package_path(ctx: &WorkerContext, task: &TranslationTask) -> PathBuf {
    ctx.config
        .storage
        .package_dir
        .join(format!("{}.bin", task.task_id))
}

async fn process_package_task(ctx: &WorkerContext, task: &TranslationTask) -> Result<(), WorkerError> {
    info!(
        task_id = %task.task_id,
        task_type = %task.task_type,
        languages = ?task.target_languages,
        "Packaging task started"
    );

    let path = package_path(ctx, task);
    let data = build_package_data(task);
    let write_path = path.clone();
    // The codec does blocking file I/O; keep it off the async runtime.
    tokio::task::spawn_blocking(move || mltr_package::create(&write_path, &[data])).await??;

    let packed_file = path.to_string_lossy().into_owned();
    let advanced = mltr_db::mark_completed(&ctx.db_pool, task.task_id, &packed_file).await?;
    if !advanced {
        return Err(WorkerError::StatusConflict(task.task_id));
    }

    info!(task_id = %task.task_id, packed_file = %packed_file, "Task completed");
    Ok(())
}

/// Per-message pipeline of the packaging stage.
pub async fn handle_package_message(ctx: &WorkerContext, payload: &[u8]) -> MessageOutcome {
    let Some(queued) = decode_message(payload) else {
        return MessageOutcome::Dropped;
    };

    let task = match load_task_expecting(ctx, queued.task_id, TaskStatus::ToPacking).await {
        Ok(Some(task)) => task,
        Ok(None) => return MessageOutcome::Dropped,
        Err(e) => return MessageOutcome::Retry(e),
    };

    match retry_no_delay("Packaging", || process_package_task(ctx, &task)).await {
        Ok(()) => MessageOutcome::Processed,
        Err(WorkerError::StatusConflict(task_id)) => {
            warn!(%task_id, "Task left TO_PACKING mid-flight, dropping message");
            MessageOutcome::Dropped
        }
        Err(e) => MessageOutcome::Retry(e),
    }
}

/// Accumulates up to `max_messages` messages within one poll window.
async fn poll_batch(consumer: &StreamConsumer, max_messages: usize) -> Vec<OwnedMessage> {
    let mut batch = Vec::new();
    let deadline = tokio::time::Instant::now() + POLL_TIMEOUT;

    while batch.len() < max_messages {
        match tokio::time::timeout_at(deadline, consumer.recv()).await {
            Ok(Ok(message)) => batch.push(message.detach()),
            Ok(Err(e)) => {
                error!("Consumer receive error: {}", e);
                break;
            }
            Err(_) => break, // poll window elapsed
        }
    }
    batch
}

fn group_by_partition(batch: Vec<OwnedMessage>) -> BTreeMap<i32, Vec<OwnedMessage>> {
    let mut partitions: BTreeMap<i32, Vec<OwnedMessage>> = BTreeMap::new();
    for message in batch {
        partitions.entry(message.partition()).or_default().push(message);
    }
    partitions
}

/// Processes every message of one partition concurrently and returns the
/// `(offset, succeeded)` pairs the commit rule needs. A dropped message
/// counts as succeeded: its offset is safe to pass.
async fn process_partition(ctx: &WorkerContext, messages: Vec<OwnedMessage>) -> Vec<(i64, bool)> {
    let futures = messages.into_iter().map(|message| async move {
        let offset = message.offset();
        let payload = message.payload().unwrap_or_default();
        let outcome = handle_package_message(ctx, payload).await;
        (offset, !matches!(outcome, MessageOutcome::Retry(_)))
    });
    join_all(futures).await
}

/// Consume loop of the packaging stage.
pub async fn run_packaging_worker(
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    let consumer = stage_consumer(&ctx.config.broker, Stage::Packaging)?;
    let topic = ctx.config.broker.package_topic.clone();

    let mut sys = System::new();
    let mut batch_size = batch_size_for_memory(sample_memory_percent(&mut sys));
    let mut last_memory_check = Instant::now();
    info!(batch_size, "Packaging worker started, waiting for incoming package tasks...");

    loop {
        if last_memory_check.elapsed() >= MEMORY_CHECK_INTERVAL {
            let new_size = batch_size_for_memory(sample_memory_percent(&mut sys));
            if new_size != batch_size {
                info!(
                    "Adjusting batch size from {} to {} based on memory usage",
                    batch_size, new_size
                );
                batch_size = new_size;
            }
            last_memory_check = Instant::now();
        }

        let batch = tokio::select! {
            _ = shutdown.changed() => {
                info!("Packaging worker shutting down.");
                return Ok(());
            }
            batch = poll_batch(&consumer, batch_size) => batch,
        };

        if batch.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        for (partition, messages) in group_by_partition(batch) {
            let results = process_partition(&ctx, messages).await;
            match commit_position(&results) {
                Some(next_offset) => {
                    if let Err(e) = commit_partition(&consumer, &topic, partition, next_offset) {
                        error!(partition, "Failed to commit partition offsets: {}", e);
                    } else {
                        debug!(partition, next_offset, "Partition batch committed");
                    }
                }
                None => {
                    warn!(partition, "No committable prefix in partition batch, awaiting redelivery");
                }
            }
        }
    }
}
