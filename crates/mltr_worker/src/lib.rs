//! Stage workers of the translation pipeline.
//!
//! Three worker roles consume the stage topics and advance tasks through
//! the persistent state machine:
//!
//! - audio: STT + concurrent scoring/translation, PENDING -> TO_PACKING
//! - translation: text-only translation, PENDING -> TO_PACKING
//! - packaging: adaptive batch consumption, package file write,
//!   TO_PACKING -> COMPLETED
//!
//! Every worker owns its broker consumer and shares nothing in-process
//! with the others; the only shared state is the task row in the store.

use mltr_broker::BrokerError;
use mltr_db::DbError;
use mltr_engines::AiEngine;
use mltr_package::PackageError;
use mltr_types::{AppConfig, EngineError, LanguageCode, PublishError, TaskPublisher};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

pub mod audio;
pub mod packaging;
pub mod stage;
pub mod translation;

#[cfg(test)]
pub(crate) mod test_support;

pub use stage::MessageOutcome;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Translation result is missing language {0}")]
    MissingTranslation(LanguageCode),

    #[error("Task {0} changed status mid-flight")]
    StatusConflict(Uuid),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),
}

impl WorkerError {
    /// Whether retrying the same operation can possibly succeed.
    /// A mid-flight status change never heals by repetition; everything
    /// else is treated as transient.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, WorkerError::StatusConflict(_))
    }
}

/// Dependencies a worker needs to process messages.
///
/// Constructed once at startup and handed to the processing loop;
/// released when the worker exits.
pub struct WorkerContext {
    pub config: Arc<AppConfig>,
    pub db_pool: SqlitePool,
    pub engine: Arc<dyn AiEngine>,
    pub publisher: Arc<dyn TaskPublisher>,
}

/// Which worker roles to run in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    All,
    Audio,
    Translation,
    Packaging,
}

impl WorkerRole {
    fn includes_audio(&self) -> bool {
        matches!(self, WorkerRole::All | WorkerRole::Audio)
    }

    fn includes_translation(&self) -> bool {
        matches!(self, WorkerRole::All | WorkerRole::Translation)
    }

    fn includes_packaging(&self) -> bool {
        matches!(self, WorkerRole::All | WorkerRole::Packaging)
    }
}

/// Runs the selected worker roles concurrently until shutdown is signalled
/// or one of them fails fatally, in which case the siblings are cancelled
/// and the error is propagated.
pub async fn run_workers(
    ctx: Arc<WorkerContext>,
    role: WorkerRole,
    shutdown: watch::Receiver<bool>,
) -> Result<(), WorkerError> {
    info!(?role, "Starting workers");
    let mut tasks: JoinSet<Result<(), WorkerError>> = JoinSet::new();

    if role.includes_audio() {
        tasks.spawn(audio::run_audio_worker(ctx.clone(), shutdown.clone()));
    }
    if role.includes_translation() {
        tasks.spawn(translation::run_translation_worker(ctx.clone(), shutdown.clone()));
    }
    if role.includes_packaging() {
        tasks.spawn(packaging::run_packaging_worker(ctx.clone(), shutdown.clone()));
    }

    // The first worker to return decides the outcome; a clean return only
    // happens on shutdown, anything else is a fatal initialisation or loop
    // error that should take the process down with it.
    let result = match tasks.join_next().await {
        Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => {
            error!("Worker exited with error: {}", e);
            Err(e)
        }
        Some(Err(e)) => Err(WorkerError::TaskJoinError(e)),
        None => Ok(()),
    };

    tasks.shutdown().await;
    info!("All workers stopped");
    result
}
