//! Shared test doubles for the worker stages: a scriptable engine stub,
//! a recording publisher and an in-memory worker context.

use crate::WorkerContext;
use async_trait::async_trait;
use mltr_engines::AiEngine;
use mltr_types::{
    AppConfig, EngineError, LanguageCode, PublishError, QueuedTask, SttScore, TaskPublisher,
    TranslationItem, TranslationTask,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Engine stub returning canned results. `failing_translations(n)` makes
/// the first `n` translate calls fail, `omitting(lang)` drops a language
/// from every translation result.
pub(crate) struct StubEngine {
    transcript: String,
    translate_failures: AtomicU32,
    omit_language: Option<LanguageCode>,
}

impl StubEngine {
    pub(crate) fn new(transcript: &str) -> Self {
        StubEngine {
            transcript: transcript.to_string(),
            translate_failures: AtomicU32::new(0),
            omit_language: None,
        }
    }

    pub(crate) fn failing_translations(self, failures: u32) -> Self {
        self.translate_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub(crate) fn omitting(mut self, language: LanguageCode) -> Self {
        self.omit_language = Some(language);
        self
    }
}

#[async_trait]
impl AiEngine for StubEngine {
    async fn transcribe(&self, _audio_path: &Path) -> Result<String, EngineError> {
        Ok(self.transcript.clone())
    }

    async fn score_transcript(
        &self,
        _reference: &str,
        _transcript: &str,
    ) -> Result<SttScore, EngineError> {
        Ok(SttScore {
            semantic_accuracy: 0.95,
            completeness: 0.9,
            grammar: 1.0,
            total_score: 0.95,
            acceptable: true,
            comments: "stub score".to_string(),
        })
    }

    async fn translate(
        &self,
        text: &str,
        target_languages: &[LanguageCode],
    ) -> Result<Vec<TranslationItem>, EngineError> {
        let remaining = self.translate_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.translate_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::RequestError("stub translation failure".to_string()));
        }
        Ok(target_languages
            .iter()
            .filter(|lang| Some(**lang) != self.omit_language)
            .map(|lang| TranslationItem {
                lang: *lang,
                text: format!("{}:{}", lang, text),
            })
            .collect())
    }
}

/// Publisher that records every message instead of talking to a broker.
/// `failing_publishes(n)` makes the first `n` calls fail.
pub(crate) struct RecordingPublisher {
    pub(crate) published: Mutex<Vec<(String, QueuedTask)>>,
    publish_failures: AtomicU32,
}

impl RecordingPublisher {
    pub(crate) fn new() -> Self {
        RecordingPublisher {
            published: Mutex::new(Vec::new()),
            publish_failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn failing_publishes(self, failures: u32) -> Self {
        self.publish_failures.store(failures, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl TaskPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, task: &QueuedTask) -> Result<(), PublishError> {
        let remaining = self.publish_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.publish_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::Delivery("stub broker unavailable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), task.clone()));
        Ok(())
    }
}

/// Worker context over an in-memory store, a throwaway package directory
/// and the given test doubles.
pub(crate) async fn test_context(
    engine: Arc<dyn AiEngine>,
    publisher: Arc<RecordingPublisher>,
) -> WorkerContext {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory DB");
    mltr_db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let mut config = AppConfig::default();
    config.storage.package_dir = std::env::temp_dir().join(format!("mltr_test_{}", Uuid::new_v4()));

    WorkerContext {
        config: Arc::new(config),
        db_pool,
        engine,
        publisher,
    }
}

/// Serialized `QueuedTask` payload for a task record, as the ingress
/// would publish it.
pub(crate) fn payload_for(task: &TranslationTask) -> Vec<u8> {
    serde_json::to_vec(&QueuedTask::from(task)).expect("QueuedTask serialization cannot fail")
}
