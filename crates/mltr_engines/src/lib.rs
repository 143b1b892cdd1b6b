//! External AI engine interfaces: speech-to-text, transcript scoring and
//! multilingual translation.
//!
//! The pipeline never performs recognition or translation itself; it calls
//! out through the [`AiEngine`] trait. The single production implementation
//! talks to an OpenAI-compatible API. Test code substitutes stub engines.

use async_trait::async_trait;
use mltr_types::{AppConfig, EngineError, LanguageCode, SttScore, TranslationItem};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

mod openai;

pub use openai::OpenAiEngine;

/// Defines the asynchronous interface to the external AI engines.
///
/// Must be `Send + Sync` so a single engine handle can be shared by the
/// worker loops.
#[async_trait]
pub trait AiEngine: Send + Sync {
    /// Transcribes the audio file at `audio_path` to text.
    async fn transcribe(&self, audio_path: &Path) -> Result<String, EngineError>;

    /// Scores a transcript against its reference text.
    ///
    /// # Returns
    /// A structured [`SttScore`] with per-dimension scores, the weighted
    /// total and an acceptability verdict.
    async fn score_transcript(
        &self,
        reference: &str,
        transcript: &str,
    ) -> Result<SttScore, EngineError>;

    /// Translates `text` into every requested target language.
    ///
    /// # Returns
    /// The engine's list shape, one [`TranslationItem`] per language.
    /// Callers normalise this into the canonical map representation.
    async fn translate(
        &self,
        text: &str,
        target_languages: &[LanguageCode],
    ) -> Result<Vec<TranslationItem>, EngineError>;
}

/// Creates the AI engine from configuration.
/// Returns `EngineError::AuthenticationError` when no API key is configured.
pub fn create_engine(config: &AppConfig) -> Result<Arc<dyn AiEngine>, EngineError> {
    info!("Creating OpenAI-compatible AI engine...");
    let engine = OpenAiEngine::new(config.engine.clone())?;
    Ok(Arc::new(engine))
}
