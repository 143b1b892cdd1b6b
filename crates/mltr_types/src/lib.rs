use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// 1. LanguageCode 枚举

/// Closed set of supported target language tags.
/// Unknown tags are rejected at the ingress boundary.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum LanguageCode {
    #[serde(rename = "zh-CN")]
    ZhCn,
    #[serde(rename = "zh-TW")]
    ZhTw,
    #[serde(rename = "en-US")]
    EnUs,
    #[serde(rename = "ja-JP")]
    JaJp,
    #[serde(rename = "ko-KR")]
    KoKr,
    #[serde(rename = "fr-FR")]
    FrFr,
    #[serde(rename = "de-DE")]
    DeDe,
    #[serde(rename = "es-ES")]
    EsEs,
    #[serde(rename = "ru-RU")]
    RuRu,
    #[serde(rename = "vi-VN")]
    ViVn,
}

impl LanguageCode {
    /// Every supported language, in a stable order.
    pub const ALL: [LanguageCode; 10] = [
        LanguageCode::ZhCn,
        LanguageCode::ZhTw,
        LanguageCode::EnUs,
        LanguageCode::JaJp,
        LanguageCode::KoKr,
        LanguageCode::FrFr,
        LanguageCode::DeDe,
        LanguageCode::EsEs,
        LanguageCode::RuRu,
        LanguageCode::ViVn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageCode::ZhCn => "zh-CN",
            LanguageCode::ZhTw => "zh-TW",
            LanguageCode::EnUs => "en-US",
            LanguageCode::JaJp => "ja-JP",
            LanguageCode::KoKr => "ko-KR",
            LanguageCode::FrFr => "fr-FR",
            LanguageCode::DeDe => "de-DE",
            LanguageCode::EsEs => "es-ES",
            LanguageCode::RuRu => "ru-RU",
            LanguageCode::ViVn => "vi-VN",
        }
    }

    /// Human-readable name, used when building engine prompts.
    pub fn english_name(&self) -> &'static str {
        match self {
            LanguageCode::ZhCn => "Simplified Chinese",
            LanguageCode::ZhTw => "Traditional Chinese",
            LanguageCode::EnUs => "English (US)",
            LanguageCode::JaJp => "Japanese",
            LanguageCode::KoKr => "Korean",
            LanguageCode::FrFr => "French",
            LanguageCode::DeDe => "German",
            LanguageCode::EsEs => "Spanish",
            LanguageCode::RuRu => "Russian",
            LanguageCode::ViVn => "Vietnamese",
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unsupported language code: {0}")]
pub struct LanguageCodeParseError(String);

impl FromStr for LanguageCode {
    type Err = LanguageCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LanguageCode::ALL
            .iter()
            .find(|lang| lang.as_str() == s)
            .copied()
            .ok_or_else(|| LanguageCodeParseError(s.to_string()))
    }
}

// 2. TaskType 枚举

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Audio,
    Text,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Audio => "audio",
            TaskType::Text => "text",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown task type: {0}")]
pub struct TaskTypeParseError(String);

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(TaskType::Audio),
            "text" => Ok(TaskType::Text),
            other => Err(TaskTypeParseError(other.to_string())),
        }
    }
}

// 3. TaskStatus 枚举

/// Persistent task state machine:
///
/// ```text
/// PENDING -> TO_PACKING -> COMPLETED
/// PENDING | TO_PACKING -> CANCELLED
/// PENDING | TO_PACKING -> FAILED
/// ```
///
/// COMPLETED, FAILED and CANCELLED are terminal and never transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    ToPacking,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::ToPacking => "to_packing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown task status: {0}")]
pub struct TaskStatusParseError(String);

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "to_packing" => Ok(TaskStatus::ToPacking),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TaskStatusParseError(other.to_string())),
        }
    }
}

// 4. Engine result shapes

/// Quality score produced by the STT scoring engine.
///
/// `total_score = 0.6 * semantic_accuracy + 0.3 * completeness + 0.1 * grammar`,
/// and a result is acceptable when the total is at least 0.80.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SttScore {
    /// Semantic match against the reference text (0-1).
    pub semantic_accuracy: f32,
    /// How much of the reference information survived (0-1).
    pub completeness: f32,
    /// Grammatical soundness of the transcript (0-1).
    pub grammar: f32,
    /// Weighted total (0-1).
    pub total_score: f32,
    /// Whether the transcript passes the acceptance threshold.
    pub acceptable: bool,
    /// Free-form evaluator commentary.
    pub comments: String,
}

/// One translation as returned by the translation engine.
/// This list shape exists only on the engine wire; workers normalise it
/// into the canonical `LanguageCode -> String` map before persisting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationItem {
    pub lang: LanguageCode,
    pub text: String,
}

/// Canonical in-memory representation of a task's translations.
pub type TranslationMap = BTreeMap<LanguageCode, String>;

/// Collapses the engine's list shape into the canonical map.
/// Later entries for the same language win.
pub fn translations_into_map(items: Vec<TranslationItem>) -> TranslationMap {
    items.into_iter().map(|item| (item.lang, item.text)).collect()
}

// 5. TranslationTask 持久化记录

/// Persistent task record, keyed by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationTask {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Audio source path, relative to the uploads directory. AUDIO tasks only.
    pub source_file: Option<String>,
    /// Reference transcript used for STT scoring. AUDIO tasks only.
    pub reference_text: Option<String>,
    /// Plain text input. TEXT tasks only.
    pub text: Option<String>,
    /// Requested target languages, duplicates collapsed, insertion order kept.
    pub target_languages: Vec<LanguageCode>,
    /// Transcript produced by the audio worker.
    pub stt_result: Option<String>,
    /// Transcript quality score produced by the audio worker.
    pub stt_score: Option<SttScore>,
    /// Translations produced by the audio or translation worker.
    pub translations: Option<TranslationMap>,
    /// Path of the package file written by the packaging worker.
    pub packed_file: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TranslationTask {
    /// Builds a fresh PENDING record for a newly submitted task.
    pub fn new_pending(
        task_id: Uuid,
        task_type: TaskType,
        source_file: Option<String>,
        reference_text: Option<String>,
        text: Option<String>,
        target_languages: Vec<LanguageCode>,
    ) -> Self {
        let now = Utc::now();
        TranslationTask {
            task_id,
            task_type,
            status: TaskStatus::Pending,
            source_file,
            reference_text,
            text,
            target_languages,
            stt_result: None,
            stt_score: None,
            translations: None,
            packed_file: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// 6. QueuedTask 消息

/// Wire message exchanged between stages on every topic.
///
/// Carries enough data to be processed without re-reading the stored record
/// for inputs; workers still reload the record to check `status` before
/// acting, which is what makes redelivery safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedTask {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub target_languages: Vec<LanguageCode>,
}

impl From<&TranslationTask> for QueuedTask {
    fn from(task: &TranslationTask) -> Self {
        QueuedTask {
            task_id: task.task_id,
            task_type: task.task_type,
            source_file: task.source_file.clone(),
            reference_text: task.reference_text.clone(),
            text: task.text.clone(),
            target_languages: task.target_languages.clone(),
        }
    }
}

// 7. HTTP request/response schemas

/// Request body for `POST /v1/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub reference_text: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub target_languages: Vec<LanguageCode>,
}

impl CreateTaskRequest {
    /// Validates the per-type field shape and returns the target languages
    /// with duplicates collapsed (first occurrence wins).
    pub fn validate(&self) -> Result<Vec<LanguageCode>, String> {
        if self.target_languages.is_empty() {
            return Err("target_languages must not be empty".to_string());
        }
        match self.task_type {
            TaskType::Audio => {
                if self.source_file.as_deref().map_or(true, str::is_empty) {
                    return Err("source_file is required for audio tasks".to_string());
                }
                if self.text.is_some() {
                    return Err("text must not be set for audio tasks".to_string());
                }
            }
            TaskType::Text => {
                if self.text.as_deref().map_or(true, str::is_empty) {
                    return Err("text is required for text tasks".to_string());
                }
                if self.source_file.is_some() {
                    return Err("source_file must not be set for text tasks".to_string());
                }
                if self.reference_text.is_some() {
                    return Err("reference_text must not be set for text tasks".to_string());
                }
            }
        }

        let mut languages = Vec::with_capacity(self.target_languages.len());
        for lang in &self.target_languages {
            if !languages.contains(lang) {
                languages.push(*lang);
            }
        }
        Ok(languages)
    }
}

/// Response body for task submission and status queries.
/// Absent fields are omitted on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt_accuracy: Option<SttScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translations: Option<TranslationMap>,
}

impl From<&TranslationTask> for TaskResponse {
    fn from(task: &TranslationTask) -> Self {
        TaskResponse {
            task_id: task.task_id,
            status: task.status,
            stt_result: task.stt_result.clone(),
            stt_accuracy: task.stt_score.clone(),
            translations: task.translations.clone(),
        }
    }
}

// 8. Shared error and trait seams

/// Shared error type for engine operations across mltr crates.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Engine client error: {0}")]
    ClientError(String),
    #[error("Authentication error: {0}")]
    AuthenticationError(String),
    #[error("API error (status: {status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Request error: {0}")]
    RequestError(String),
    #[error("Response parse error: {0}")]
    ResponseParseError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Engine call exceeded deadline of {0}s")]
    Timeout(u64),
}

/// Error raised when publishing a stage message to the broker.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to serialize message: {0}")]
    Serialization(String),
    #[error("Broker delivery failed: {0}")]
    Delivery(String),
}

/// Publishes `QueuedTask` messages onto a named topic.
///
/// Implemented by the Kafka producer wrapper; test code substitutes
/// an in-memory recorder.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish(&self, topic: &str, task: &QueuedTask) -> Result<(), PublishError>;
}

// 9. Configuration structures

/// Database connection settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite:mltr_tasks.db".
    pub url: String,
}

/// Broker topics, consumer groups and connection settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// Comma-separated bootstrap broker list.
    pub bootstrap_servers: String,
    /// Topic carrying audio-stage messages.
    pub audio_topic: String,
    /// Topic carrying text-translation-stage messages.
    pub translation_topic: String,
    /// Topic carrying packaging-stage messages.
    pub package_topic: String,
    /// Consumer group of the audio worker.
    pub whisper_group: String,
    /// Consumer group of the translation worker.
    pub translation_group: String,
    /// Consumer group of the packaging worker.
    pub packaging_group: String,
}

/// External AI engine settings (OpenAI-compatible endpoint).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible API. None uses the SDK default.
    pub base_url: Option<String>,
    /// API key. Usually provided via MLTR_ENGINE__API_KEY.
    pub api_key: Option<String>,
    /// Chat model used for translation and STT scoring.
    pub model: String,
    /// Transcription model used for speech-to-text.
    pub stt_model: String,
    /// Sampling temperature for chat calls.
    pub temperature: f32,
    /// Per-call deadline applied to every engine request.
    pub request_timeout_secs: u64,
}

/// Filesystem locations used by the pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// Directory package files are written to. Created if missing.
    pub package_dir: PathBuf,
    /// Directory audio uploads are read from.
    pub uploads_dir: PathBuf,
}

/// Ingress API listener settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub listen_port: u16,
}

/// Main application configuration structure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    /// Application name (mostly for logging/identification).
    pub app_name: String,
    /// Logging level (e.g. "debug", "info", "warn").
    pub log_level: String,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            app_name: "mltr".to_string(),
            log_level: "info".to_string(),
            database: DatabaseConfig {
                url: "sqlite:mltr_tasks.db".to_string(),
            },
            broker: BrokerConfig {
                bootstrap_servers: "localhost:9092".to_string(),
                audio_topic: "audio_processing".to_string(),
                translation_topic: "text_translation".to_string(),
                package_topic: "text_packaging".to_string(),
                whisper_group: "whisper_processing_group".to_string(),
                translation_group: "translation_processing_group".to_string(),
                packaging_group: "text_packaging_group".to_string(),
            },
            engine: EngineConfig {
                base_url: None,
                api_key: None,
                model: "gpt-4o".to_string(),
                stt_model: "whisper-1".to_string(),
                temperature: 0.1,
                request_timeout_secs: 120,
            },
            storage: StorageConfig {
                package_dir: PathBuf::from("packs"),
                uploads_dir: PathBuf::from("uploads"),
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0".to_string(),
                listen_port: 8000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_code_wire_format() {
        let json = serde_json::to_string(&LanguageCode::ZhCn).unwrap();
        assert_eq!(json, "\"zh-CN\"");
        let parsed: LanguageCode = serde_json::from_str("\"ja-JP\"").unwrap();
        assert_eq!(parsed, LanguageCode::JaJp);
    }

    #[test]
    fn test_language_code_rejects_unknown_tag() {
        let result = serde_json::from_str::<LanguageCode>("\"pt-BR\"");
        assert!(result.is_err(), "Unknown tags must be rejected");
        assert!("xx-YY".parse::<LanguageCode>().is_err());
    }

    #[test]
    fn test_status_wire_format_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::ToPacking).unwrap(),
            "\"to_packing\""
        );
        assert_eq!("to_packing".parse::<TaskStatus>().unwrap(), TaskStatus::ToPacking);
        assert_eq!(TaskStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::ToPacking.is_terminal());
    }

    #[test]
    fn test_validate_rejects_empty_languages() {
        let request = CreateTaskRequest {
            task_type: TaskType::Text,
            source_file: None,
            reference_text: None,
            text: Some("hello".to_string()),
            target_languages: vec![],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_collapses_duplicates_keeping_order() {
        let request = CreateTaskRequest {
            task_type: TaskType::Text,
            source_file: None,
            reference_text: None,
            text: Some("hello".to_string()),
            target_languages: vec![
                LanguageCode::JaJp,
                LanguageCode::ZhCn,
                LanguageCode::JaJp,
                LanguageCode::EnUs,
            ],
        };
        let languages = request.validate().unwrap();
        assert_eq!(
            languages,
            vec![LanguageCode::JaJp, LanguageCode::ZhCn, LanguageCode::EnUs]
        );
    }

    #[test]
    fn test_validate_audio_requires_source_file() {
        let request = CreateTaskRequest {
            task_type: TaskType::Audio,
            source_file: None,
            reference_text: Some("Hello".to_string()),
            text: None,
            target_languages: vec![LanguageCode::EnUs],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_text_rejects_audio_fields() {
        let request = CreateTaskRequest {
            task_type: TaskType::Text,
            source_file: Some("1.mp3".to_string()),
            reference_text: None,
            text: Some("hello".to_string()),
            target_languages: vec![LanguageCode::EnUs],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_queued_task_roundtrip() {
        let task = TranslationTask::new_pending(
            Uuid::new_v4(),
            TaskType::Audio,
            Some("1.mp3".to_string()),
            Some("Hello world".to_string()),
            None,
            vec![LanguageCode::ZhCn, LanguageCode::JaJp],
        );
        let queued = QueuedTask::from(&task);
        let json = serde_json::to_string(&queued).unwrap();
        assert!(json.contains("\"type\":\"audio\""));
        let back: QueuedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, queued);
    }

    #[test]
    fn test_translations_into_map_last_entry_wins() {
        let map = translations_into_map(vec![
            TranslationItem { lang: LanguageCode::EnUs, text: "hi".to_string() },
            TranslationItem { lang: LanguageCode::ZhCn, text: "你好".to_string() },
            TranslationItem { lang: LanguageCode::EnUs, text: "hello".to_string() },
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&LanguageCode::EnUs], "hello");
    }

    #[test]
    fn test_task_response_omits_absent_fields() {
        let task = TranslationTask::new_pending(
            Uuid::new_v4(),
            TaskType::Text,
            None,
            None,
            Some("hello".to_string()),
            vec![LanguageCode::ZhCn],
        );
        let response = TaskResponse::from(&task);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("stt_result"));
        assert!(!json.contains("translations"));
        assert!(json.contains("\"status\":\"pending\""));
    }
}
