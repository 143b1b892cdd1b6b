//! Implementation of the AiEngine trait for OpenAI-compatible APIs using the
//! async-openai crate.

use crate::AiEngine;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateTranscriptionRequestArgs, ResponseFormat,
    },
    Client as OpenAIClientSdk,
};
use async_trait::async_trait;
use mltr_types::{EngineConfig, EngineError, LanguageCode, SttScore, TranslationItem};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// System prompt for the multilingual translation call. The target list and
/// format instructions are appended per request.
const TRANSLATION_SYSTEM_PROMPT: &str = "\
You are an expert multilingual translator with deep understanding of cultural nuances
and language-specific expressions.

Your primary responsibilities:
1. Translate the text accurately into all specified target languages
2. Preserve the original meaning, tone, and intent
3. Maintain appropriate formality level
4. Adapt cultural references when necessary
5. Use natural expressions native to each target language

Translation guidelines:
- Preserve the emotional tone and style of the original text
- Use appropriate idiomatic expressions for each language
- Maintain consistent formality level across translations
- Consider cultural context and sensitivity
- Ensure translations sound natural to native speakers

For Asian languages (Chinese, Japanese, Korean):
- Pay attention to honorifics and politeness levels
- Consider cultural-specific expressions
- Maintain appropriate formality

For European languages:
- Consider formal vs informal pronouns (tu/vous, du/Sie, etc.)
- Adapt idioms appropriately
- Maintain gender agreement where applicable";

const TRANSLATION_FORMAT_INSTRUCTIONS: &str = "\
Respond with a single JSON object of the form:
{\"translations\": [{\"lang\": \"<target language code>\", \"text\": \"<translated text>\"}, ...]}
Include exactly one entry per target language, using the language codes given above.";

/// STT 质量评估规则。评分维度与权重沿用评估专家的标准：
/// 语义准确性 0.6、完整性 0.3、语法正确性 0.1，总分 >= 0.80 为可接受。
const SCORE_SYSTEM_PROMPT: &str = "\
你是STT（语音转文字）质量评估专家。你需要从多个维度对STT结果进行评分。

评分规则：
1. 语义准确性 (semantic_accuracy)：评估STT输出与原文在语义层面的匹配程度（权重0.6）
   - 1.0：完全一致或同义替换（如\"取钱\"/\"拿钱\"）
   - 0.8-0.9：轻微差异但不影响理解（如词序调整）
   - 0.6-0.7：有差异但基本意思相近
   - <0.6：语义有明显偏差

2. 完整性 (completeness)：评估信息的完整性（权重0.3）
   - 1.0：核心信息完全保留
   - 0.8-0.9：次要信息有所缺失（如语气词、修饰词）
   - 0.6-0.7：丢失部分重要信息
   - <0.6：丢失核心信息

3. 语法正确性 (grammar)：评估基本语法结构（权重0.1）
   - 1.0：语句结构完整
   - 0.8-0.9：有小错误但不影响理解
   - 0.6-0.7：句子结构不完整
   - <0.6：严重语法错误影响理解

总分计算：
- total_score = 0.6*semantic_accuracy + 0.3*completeness + 0.1*grammar
- acceptable：总分>=0.80为可接受（主要考虑语义准确性）

Respond with a single JSON object containing the fields: semantic_accuracy,
completeness, grammar, total_score (all numbers 0-1), acceptable (boolean)
and comments (string).";

/// Wire shape of the translation engine's response.
#[derive(Debug, Deserialize)]
struct TranslationPayload {
    translations: Vec<TranslationItem>,
}

/// AI engine implementation backed by an OpenAI-compatible API:
/// the audio transcription endpoint for STT and JSON-mode chat completions
/// for scoring and translation.
pub struct OpenAiEngine {
    client: OpenAIClientSdk<OpenAIConfig>,
    config: EngineConfig,
}

/// Helper function to map OpenAIError to EngineError.
fn map_openai_error(err: OpenAIError) -> EngineError {
    warn!("Mapping OpenAI error: {:?}", err);
    match err {
        OpenAIError::ApiError(api_err) => {
            let status_code: u16 = api_err
                .code
                .as_ref()
                .and_then(|code| code.parse::<u16>().ok())
                .unwrap_or(0);
            EngineError::ApiError {
                status: status_code,
                message: format!(
                    "API error: Type={:?}, Code={:?}, Message={}, Param={:?}",
                    api_err.r#type, api_err.code, api_err.message, api_err.param
                ),
            }
        }
        OpenAIError::Reqwest(e) => EngineError::RequestError(format!("HTTP request failed: {}", e)),
        OpenAIError::StreamError(s) => EngineError::ResponseParseError(format!("Stream error: {}", s)),
        OpenAIError::FileSaveError(s) | OpenAIError::FileReadError(s) => {
            EngineError::ClientError(format!("File IO error: {}", s))
        }
        OpenAIError::InvalidArgument(s) => EngineError::InvalidInput(format!("Invalid argument: {}", s)),
        _ => EngineError::ClientError(format!("Unhandled OpenAI client error: {}", err)),
    }
}

/// Strips a Markdown code fence if the model wrapped its JSON in one.
/// Some OpenAI-compatible backends do this even in JSON mode.
fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(fenced) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
    fenced.strip_suffix("```").unwrap_or(fenced).trim()
}

/// Builds the numbered target-language list for the translation prompt.
fn language_list(target_languages: &[LanguageCode]) -> String {
    target_languages
        .iter()
        .enumerate()
        .map(|(i, lang)| format!("{}. {} ({})", i + 1, lang.english_name(), lang.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_score(content: &str) -> Result<SttScore, EngineError> {
    serde_json::from_str(extract_json(content))
        .map_err(|e| EngineError::ResponseParseError(format!("Bad score payload: {}", e)))
}

fn parse_translations(content: &str) -> Result<Vec<TranslationItem>, EngineError> {
    let payload: TranslationPayload = serde_json::from_str(extract_json(content))
        .map_err(|e| EngineError::ResponseParseError(format!("Bad translation payload: {}", e)))?;
    Ok(payload.translations)
}

impl OpenAiEngine {
    /// Creates a new engine instance.
    ///
    /// # Returns
    /// `EngineError::AuthenticationError` when the API key is missing or
    /// empty; the engine is unusable without it.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        debug!("Initializing OpenAiEngine, base_url: {:?}", config.base_url);

        let api_key = match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                error!("Engine API key not found or empty in configuration.");
                return Err(EngineError::AuthenticationError(
                    "Engine API key not found or empty in configuration.".to_string(),
                ));
            }
        };

        let mut sdk_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &config.base_url {
            sdk_config = sdk_config.with_api_base(base_url);
        }
        let client = OpenAIClientSdk::with_config(sdk_config);

        info!(model = %config.model, stt_model = %config.stt_model, "OpenAiEngine initialized");
        Ok(Self { client, config })
    }

    /// Applies the configured per-call deadline to an engine request.
    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let deadline = self.config.request_timeout_secs;
        tokio::time::timeout(Duration::from_secs(deadline), fut)
            .await
            .map_err(|_| EngineError::Timeout(deadline))?
    }

    /// Runs a system+user chat completion in JSON mode and returns the raw
    /// content of the first choice.
    async fn chat_json(&self, system_prompt: String, user_prompt: String) -> Result<String, EngineError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(|e| EngineError::ClientError(format!("Failed to build system message: {}", e)))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()
                    .map_err(|e| EngineError::ClientError(format!("Failed to build user message: {}", e)))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .messages(messages)
            .temperature(self.config.temperature)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(|e| EngineError::ClientError(format!("Failed to build request: {}", e)))?;

        debug!(model = %self.config.model, "Sending chat completion request...");
        let response = self
            .with_deadline(async {
                self.client.chat().create(request).await.map_err(map_openai_error)
            })
            .await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            error!("API response contained no choices.");
            EngineError::ResponseParseError("API response contained no choices".to_string())
        })?;

        choice.message.content.ok_or_else(|| {
            error!("API response choice contained no content.");
            EngineError::ResponseParseError("API response choice contained no content".to_string())
        })
    }
}

#[async_trait]
impl AiEngine for OpenAiEngine {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, EngineError> {
        debug!(path = %audio_path.display(), "Sending transcription request...");
        let request = CreateTranscriptionRequestArgs::default()
            .file(audio_path.to_string_lossy().into_owned())
            .model(&self.config.stt_model)
            .build()
            .map_err(|e| EngineError::ClientError(format!("Failed to build transcription request: {}", e)))?;

        let response = self
            .with_deadline(async {
                self.client
                    .audio()
                    .transcribe(request)
                    .await
                    .map_err(map_openai_error)
            })
            .await?;

        Ok(response.text)
    }

    async fn score_transcript(
        &self,
        reference: &str,
        transcript: &str,
    ) -> Result<SttScore, EngineError> {
        let user_prompt = format!(
            "请对以下STT结果进行详细评分：\n\n原文：{}\nSTT：{}\n\n\
             请从语义准确性、完整性、语法正确性三个维度进行评分，\
             并给出总分、是否可接受的判断，以及评分说明和改进建议。",
            reference, transcript
        );
        let content = self.chat_json(SCORE_SYSTEM_PROMPT.to_string(), user_prompt).await?;
        parse_score(&content)
    }

    async fn translate(
        &self,
        text: &str,
        target_languages: &[LanguageCode],
    ) -> Result<Vec<TranslationItem>, EngineError> {
        if target_languages.is_empty() {
            return Err(EngineError::InvalidInput(
                "No target languages requested".to_string(),
            ));
        }

        let system_prompt = format!(
            "{}\n\nTarget languages:\n{}\n\nFormat specification:\n{}",
            TRANSLATION_SYSTEM_PROMPT,
            language_list(target_languages),
            TRANSLATION_FORMAT_INSTRUCTIONS
        );
        let user_prompt = format!("Translate this text:\n{}", text);

        let content = self.chat_json(system_prompt, user_prompt).await?;
        parse_translations(&content)
    }
}
