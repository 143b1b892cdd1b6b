mod error;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mltr_types::{
    AppConfig, CreateTaskRequest, LanguageCode, QueuedTask, TaskPublisher, TaskResponse, TaskStatus,
    TaskType, TranslationTask,
};
use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::error::ApiError;

/// Shared state of the ingress API process.
pub struct ApiState {
    pub config: Arc<AppConfig>,
    pub db_pool: SqlitePool,
    pub publisher: Arc<dyn TaskPublisher>,
}

/// Ingress API entry point: binds the configured listener and serves the
/// `/v1` task surface until the process shuts down.
pub async fn run_server(state: Arc<ApiState>) -> Result<(), anyhow::Error> {
    let listen_address = state.config.network.listen_address.clone();
    let listen_port = state.config.network.listen_port;

    // Permissive CORS; the API carries no credentials.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check_handler))
        .route("/v1/tasks", post(create_task_handler))
        .route(
            "/v1/tasks/:task_id",
            get(get_task_handler).delete(cancel_task_handler),
        )
        .route(
            "/v1/tasks/:task_id/translations/:language",
            get(get_translation_handler),
        )
        .with_state(state)
        .layer(cors);

    let addr = SocketAddr::from((
        listen_address
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| "0.0.0.0".parse().expect("literal address parses")),
        listen_port,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check_handler() -> &'static str {
    "OK"
}

/// `POST /v1/tasks`: validate, assign an id, persist PENDING, publish the
/// queued task to the stage topic matching the task type.
///
/// The insert commits before the publish so a successful response is
/// immediately readable via GET. If the publish then fails, the response is
/// 5xx and the record stays PENDING; duplicate messages from retries are
/// absorbed by the workers' status guard.
async fn create_task_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let target_languages = request.validate().map_err(ApiError::BadRequest)?;

    let task = TranslationTask::new_pending(
        Uuid::new_v4(),
        request.task_type,
        request.source_file,
        request.reference_text,
        request.text,
        target_languages,
    );
    info!(task_id = %task.task_id, task_type = %task.task_type, "Creating new translation task");

    mltr_db::insert_task(&state.db_pool, &task).await?;

    let topic = match task.task_type {
        TaskType::Audio => &state.config.broker.audio_topic,
        TaskType::Text => &state.config.broker.translation_topic,
    };
    state.publisher.publish(topic, &QueuedTask::from(&task)).await?;

    info!(task_id = %task.task_id, topic = %topic, "Translation task created and enqueued");
    Ok(Json(TaskResponse::from(&task)))
}

/// `GET /v1/tasks/{task_id}`: current status plus whatever partial results
/// the stages have produced so far.
async fn get_task_handler(
    State(state): State<Arc<ApiState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    debug!(task_id = %task_id, "Fetching task status");
    let task = load_task(&state, &task_id).await?;
    Ok(Json(TaskResponse::from(&task)))
}

/// `DELETE /v1/tasks/{task_id}`: compare-and-set cancellation.
/// 204 on success; 404 when the task is unknown or already terminal.
async fn cancel_task_handler(
    State(state): State<Arc<ApiState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    info!(task_id = %task_id, "Attempting to cancel task");
    let id = parse_task_id(&task_id)?;
    let cancelled = mltr_db::cancel_task(&state.db_pool, id).await?;
    if !cancelled {
        warn!(task_id = %task_id, "Cancel failed: task not found or cannot be cancelled");
        return Err(ApiError::TaskNotFound(task_id));
    }
    info!(task_id = %task_id, "Task cancelled");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/tasks/{task_id}/translations/{language}`: one stored
/// translation. 400 until the task is COMPLETED, 404 for a language that
/// was not produced.
async fn get_translation_handler(
    State(state): State<Arc<ApiState>>,
    AxumPath((task_id, language)): AxumPath<(String, String)>,
) -> Result<Json<JsonValue>, ApiError> {
    debug!(task_id = %task_id, language = %language, "Fetching translation");
    let task = load_task(&state, &task_id).await?;

    if task.status != TaskStatus::Completed {
        warn!(task_id = %task_id, status = %task.status, "Translation not ready");
        return Err(ApiError::TranslationNotReady);
    }

    // An unsupported tag cannot have a translation: same 404 as a missing one.
    let language_code: LanguageCode = language
        .parse()
        .map_err(|_| ApiError::TranslationMissing(language.clone()))?;

    let text = task
        .translations
        .as_ref()
        .and_then(|translations| translations.get(&language_code))
        .ok_or_else(|| ApiError::TranslationMissing(language.clone()))?;

    Ok(Json(json!({ "text": text })))
}

/// A syntactically invalid task id can never exist: same 404 as unknown.
fn parse_task_id(task_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(task_id).map_err(|_| ApiError::TaskNotFound(task_id.to_string()))
}

async fn load_task(state: &ApiState, task_id: &str) -> Result<TranslationTask, ApiError> {
    let id = parse_task_id(task_id)?;
    mltr_db::get_task(&state.db_pool, id)
        .await?
        .ok_or_else(|| ApiError::TaskNotFound(task_id.to_string()))
}
