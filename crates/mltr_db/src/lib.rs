use chrono::{DateTime, Utc};
use mltr_types::{SttScore, TaskStatus, TranslationMap, TranslationTask};
use sqlx::pool::PoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid data format: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for DbError {
    fn from(error: sqlx::Error) -> Self {
        DbError::QueryFailed(error.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(error: std::io::Error) -> Self {
        DbError::IoError(error.to_string())
    }
}

/// Initializes the SQLite task store connection pool.
/// Creates the database file and runs migrations if necessary.
#[instrument]
pub async fn init_db(db_url: &str) -> Result<SqlitePool, DbError> {
    if db_url.starts_with("sqlite:") {
        let file_path = db_url.trim_start_matches("sqlite:");

        if let Some(parent) = Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!("Creating directory structure for database: {:?}", parent);
                fs::create_dir_all(parent)
                    .map_err(|e| DbError::IoError(format!("Failed to create database directory: {}", e)))?;
            }
        }
    }

    if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
        info!("Database not found, creating new one at {}", db_url);
        Sqlite::create_database(db_url)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
    } else {
        info!("Using existing database at {}", db_url);
    }

    let connection_options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = PoolOptions::new()
        .max_connections(5)
        .connect_with(connection_options)
        .await
        .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

    info!("Database pool created. Running migrations...");
    run_migrations(&pool).await?;
    info!("Database initialized and migrations run successfully.");
    Ok(pool)
}

/// Creates the task table and its indexes. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS translation_tasks (
            task_id TEXT PRIMARY KEY NOT NULL, -- UUID stored as TEXT
            task_type TEXT NOT NULL,           -- "audio" | "text"
            status TEXT NOT NULL,              -- state machine value
            source_file TEXT,                  -- audio path (AUDIO only)
            reference_text TEXT,               -- scoring reference (AUDIO only)
            text TEXT,                         -- plain text input (TEXT only)
            target_languages TEXT NOT NULL,    -- JSON array of language tags
            stt_result TEXT,                   -- transcript
            stt_score TEXT,                    -- JSON score object
            translations TEXT,                 -- JSON object lang -> text
            packed_file TEXT,                  -- package file path
            created_at TEXT NOT NULL,          -- ISO8601 DateTime stored as TEXT
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::MigrationFailed(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_translation_tasks_status ON translation_tasks (status);
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::MigrationFailed(e.to_string()))?;

    Ok(())
}

fn task_from_row(row: &SqliteRow) -> Result<TranslationTask, DbError> {
    let task_id: String = row.get("task_id");
    let task_type: String = row.get("task_type");
    let status: String = row.get("status");
    let target_languages: String = row.get("target_languages");
    let stt_score: Option<String> = row.get("stt_score");
    let translations: Option<String> = row.get("translations");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let completed_at: Option<String> = row.get("completed_at");

    let parse_timestamp = |value: &str| -> Result<DateTime<Utc>, DbError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DbError::InvalidData(format!("Bad timestamp '{}': {}", value, e)))
    };

    Ok(TranslationTask {
        task_id: Uuid::parse_str(&task_id)
            .map_err(|e| DbError::InvalidData(format!("Bad task_id '{}': {}", task_id, e)))?,
        task_type: task_type
            .parse()
            .map_err(|e| DbError::InvalidData(format!("{}", e)))?,
        status: status
            .parse()
            .map_err(|e| DbError::InvalidData(format!("{}", e)))?,
        source_file: row.get("source_file"),
        reference_text: row.get("reference_text"),
        text: row.get("text"),
        target_languages: serde_json::from_str(&target_languages)
            .map_err(|e| DbError::InvalidData(format!("Bad target_languages: {}", e)))?,
        stt_result: row.get("stt_result"),
        stt_score: stt_score
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DbError::InvalidData(format!("Bad stt_score: {}", e)))?,
        translations: translations
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DbError::InvalidData(format!("Bad translations: {}", e)))?,
        packed_file: row.get("packed_file"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

/// Fetches a task record by id. Always reads fresh state, never cached.
#[instrument(skip(pool), fields(task_id = %task_id))]
pub async fn get_task(pool: &SqlitePool, task_id: Uuid) -> Result<Option<TranslationTask>, DbError> {
    let row = sqlx::query("SELECT * FROM translation_tasks WHERE task_id = $1")
        .bind(task_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

/// Inserts a newly created PENDING task record.
#[instrument(skip(pool, task), fields(task_id = %task.task_id))]
pub async fn insert_task(pool: &SqlitePool, task: &TranslationTask) -> Result<(), DbError> {
    let target_languages = serde_json::to_string(&task.target_languages)
        .map_err(|e| DbError::InvalidData(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO translation_tasks
            (task_id, task_type, status, source_file, reference_text, text,
             target_languages, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(task.task_id.to_string())
    .bind(task.task_type.as_str())
    .bind(task.status.as_str())
    .bind(&task.source_file)
    .bind(&task.reference_text)
    .bind(&task.text)
    .bind(target_languages)
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    info!("Inserted task record");
    Ok(())
}

/// Atomic compare-and-set cancellation.
///
/// Transitions the task to CANCELLED iff its current status is not terminal.
/// Returns whether the transition happened.
#[instrument(skip(pool), fields(task_id = %task_id))]
pub async fn cancel_task(pool: &SqlitePool, task_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE translation_tasks
        SET status = $1, updated_at = $2
        WHERE task_id = $3 AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
    )
    .bind(TaskStatus::Cancelled.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .execute(pool)
    .await?;

    let cancelled = result.rows_affected() > 0;
    if cancelled {
        info!("Task cancelled");
    } else {
        warn!("Cancel was a no-op: task missing or already terminal");
    }
    Ok(cancelled)
}

/// Guarded PENDING -> TO_PACKING transition, storing stage results.
///
/// The status guard in the WHERE clause makes the transition idempotent
/// under redelivery: a second delivery finds the task no longer PENDING
/// and the update affects zero rows. Returns whether the transition
/// happened.
///
/// Takes any executor so callers can run it inside a transaction and
/// roll the write back when a later step fails.
#[instrument(skip(executor, stt_result, stt_score, translations), fields(task_id = %task_id))]
pub async fn mark_to_packing<'e, E>(
    executor: E,
    task_id: Uuid,
    stt_result: Option<&str>,
    stt_score: Option<&SttScore>,
    translations: &TranslationMap,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let score_json = stt_score
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DbError::InvalidData(e.to_string()))?;
    let translations_json =
        serde_json::to_string(translations).map_err(|e| DbError::InvalidData(e.to_string()))?;

    let result = sqlx::query(
        r#"
        UPDATE translation_tasks
        SET status = 'to_packing', stt_result = $1, stt_score = $2,
            translations = $3, updated_at = $4
        WHERE task_id = $5 AND status = 'pending'
        "#,
    )
    .bind(stt_result)
    .bind(score_json)
    .bind(translations_json)
    .bind(Utc::now().to_rfc3339())
    .bind(task_id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Guarded TO_PACKING -> COMPLETED transition, recording the package path.
/// Returns whether the transition happened.
#[instrument(skip(executor, packed_file), fields(task_id = %task_id))]
pub async fn mark_completed<'e, E>(
    executor: E,
    task_id: Uuid,
    packed_file: &str,
) -> Result<bool, DbError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE translation_tasks
        SET status = 'completed', packed_file = $1, completed_at = $2, updated_at = $3
        WHERE task_id = $4 AND status = 'to_packing'
        "#,
    )
    .bind(packed_file)
    .bind(&now)
    .bind(&now)
    .bind(task_id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}
