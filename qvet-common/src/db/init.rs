//! Database initialization
//!
//! Creates the database on first run with the full schema, then applies
//! idempotent migrations (`CREATE TABLE IF NOT EXISTS`) and seeds default
//! settings on every start.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers with one writer; batch workers and the
    // scheduler share this pool
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_tables(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Run all idempotent table migrations.
///
/// Public so tests can initialize an in-memory database.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_raw_records_table(pool).await?;
    create_questions_table(pool).await?;
    create_answers_table(pool).await?;
    create_scores_table(pool).await?;
    create_badcase_reviews_table(pool).await?;
    create_workflow_phases_table(pool).await?;
    create_settings_table(pool).await?;
    Ok(())
}

/// Ingestion source table.
///
/// Externally owned and append-only; the pipeline only reads it through a
/// time-windowed query. Created here so a fresh database is self-contained.
async fn create_raw_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_records (
            source_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_records_recorded_at ON raw_records (recorded_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_questions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS questions (
            identity TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT,
            classification TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            is_badcase INTEGER NOT NULL DEFAULT 0,
            badcase_review_status TEXT NOT NULL DEFAULT 'none',
            badcase_detail TEXT,
            last_error TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_questions_status ON questions (processing_status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// The UNIQUE constraint on (question_identity, variant) is the structural
/// guard against double-generation under concurrent batch runs.
async fn create_answers_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS answers (
            question_identity TEXT NOT NULL,
            variant TEXT NOT NULL,
            text TEXT NOT NULL,
            is_scored INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (question_identity, variant),
            FOREIGN KEY (question_identity) REFERENCES questions (identity)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_scores_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scores (
            question_identity TEXT NOT NULL,
            variant TEXT NOT NULL,
            dimensions TEXT NOT NULL,
            average_value REAL NOT NULL,
            rationale TEXT NOT NULL DEFAULT '',
            rated_at TEXT NOT NULL,
            UNIQUE (question_identity, variant),
            FOREIGN KEY (question_identity) REFERENCES questions (identity)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_badcase_reviews_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS badcase_reviews (
            guid TEXT PRIMARY KEY,
            question_identity TEXT NOT NULL,
            corrected_dimensions TEXT,
            corrected_average REAL,
            reviewer TEXT NOT NULL,
            review_result TEXT NOT NULL,
            reviewed_at TEXT NOT NULL,
            FOREIGN KEY (question_identity) REFERENCES questions (identity)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_workflow_phases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_phases (
            phase TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            depends_on TEXT NOT NULL DEFAULT '[]',
            auto_continue INTEGER NOT NULL DEFAULT 1,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_message TEXT,
            last_run_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the settings table
///
/// Key-value configuration store; the badcase threshold and operational
/// tunables live here.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings.
///
/// Ensures all required settings exist with default values; NULL values
/// are reset to defaults.
pub async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Badcase detection
    ensure_setting(pool, "badcase_score_threshold", "2.5").await?;

    // Stage processing
    ensure_setting(pool, "stage_batch_size", "50").await?;
    ensure_setting(pool, "sync_window_hours", "24").await?;

    // Scheduler
    ensure_setting(pool, "scheduler_interval_secs", "86400").await?; // daily

    // Capability client
    ensure_setting(pool, "capability_api_url", "").await?;
    ensure_setting(pool, "capability_api_key", "").await?;
    ensure_setting(pool, "capability_timeout_ms", "30000").await?;
    ensure_setting(pool, "capability_max_retries", "3").await?;
    ensure_setting(pool, "capability_base_delay_ms", "500").await?;
    ensure_setting(pool, "capability_backoff_factor", "2.0").await?;

    Ok(())
}

/// Insert a setting if missing, or reset it if its value is NULL
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = COALESCE(settings.value, excluded.value)
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    Ok(())
}
