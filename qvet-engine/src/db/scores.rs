//! Score persistence
//!
//! Scores are the immutable record of what the automated evaluation
//! produced: exactly one row per answer, written once by the scoring stage
//! and never updated. Review corrections live in `badcase_reviews`.

use chrono::{DateTime, Utc};
use qvet_common::db::models::{AssistantVariant, Score, ScoreDimension};
use qvet_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Insert a score unless one already exists for (question, variant).
///
/// Returns `true` when the row was inserted; `false` means an earlier run
/// already scored this answer and the existing row stands.
pub async fn insert_if_absent(pool: &SqlitePool, score: &Score) -> Result<bool> {
    let dimensions = serde_json::to_string(&score.dimensions)
        .map_err(|e| Error::Internal(format!("Failed to serialize dimensions: {}", e)))?;

    let result = sqlx::query(
        r#"
        INSERT INTO scores (question_identity, variant, dimensions, average_value, rationale, rated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(question_identity, variant) DO NOTHING
        "#,
    )
    .bind(&score.question_identity)
    .bind(score.variant.as_str())
    .bind(&dimensions)
    .bind(score.average_value)
    .bind(&score.rationale)
    .bind(score.rated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load the score for one (question, variant)
pub async fn for_question_variant(
    pool: &SqlitePool,
    question_identity: &str,
    variant: AssistantVariant,
) -> Result<Option<Score>> {
    let row = sqlx::query(
        r#"
        SELECT question_identity, variant, dimensions, average_value, rationale, rated_at
        FROM scores
        WHERE question_identity = ? AND variant = ?
        "#,
    )
    .bind(question_identity)
    .bind(variant.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(row_to_score).transpose()
}

/// Load all scores for a question
pub async fn for_question(pool: &SqlitePool, question_identity: &str) -> Result<Vec<Score>> {
    let rows = sqlx::query(
        r#"
        SELECT question_identity, variant, dimensions, average_value, rationale, rated_at
        FROM scores
        WHERE question_identity = ?
        ORDER BY variant
        "#,
    )
    .bind(question_identity)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_score).collect()
}

fn row_to_score(row: sqlx::sqlite::SqliteRow) -> Result<Score> {
    let variant: String = row.get("variant");
    let dimensions: String = row.get("dimensions");
    let dimensions: Vec<ScoreDimension> = serde_json::from_str(&dimensions)
        .map_err(|e| Error::Internal(format!("Invalid dimensions in database: {}", e)))?;
    let rated_at: String = row.get("rated_at");
    let rated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&rated_at)
        .map_err(|e| Error::Internal(format!("Invalid rated_at in database: {}", e)))?
        .with_timezone(&Utc);

    Ok(Score {
        question_identity: row.get("question_identity"),
        variant: AssistantVariant::parse(&variant)?,
        dimensions,
        average_value: row.get("average_value"),
        rationale: row.get("rationale"),
        rated_at,
    })
}
