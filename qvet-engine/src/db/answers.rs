//! Answer persistence
//!
//! One answer per (question, assistant variant). Uniqueness is enforced by
//! the table's UNIQUE constraint; the insert path treats a conflict as a
//! no-op so overlapping generation runs cannot double-write.

use qvet_common::db::models::{Answer, AssistantVariant};
use qvet_common::Result;
use sqlx::{Row, SqlitePool};

/// Check whether an answer exists for (question, variant)
pub async fn exists(
    pool: &SqlitePool,
    question_identity: &str,
    variant: AssistantVariant,
) -> Result<bool> {
    let row: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM answers WHERE question_identity = ? AND variant = ? LIMIT 1",
    )
    .bind(question_identity)
    .bind(variant.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Insert an answer unless one already exists for (question, variant).
///
/// Returns `true` when this call inserted the row, `false` when a
/// concurrent worker got there first (treated as success by callers).
pub async fn insert_if_absent(
    pool: &SqlitePool,
    question_identity: &str,
    variant: AssistantVariant,
    text: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO answers (question_identity, variant, text)
        VALUES (?, ?, ?)
        ON CONFLICT(question_identity, variant) DO NOTHING
        "#,
    )
    .bind(question_identity)
    .bind(variant.as_str())
    .bind(text)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load all answers for a question
pub async fn for_question(pool: &SqlitePool, question_identity: &str) -> Result<Vec<Answer>> {
    let rows = sqlx::query(
        r#"
        SELECT question_identity, variant, text, is_scored
        FROM answers
        WHERE question_identity = ?
        ORDER BY variant
        "#,
    )
    .bind(question_identity)
    .fetch_all(pool)
    .await?;

    let mut answers = Vec::with_capacity(rows.len());
    for row in rows {
        let variant: String = row.get("variant");
        let is_scored: i64 = row.get("is_scored");
        answers.push(Answer {
            question_identity: row.get("question_identity"),
            variant: AssistantVariant::parse(&variant)?,
            text: row.get("text"),
            is_scored: is_scored != 0,
        });
    }
    Ok(answers)
}

/// Flip the scored flag after the matching score row is committed
pub async fn mark_scored(
    pool: &SqlitePool,
    question_identity: &str,
    variant: AssistantVariant,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE answers
        SET is_scored = 1, updated_at = CURRENT_TIMESTAMP
        WHERE question_identity = ? AND variant = ?
        "#,
    )
    .bind(question_identity)
    .bind(variant.as_str())
    .execute(pool)
    .await?;

    Ok(())
}
