//! Question persistence and deduplication queries

use chrono::{DateTime, Utc};
use qvet_common::db::models::{ProcessingStatus, Question, ReviewStatus};
use qvet_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Upsert a question by content identity.
///
/// If absent, creates the row with `processing_status = pending`. If
/// present, updates only ingestion-owned columns (`metadata`,
/// `updated_at`), never `classification`, `processing_status`, or badcase
/// fields, so a re-run cannot regress an advanced question.
///
/// Returns `true` when a new row was created.
pub async fn upsert_from_ingestion(pool: &SqlitePool, question: &Question) -> Result<bool> {
    let existed: Option<i64> = sqlx::query_scalar("SELECT 1 FROM questions WHERE identity = ?")
        .bind(&question.identity)
        .fetch_optional(pool)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO questions (identity, source_id, recorded_at, content, metadata, processing_status)
        VALUES (?, ?, ?, ?, ?, 'pending')
        ON CONFLICT(identity) DO UPDATE SET
            metadata = excluded.metadata,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&question.identity)
    .bind(&question.source_id)
    .bind(question.recorded_at.to_rfc3339())
    .bind(&question.content)
    .bind(&question.metadata)
    .execute(pool)
    .await?;

    Ok(existed.is_none())
}

/// Load a question by identity
pub async fn load(pool: &SqlitePool, identity: &str) -> Result<Option<Question>> {
    let row = sqlx::query(
        r#"
        SELECT identity, source_id, recorded_at, content, metadata, classification,
               processing_status, is_badcase, badcase_review_status, badcase_detail, last_error
        FROM questions
        WHERE identity = ?
        "#,
    )
    .bind(identity)
    .fetch_optional(pool)
    .await?;

    row.map(row_to_question).transpose()
}

/// Load a question that must exist
pub async fn load_required(pool: &SqlitePool, identity: &str) -> Result<Question> {
    load(pool, identity)
        .await?
        .ok_or_else(|| Error::NotFound(format!("question {}", identity)))
}

/// Select questions eligible for a stage, oldest first.
///
/// Accepts several statuses so a stage can also pick up rows stranded in
/// its own transitional status by an interrupted run.
pub async fn select_by_statuses(
    pool: &SqlitePool,
    statuses: &[ProcessingStatus],
    limit: i64,
) -> Result<Vec<Question>> {
    // Statuses come from a closed enum, never user input
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        r#"
        SELECT identity, source_id, recorded_at, content, metadata, classification,
               processing_status, is_badcase, badcase_review_status, badcase_detail, last_error
        FROM questions
        WHERE processing_status IN ({})
        ORDER BY updated_at ASC
        LIMIT ?
        "#,
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for status in statuses {
        query = query.bind(status.as_str());
    }
    let rows = query.bind(limit).fetch_all(pool).await?;

    rows.into_iter().map(row_to_question).collect()
}

/// Set the processing status, clearing any recorded stage error
pub async fn update_status(
    pool: &SqlitePool,
    identity: &str,
    status: ProcessingStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE questions
        SET processing_status = ?, last_error = NULL, updated_at = CURRENT_TIMESTAMP
        WHERE identity = ?
        "#,
    )
    .bind(status.as_str())
    .bind(identity)
    .execute(pool)
    .await?;

    Ok(())
}

/// Set the processing status and record the per-item error that caused it
pub async fn update_status_with_error(
    pool: &SqlitePool,
    identity: &str,
    status: ProcessingStatus,
    message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE questions
        SET processing_status = ?, last_error = ?, updated_at = CURRENT_TIMESTAMP
        WHERE identity = ?
        "#,
    )
    .bind(status.as_str())
    .bind(message)
    .bind(identity)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist the classification result and advance to `classified`
pub async fn set_classification(pool: &SqlitePool, identity: &str, category: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE questions
        SET classification = ?, processing_status = 'classified',
            last_error = NULL, updated_at = CURRENT_TIMESTAMP
        WHERE identity = ?
        "#,
    )
    .bind(category)
    .bind(identity)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update the badcase flag, review status, and detection snapshot together.
///
/// Only the badcase detector and the review action go through here.
pub async fn set_badcase_state(
    pool: &SqlitePool,
    identity: &str,
    is_badcase: bool,
    review_status: ReviewStatus,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE questions
        SET is_badcase = ?, badcase_review_status = ?, badcase_detail = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE identity = ?
        "#,
    )
    .bind(is_badcase as i64)
    .bind(review_status.as_str())
    .bind(detail)
    .bind(identity)
    .execute(pool)
    .await?;

    Ok(())
}

/// Count questions currently flagged and awaiting review
pub async fn count_pending_reviews(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM questions WHERE is_badcase = 1 AND badcase_review_status = 'pending'",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Count questions in a given status
pub async fn count_by_status(pool: &SqlitePool, status: ProcessingStatus) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM questions WHERE processing_status = ?")
            .bind(status.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

fn row_to_question(row: sqlx::sqlite::SqliteRow) -> Result<Question> {
    let recorded_at: String = row.get("recorded_at");
    let recorded_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|e| Error::Internal(format!("Invalid recorded_at in database: {}", e)))?
        .with_timezone(&Utc);

    let status: String = row.get("processing_status");
    let review_status: String = row.get("badcase_review_status");
    let is_badcase: i64 = row.get("is_badcase");

    Ok(Question {
        identity: row.get("identity"),
        source_id: row.get("source_id"),
        recorded_at,
        content: row.get("content"),
        metadata: row.get("metadata"),
        classification: row.get("classification"),
        processing_status: ProcessingStatus::parse(&status)?,
        is_badcase: is_badcase != 0,
        badcase_review_status: ReviewStatus::parse(&review_status)?,
        badcase_detail: row.get("badcase_detail"),
        last_error: row.get("last_error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvet_common::db::models::RawRecord;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();
        pool
    }

    fn record(source_id: &str, content: &str) -> RawRecord {
        RawRecord {
            source_id: source_id.to_string(),
            recorded_at: chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            content: content.to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_skips() {
        let pool = setup_test_db().await;
        let question = Question::from_record(&record("p1", "Q1"));

        assert!(upsert_from_ingestion(&pool, &question).await.unwrap());
        assert!(!upsert_from_ingestion(&pool, &question).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM questions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn upsert_never_regresses_stage_fields() {
        let pool = setup_test_db().await;
        let question = Question::from_record(&record("p1", "Q1"));
        upsert_from_ingestion(&pool, &question).await.unwrap();

        set_classification(&pool, &question.identity, "math").await.unwrap();

        // Re-ingest with updated metadata
        let mut again = question.clone();
        again.metadata = Some("{\"tag\":\"rerun\"}".to_string());
        upsert_from_ingestion(&pool, &again).await.unwrap();

        let loaded = load_required(&pool, &question.identity).await.unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::Classified);
        assert_eq!(loaded.classification.as_deref(), Some("math"));
        assert_eq!(loaded.metadata.as_deref(), Some("{\"tag\":\"rerun\"}"));
    }

    #[tokio::test]
    async fn select_by_statuses_filters_and_limits() {
        let pool = setup_test_db().await;
        for i in 0..5 {
            let q = Question::from_record(&record("p1", &format!("Q{}", i)));
            upsert_from_ingestion(&pool, &q).await.unwrap();
        }
        let q = Question::from_record(&record("p1", "classified-one"));
        upsert_from_ingestion(&pool, &q).await.unwrap();
        set_classification(&pool, &q.identity, "math").await.unwrap();

        let pending =
            select_by_statuses(&pool, &[ProcessingStatus::Pending], 3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending
            .iter()
            .all(|q| q.processing_status == ProcessingStatus::Pending));
    }

    #[tokio::test]
    async fn status_error_recorded_and_cleared() {
        let pool = setup_test_db().await;
        let q = Question::from_record(&record("p1", "Q1"));
        upsert_from_ingestion(&pool, &q).await.unwrap();

        update_status_with_error(
            &pool,
            &q.identity,
            ProcessingStatus::ClassificationFailed,
            "capability rejected content",
        )
        .await
        .unwrap();

        let loaded = load_required(&pool, &q.identity).await.unwrap();
        assert_eq!(loaded.processing_status, ProcessingStatus::ClassificationFailed);
        assert_eq!(loaded.last_error.as_deref(), Some("capability rejected content"));

        update_status(&pool, &q.identity, ProcessingStatus::Pending).await.unwrap();
        let loaded = load_required(&pool, &q.identity).await.unwrap();
        assert!(loaded.last_error.is_none());
    }
}
