//! Badcase review annotation persistence

use chrono::{DateTime, Utc};
use qvet_common::db::models::{BadcaseReview, ReviewResult, ScoreDimension};
use qvet_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert a review annotation
pub async fn insert(pool: &SqlitePool, review: &BadcaseReview) -> Result<()> {
    let corrected = review
        .corrected_dimensions
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to serialize corrections: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO badcase_reviews (
            guid, question_identity, corrected_dimensions, corrected_average,
            reviewer, review_result, reviewed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(review.guid.to_string())
    .bind(&review.question_identity)
    .bind(corrected)
    .bind(review.corrected_average)
    .bind(&review.reviewer)
    .bind(review.review_result.as_str())
    .bind(review.reviewed_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load all review annotations for a question, newest first
pub async fn for_question(pool: &SqlitePool, question_identity: &str) -> Result<Vec<BadcaseReview>> {
    let rows = sqlx::query(
        r#"
        SELECT guid, question_identity, corrected_dimensions, corrected_average,
               reviewer, review_result, reviewed_at
        FROM badcase_reviews
        WHERE question_identity = ?
        ORDER BY reviewed_at DESC
        "#,
    )
    .bind(question_identity)
    .fetch_all(pool)
    .await?;

    let mut reviews = Vec::with_capacity(rows.len());
    for row in rows {
        let guid: String = row.get("guid");
        let guid = Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Invalid UUID in database: {}", e)))?;

        let corrected: Option<String> = row.get("corrected_dimensions");
        let corrected: Option<Vec<ScoreDimension>> = corrected
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| Error::Internal(format!("Invalid corrections in database: {}", e)))?;

        let result: String = row.get("review_result");
        let reviewed_at: String = row.get("reviewed_at");
        let reviewed_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&reviewed_at)
            .map_err(|e| Error::Internal(format!("Invalid reviewed_at in database: {}", e)))?
            .with_timezone(&Utc);

        reviews.push(BadcaseReview {
            guid,
            question_identity: row.get("question_identity"),
            corrected_dimensions: corrected,
            corrected_average: row.get("corrected_average"),
            reviewer: row.get("reviewer"),
            review_result: ReviewResult::parse(&result)?,
            reviewed_at,
        });
    }
    Ok(reviews)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn annotation_round_trips() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();

        let question = qvet_common::db::models::Question::from_record(
            &qvet_common::db::models::RawRecord {
                source_id: "p1".into(),
                recorded_at: Utc::now(),
                content: "Q1".into(),
                metadata: None,
            },
        );
        crate::db::questions::upsert_from_ingestion(&pool, &question)
            .await
            .unwrap();

        let review = BadcaseReview::new(
            question.identity.clone(),
            Some(vec![ScoreDimension {
                name: "accuracy".into(),
                value: 4.0,
            }]),
            "reviewer-1".into(),
            ReviewResult::Rejected,
        );
        insert(&pool, &review).await.unwrap();

        let loaded = for_question(&pool, &question.identity).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].guid, review.guid);
        assert_eq!(loaded[0].review_result, ReviewResult::Rejected);
        assert_eq!(loaded[0].corrected_average, Some(4.0));
    }
}
