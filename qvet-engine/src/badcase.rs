//! Badcase detection and review
//!
//! After a question is fully scored, the detector compares the baseline
//! assistant's score against a configurable per-dimension threshold and
//! flags the question when any dimension falls strictly below it. A small
//! review sub-state-machine lets a human confirm or reject the detection;
//! rejections carry corrected values stored as an annotation beside the
//! original score, which is never modified.

use crate::db;
use chrono::Utc;
use qvet_common::db::models::{
    AssistantVariant, BadcaseDetail, BadcaseReview, ReviewResult, ReviewStatus, ScoreDimension,
};
use qvet_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Settings key for the per-dimension detection threshold
pub const THRESHOLD_KEY: &str = "badcase_score_threshold";

/// Threshold used when the config store has no value
pub const DEFAULT_THRESHOLD: f64 = 2.5;

/// Threshold-based badcase detector
pub struct BadcaseDetector {
    db: SqlitePool,
}

impl BadcaseDetector {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Evaluate one scored question; returns the resulting badcase flag.
    ///
    /// Dimensions of the baseline score strictly below the threshold form
    /// the low-score list. Detection state is only written on transitions:
    /// false→true records a snapshot and opens a review cycle, true→false
    /// (after a rescoring run improves the score) clears the snapshot and
    /// resets the review cycle.
    pub async fn detect(&self, identity: &str) -> Result<bool> {
        let question = db::questions::load_required(&self.db, identity).await?;

        let score =
            db::scores::for_question_variant(&self.db, identity, AssistantVariant::Baseline)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("baseline score for question {}", identity))
                })?;

        let threshold = db::settings::get_f64(&self.db, THRESHOLD_KEY, DEFAULT_THRESHOLD).await?;

        let low_score_dimensions: Vec<String> = score
            .dimensions
            .iter()
            .filter(|d| d.value < threshold)
            .map(|d| d.name.clone())
            .collect();
        let is_badcase = !low_score_dimensions.is_empty();

        match (question.is_badcase, is_badcase) {
            (false, true) => {
                let detail = BadcaseDetail {
                    low_score_dimensions: low_score_dimensions.clone(),
                    threshold,
                    detected_at: Utc::now(),
                };
                let detail = serde_json::to_string(&detail)
                    .map_err(|e| Error::Internal(format!("Failed to serialize detail: {}", e)))?;
                db::questions::set_badcase_state(
                    &self.db,
                    identity,
                    true,
                    ReviewStatus::Pending,
                    Some(&detail),
                )
                .await?;
                info!(
                    identity,
                    threshold,
                    low_dimensions = ?low_score_dimensions,
                    "Question flagged as badcase"
                );
            }
            (true, false) => {
                db::questions::set_badcase_state(
                    &self.db,
                    identity,
                    false,
                    ReviewStatus::Pending,
                    None,
                )
                .await?;
                info!(identity, "Badcase flag cleared after rescoring");
            }
            _ => {
                debug!(identity, is_badcase, "Badcase state unchanged");
            }
        }

        Ok(is_badcase)
    }

    /// Apply a human review to a flagged question.
    ///
    /// `Confirmed` keeps the flag and closes the review cycle. `Rejected`
    /// requires corrected dimension values, clears the flag, and stores the
    /// corrections as an annotation; the original score stays untouched.
    pub async fn review(
        &self,
        identity: &str,
        corrected: Option<Vec<ScoreDimension>>,
        result: ReviewResult,
        reviewer: &str,
    ) -> Result<BadcaseReview> {
        let question = db::questions::load_required(&self.db, identity).await?;
        if !question.is_badcase {
            return Err(Error::InvalidInput(format!(
                "question {} is not flagged as badcase",
                identity
            )));
        }

        match result {
            ReviewResult::Confirmed => {
                db::questions::set_badcase_state(
                    &self.db,
                    identity,
                    true,
                    ReviewStatus::Reviewed,
                    question.badcase_detail.as_deref(),
                )
                .await?;
            }
            ReviewResult::Rejected => {
                if corrected.as_ref().map_or(true, |c| c.is_empty()) {
                    return Err(Error::InvalidInput(
                        "rejected review requires corrected dimension values".to_string(),
                    ));
                }
                // The detection snapshot stays in place as the record of
                // what was rejected
                db::questions::set_badcase_state(
                    &self.db,
                    identity,
                    false,
                    ReviewStatus::Reviewed,
                    question.badcase_detail.as_deref(),
                )
                .await?;
            }
        }

        let review = BadcaseReview::new(
            identity.to_string(),
            corrected,
            reviewer.to_string(),
            result,
        );
        db::reviews::insert(&self.db, &review).await?;

        info!(
            identity,
            reviewer,
            result = result.as_str(),
            "Badcase review recorded"
        );
        Ok(review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvet_common::db::models::{Question, RawRecord, Score};

    async fn setup_question() -> (SqlitePool, String) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();

        let question = Question::from_record(&RawRecord {
            source_id: "p1".into(),
            recorded_at: Utc::now(),
            content: "Q1".into(),
            metadata: None,
        });
        db::questions::upsert_from_ingestion(&pool, &question)
            .await
            .unwrap();
        (pool, question.identity)
    }

    async fn insert_baseline_score(pool: &SqlitePool, identity: &str, dims: &[(&str, f64)]) {
        let dimensions: Vec<ScoreDimension> = dims
            .iter()
            .map(|(name, value)| ScoreDimension {
                name: name.to_string(),
                value: *value,
            })
            .collect();
        let score = Score {
            question_identity: identity.to_string(),
            variant: AssistantVariant::Baseline,
            average_value: Score::average_of(&dimensions),
            dimensions,
            rationale: String::new(),
            rated_at: Utc::now(),
        };
        db::scores::insert_if_absent(pool, &score).await.unwrap();
    }

    #[tokio::test]
    async fn low_dimension_flags_badcase_with_snapshot() {
        let (pool, identity) = setup_question().await;
        insert_baseline_score(&pool, &identity, &[("accuracy", 2.0), ("fluency", 4.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        assert!(detector.detect(&identity).await.unwrap());

        let question = db::questions::load_required(&pool, &identity).await.unwrap();
        assert!(question.is_badcase);
        assert_eq!(question.badcase_review_status, ReviewStatus::Pending);

        let detail: BadcaseDetail =
            serde_json::from_str(question.badcase_detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail.low_score_dimensions, vec!["accuracy"]);
        assert_eq!(detail.threshold, DEFAULT_THRESHOLD);
    }

    #[tokio::test]
    async fn all_dimensions_at_or_above_threshold_is_not_badcase() {
        let (pool, identity) = setup_question().await;
        // 2.5 equals the default threshold; comparison is strict
        insert_baseline_score(&pool, &identity, &[("accuracy", 2.5), ("fluency", 5.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        assert!(!detector.detect(&identity).await.unwrap());

        let question = db::questions::load_required(&pool, &identity).await.unwrap();
        assert!(!question.is_badcase);
        assert!(question.badcase_detail.is_none());
    }

    #[tokio::test]
    async fn threshold_is_read_from_settings() {
        let (pool, identity) = setup_question().await;
        insert_baseline_score(&pool, &identity, &[("accuracy", 3.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        assert!(!detector.detect(&identity).await.unwrap());

        // Raising the threshold grows the flagged set
        db::settings::set(&pool, THRESHOLD_KEY, "3.5").await.unwrap();
        assert!(detector.detect(&identity).await.unwrap());

        // Lowering it back shrinks the set again
        db::settings::set(&pool, THRESHOLD_KEY, "2.0").await.unwrap();
        assert!(!detector.detect(&identity).await.unwrap());
    }

    #[tokio::test]
    async fn confirm_keeps_flag_and_closes_review() {
        let (pool, identity) = setup_question().await;
        insert_baseline_score(&pool, &identity, &[("accuracy", 1.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        detector.detect(&identity).await.unwrap();
        detector
            .review(&identity, None, ReviewResult::Confirmed, "reviewer-1")
            .await
            .unwrap();

        let question = db::questions::load_required(&pool, &identity).await.unwrap();
        assert!(question.is_badcase);
        assert_eq!(question.badcase_review_status, ReviewStatus::Reviewed);
    }

    #[tokio::test]
    async fn reject_requires_corrections_and_preserves_original_score() {
        let (pool, identity) = setup_question().await;
        insert_baseline_score(&pool, &identity, &[("accuracy", 1.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        detector.detect(&identity).await.unwrap();

        // Rejection without corrections is invalid
        let err = detector
            .review(&identity, None, ReviewResult::Rejected, "reviewer-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let before =
            db::scores::for_question_variant(&pool, &identity, AssistantVariant::Baseline)
                .await
                .unwrap()
                .unwrap();

        detector
            .review(
                &identity,
                Some(vec![ScoreDimension {
                    name: "accuracy".into(),
                    value: 4.0,
                }]),
                ReviewResult::Rejected,
                "reviewer-1",
            )
            .await
            .unwrap();

        let question = db::questions::load_required(&pool, &identity).await.unwrap();
        assert!(!question.is_badcase);
        assert_eq!(question.badcase_review_status, ReviewStatus::Reviewed);

        // Original score is byte-identical
        let after =
            db::scores::for_question_variant(&pool, &identity, AssistantVariant::Baseline)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(after.dimensions, before.dimensions);
        assert_eq!(after.average_value, before.average_value);
        assert_eq!(after.rated_at, before.rated_at);

        // Corrections live in the annotation
        let reviews = db::reviews::for_question(&pool, &identity).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].corrected_average, Some(4.0));
    }

    #[tokio::test]
    async fn review_of_unflagged_question_is_rejected() {
        let (pool, identity) = setup_question().await;
        let detector = BadcaseDetector::new(pool.clone());

        let err = detector
            .review(&identity, None, ReviewResult::Confirmed, "reviewer-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn improved_rescore_clears_flag() {
        let (pool, identity) = setup_question().await;
        insert_baseline_score(&pool, &identity, &[("accuracy", 1.0)]).await;

        let detector = BadcaseDetector::new(pool.clone());
        assert!(detector.detect(&identity).await.unwrap());

        // Simulate a rescoring run replacing the score row
        sqlx::query("DELETE FROM scores WHERE question_identity = ?")
            .bind(&identity)
            .execute(&pool)
            .await
            .unwrap();
        insert_baseline_score(&pool, &identity, &[("accuracy", 5.0)]).await;

        assert!(!detector.detect(&identity).await.unwrap());
        let question = db::questions::load_required(&pool, &identity).await.unwrap();
        assert!(!question.is_badcase);
        assert!(question.badcase_detail.is_none());
        assert_eq!(question.badcase_review_status, ReviewStatus::Pending);
    }
}
