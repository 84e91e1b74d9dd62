//! Scoring stage
//!
//! Scores each question's candidate answers in a single capability call
//! once every required variant has an answer. Results are matched back to
//! stored answers by variant name; unmatched results are discarded and
//! missing results leave those answers unscored for the next run. When the
//! last variant is scored the question flips to `scored` and badcase
//! detection runs synchronously so the flag always reflects the latest
//! scores.

use super::BatchOutcome;
use crate::badcase::BadcaseDetector;
use crate::client::{CapabilityError, CapabilityProvider, ScoreRequest};
use crate::db;
use chrono::Utc;
use qvet_common::db::models::{
    Answer, AssistantVariant, ProcessingStatus, Question, Score, ScoreDimension,
    MAX_SCORE_DIMENSIONS,
};
use qvet_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Batch worker for the scoring stage
pub struct ScoringStage {
    db: SqlitePool,
    capability: Arc<dyn CapabilityProvider>,
    detector: BadcaseDetector,
}

impl ScoringStage {
    pub fn new(db: SqlitePool, capability: Arc<dyn CapabilityProvider>) -> Self {
        let detector = BadcaseDetector::new(db.clone());
        Self {
            db,
            capability,
            detector,
        }
    }

    /// Score up to `limit` eligible questions.
    ///
    /// Also re-selects rows stranded in `scoring` by an interrupted run;
    /// those either finalize directly (everything already scored) or go
    /// back through the capability for their unscored variants.
    pub async fn run_batch(&self, limit: i64) -> Result<BatchOutcome> {
        let questions = db::questions::select_by_statuses(
            &self.db,
            &[ProcessingStatus::AnswersGenerated, ProcessingStatus::Scoring],
            limit,
        )
        .await?;

        debug!(selected = questions.len(), "Scoring batch selected");
        let mut outcome = BatchOutcome::default();

        for question in questions {
            match self.process_question(&question).await {
                Ok(()) => outcome.record_success(),
                Err(ItemFailure::Recorded(message)) => {
                    outcome.record_failure(&question.identity, message)
                }
                Err(ItemFailure::Systemic(err)) => return Err(err),
            }
        }

        Ok(outcome)
    }

    async fn process_question(&self, question: &Question) -> std::result::Result<(), ItemFailure> {
        let answers = db::answers::for_question(&self.db, &question.identity).await?;

        // Gating: every required variant must have an answer before any
        // capability call is made
        let missing: Vec<&str> = AssistantVariant::ALL
            .iter()
            .filter(|v| !answers.iter().any(|a| a.variant == **v))
            .map(|v| v.as_str())
            .collect();
        if !missing.is_empty() {
            let message = format!("answers missing for variants: {}", missing.join(", "));
            warn!(identity = %question.identity, %message, "Question not ready for scoring, returning to generation");
            db::questions::update_status_with_error(
                &self.db,
                &question.identity,
                ProcessingStatus::Classified,
                &message,
            )
            .await?;
            return Err(ItemFailure::Recorded(message));
        }

        let unscored: Vec<&Answer> = answers.iter().filter(|a| !a.is_scored).collect();
        if unscored.is_empty() {
            // Stale `scoring` row from an interrupted run; just finalize
            return self.finalize(question).await;
        }

        db::questions::update_status(&self.db, &question.identity, ProcessingStatus::Scoring)
            .await?;

        let candidates: BTreeMap<String, String> = unscored
            .iter()
            .map(|a| (a.variant.as_str().to_string(), a.text.clone()))
            .collect();
        let request = ScoreRequest {
            content: question.content.clone(),
            candidates,
            classification: question.classification.clone().unwrap_or_default(),
        };

        let results = match self.capability.score(&request).await {
            Ok(results) => results,
            Err(err @ CapabilityError::Auth(_)) => {
                db::questions::update_status(
                    &self.db,
                    &question.identity,
                    ProcessingStatus::AnswersGenerated,
                )
                .await?;
                error!(identity = %question.identity, error = %err, "Authentication failure, aborting batch");
                return Err(ItemFailure::Systemic(Error::Internal(format!(
                    "capability authentication failed: {}",
                    err
                ))));
            }
            Err(err) => {
                db::questions::update_status_with_error(
                    &self.db,
                    &question.identity,
                    ProcessingStatus::AnswersGenerated,
                    &err.to_string(),
                )
                .await?;
                warn!(identity = %question.identity, error = %err, "Scoring call failed, question left for next run");
                return Err(ItemFailure::Recorded(err.to_string()));
            }
        };

        // Match results back to stored answers by variant name
        for result in results {
            let variant = match AssistantVariant::parse(&result.variant) {
                Ok(variant) => variant,
                Err(_) => {
                    warn!(
                        identity = %question.identity,
                        variant = %result.variant,
                        "Discarding score for unknown variant"
                    );
                    continue;
                }
            };
            if !unscored.iter().any(|a| a.variant == variant) {
                warn!(
                    identity = %question.identity,
                    variant = variant.as_str(),
                    "Discarding score for variant that was not a candidate"
                );
                continue;
            }

            let dimensions = normalize_dimensions(result.dimensions);
            if dimensions.is_empty() {
                warn!(
                    identity = %question.identity,
                    variant = variant.as_str(),
                    "Discarding score with no dimensions"
                );
                continue;
            }

            let score = Score {
                question_identity: question.identity.clone(),
                variant,
                average_value: Score::average_of(&dimensions),
                dimensions,
                rationale: result.rationale,
                rated_at: Utc::now(),
            };
            // A concurrent run may have scored this variant already; the
            // existing row stands either way
            db::scores::insert_if_absent(&self.db, &score).await?;
            db::answers::mark_scored(&self.db, &question.identity, variant).await?;
        }

        // Completion check: scored only when every required variant is
        let answers = db::answers::for_question(&self.db, &question.identity).await?;
        let left: Vec<&str> = answers
            .iter()
            .filter(|a| !a.is_scored)
            .map(|a| a.variant.as_str())
            .collect();

        if left.is_empty() {
            self.finalize(question).await
        } else {
            let message = format!("variants left unscored: {}", left.join(", "));
            warn!(identity = %question.identity, %message, "Partial scoring, question left for next run");
            db::questions::update_status_with_error(
                &self.db,
                &question.identity,
                ProcessingStatus::AnswersGenerated,
                &message,
            )
            .await?;
            Err(ItemFailure::Recorded(message))
        }
    }

    /// Flip to `scored` and run badcase detection in the same item step
    async fn finalize(&self, question: &Question) -> std::result::Result<(), ItemFailure> {
        db::questions::update_status(&self.db, &question.identity, ProcessingStatus::Scored)
            .await?;
        let is_badcase = self.detector.detect(&question.identity).await?;
        debug!(identity = %question.identity, is_badcase, "Question fully scored");
        Ok(())
    }
}

/// Clamp dimension values into [1, 5] and keep only the first
/// [`MAX_SCORE_DIMENSIONS`] entries, preserving order
fn normalize_dimensions(dimensions: Vec<ScoreDimension>) -> Vec<ScoreDimension> {
    dimensions
        .into_iter()
        .take(MAX_SCORE_DIMENSIONS)
        .map(|d| {
            let clamped = d.value.clamp(1.0, 5.0);
            if clamped != d.value {
                warn!(name = %d.name, value = d.value, "Dimension value outside [1, 5], clamping");
            }
            ScoreDimension {
                name: d.name,
                value: clamped,
            }
        })
        .collect()
}

/// Distinguishes recorded per-item failures from batch-aborting ones
enum ItemFailure {
    Recorded(String),
    Systemic(Error),
}

impl From<Error> for ItemFailure {
    fn from(err: Error) -> Self {
        ItemFailure::Systemic(err)
    }
}
