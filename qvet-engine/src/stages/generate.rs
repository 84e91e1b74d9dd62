//! Answer generation stage
//!
//! Generates one answer per required assistant variant for classified
//! questions, then advances them to `answers_generated`. The insert path
//! re-checks existence immediately before writing and treats a conflict as
//! a no-op success, so overlapping batch runs cannot double-generate.

use super::BatchOutcome;
use crate::client::{CapabilityError, CapabilityProvider};
use crate::db;
use qvet_common::db::models::{AssistantVariant, ProcessingStatus, Question};
use qvet_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Batch worker for the answer generation stage
pub struct GenerationStage {
    db: SqlitePool,
    capability: Arc<dyn CapabilityProvider>,
}

impl GenerationStage {
    pub fn new(db: SqlitePool, capability: Arc<dyn CapabilityProvider>) -> Self {
        Self { db, capability }
    }

    /// Generate answers for up to `limit` classified questions
    pub async fn run_batch(&self, limit: i64) -> Result<BatchOutcome> {
        let questions =
            db::questions::select_by_statuses(&self.db, &[ProcessingStatus::Classified], limit)
                .await?;

        debug!(selected = questions.len(), "Generation batch selected");
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

    /// Generate any missing variant answers for one question.
    ///
    /// Each variant's answer is committed independently; a partial run
    /// leaves the question in `classified` and the next run fills the
    /// remaining variants.
    async fn process_question(
        &self,
        question: &Question,
    ) -> std::result::Result<(), ItemFailure> {
        let mut transient_failure: Option<String> = None;

        for variant in AssistantVariant::ALL {
            // Cheap skip before calling out; the insert below re-checks
            if db::answers::exists(&self.db, &question.identity, variant).await? {
                continue;
            }

            match self
                .capability
                .generate(variant, &question.content, question.classification.as_deref())
                .await
            {
                Ok(answer) => {
                    let inserted = db::answers::insert_if_absent(
                        &self.db,
                        &question.identity,
                        variant,
                        &answer.text,
                    )
                    .await?;
                    if !inserted {
                        // A concurrent worker generated this variant while
                        // we were calling out; theirs stands
                        debug!(
                            identity = %question.identity,
                            variant = variant.as_str(),
                            "Answer already present, skipping as no-op"
                        );
                    }
                }
                Err(err @ CapabilityError::Auth(_)) => {
                    error!(
                        identity = %question.identity,
                        variant = variant.as_str(),
                        error = %err,
                        "Authentication failure, aborting batch"
                    );
                    return Err(ItemFailure::Systemic(Error::Internal(format!(
                        "capability authentication failed: {}",
                        err
                    ))));
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        identity = %question.identity,
                        variant = variant.as_str(),
                        error = %err,
                        "Generation failed transiently, variant left for next run"
                    );
                    transient_failure = Some(format!("{}: {}", variant.as_str(), err));
                }
                Err(err) => {
                    warn!(
                        identity = %question.identity,
                        variant = variant.as_str(),
                        error = %err,
                        "Generation failed permanently"
                    );
                    let message = format!("{}: {}", variant.as_str(), err);
                    db::questions::update_status_with_error(
                        &self.db,
                        &question.identity,
                        ProcessingStatus::AnswerGenerationFailed,
                        &message,
                    )
                    .await?;
                    return Err(ItemFailure::Recorded(message));
                }
            }
        }

        if let Some(message) = transient_failure {
            // Stay in `classified`; missing variants are retried next run
            db::questions::update_status_with_error(
                &self.db,
                &question.identity,
                ProcessingStatus::Classified,
                &message,
            )
            .await?;
            return Err(ItemFailure::Recorded(message));
        }

        db::questions::update_status(
            &self.db,
            &question.identity,
            ProcessingStatus::AnswersGenerated,
        )
        .await?;
        debug!(identity = %question.identity, "All variant answers generated");
        Ok(())
    }
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
