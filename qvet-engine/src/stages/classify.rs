//! Classification stage
//!
//! Advances questions `pending → classifying → classified`, or
//! `classification_failed` on non-retryable capability errors.

use super::BatchOutcome;
use crate::client::{CapabilityError, CapabilityProvider};
use crate::db;
use qvet_common::db::models::ProcessingStatus;
use qvet_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Batch worker for the classification stage
pub struct ClassificationStage {
    db: SqlitePool,
    capability: Arc<dyn CapabilityProvider>,
}

impl ClassificationStage {
    pub fn new(db: SqlitePool, capability: Arc<dyn CapabilityProvider>) -> Self {
        Self { db, capability }
    }

    /// Classify up to `limit` eligible questions.
    ///
    /// Also re-selects rows stranded in `classifying` by an interrupted
    /// run. One item's failure never aborts the batch; an authentication
    /// failure does, since no further call through this client can
    /// succeed.
    pub async fn run_batch(&self, limit: i64) -> Result<BatchOutcome> {
        let questions = db::questions::select_by_statuses(
            &self.db,
            &[ProcessingStatus::Pending, ProcessingStatus::Classifying],
            limit,
        )
        .await?;

        debug!(selected = questions.len(), "Classification batch selected");
        let mut outcome = BatchOutcome::default();

        for question in questions {
            db::questions::update_status(&self.db, &question.identity, ProcessingStatus::Classifying)
                .await?;

            match self
                .capability
                .classify(&question.content, question.metadata.as_deref())
                .await
            {
                Ok(classification) => {
                    db::questions::set_classification(
                        &self.db,
                        &question.identity,
                        &classification.category,
                    )
                    .await?;
                    debug!(
                        identity = %question.identity,
                        category = %classification.category,
                        "Question classified"
                    );
                    outcome.record_success();
                }
                Err(err @ CapabilityError::Auth(_)) => {
                    // Fatal to the client instance: restore the item and
                    // surface the remainder of the batch as a hard failure
                    db::questions::update_status(
                        &self.db,
                        &question.identity,
                        ProcessingStatus::Pending,
                    )
                    .await?;
                    error!(identity = %question.identity, error = %err, "Authentication failure, aborting batch");
                    return Err(Error::Internal(format!(
                        "capability authentication failed: {}",
                        err
                    )));
                }
                Err(err) if err.is_transient() => {
                    db::questions::update_status_with_error(
                        &self.db,
                        &question.identity,
                        ProcessingStatus::Pending,
                        &err.to_string(),
                    )
                    .await?;
                    warn!(identity = %question.identity, error = %err, "Classification failed transiently, will retry next run");
                    outcome.record_failure(&question.identity, err.to_string());
                }
                Err(err) => {
                    db::questions::update_status_with_error(
                        &self.db,
                        &question.identity,
                        ProcessingStatus::ClassificationFailed,
                        &err.to_string(),
                    )
                    .await?;
                    warn!(identity = %question.identity, error = %err, "Classification failed permanently");
                    outcome.record_failure(&question.identity, err.to_string());
                }
            }
        }

        Ok(outcome)
    }
}
