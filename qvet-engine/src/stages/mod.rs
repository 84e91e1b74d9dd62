//! Batch stage processors
//!
//! Each stage selects questions in its eligible status, processes them
//! one at a time with per-item error isolation, and commits each item's
//! result independently. Transient capability errors leave an item in a
//! retryable status for the next run; validation errors mark it
//! permanently failed; systemic storage errors abort the batch and
//! propagate to the orchestrator.

pub mod classify;
pub mod generate;
pub mod score;

pub use classify::ClassificationStage;
pub use generate::GenerationStage;
pub use score::ScoringStage;

use qvet_common::Result;
use sqlx::SqlitePool;

/// Per-item failure detail carried in the batch result
#[derive(Debug, Clone)]
pub struct ItemError {
    pub identity: String,
    pub message: String,
}

/// Aggregate result of one batch operation
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

impl BatchOutcome {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, identity: &str, message: String) {
        self.processed += 1;
        self.failed += 1;
        self.errors.push(ItemError {
            identity: identity.to_string(),
            message,
        });
    }

    /// One-line summary for phase messages and logs
    pub fn summary(&self) -> String {
        format!(
            "processed {}, succeeded {}, failed {}",
            self.processed, self.succeeded, self.failed
        )
    }
}

/// Batch size limit from the settings store
pub(crate) async fn configured_batch_size(pool: &SqlitePool) -> Result<i64> {
    crate::db::settings::get_i64(pool, "stage_batch_size", 50).await
}
