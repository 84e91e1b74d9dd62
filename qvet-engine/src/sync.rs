//! Dedup/ingestion engine
//!
//! Reads raw records from the external source within a bounded time
//! window, computes each record's content identity, and upserts canonical
//! questions. Re-running over overlapping windows creates no duplicates
//! and never regresses a question that has already advanced through the
//! pipeline.

use crate::db;
use qvet_common::db::models::{Question, RawRecord, TimeWindow};
use qvet_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Aggregate result of one ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Questions newly created by this run
    pub ingested: usize,
    /// Records already known (or outside the window) and left untouched
    pub skipped: usize,
}

/// Ingestion engine over the canonical question store
pub struct SyncEngine {
    db: SqlitePool,
}

impl SyncEngine {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Fetch the window from the external source and ingest it
    pub async fn run_window(&self, window: &TimeWindow) -> Result<IngestOutcome> {
        let records = db::raw::fetch_window(&self.db, window).await?;
        debug!(
            records = records.len(),
            start = %window.start,
            end = %window.end,
            "Fetched raw records for ingestion window"
        );
        self.ingest(&records, window).await
    }

    /// Deduplicate and upsert a batch of raw records.
    ///
    /// Records outside `window` are skipped so a caller handing in a
    /// wider batch cannot widen the blast radius of one run. Idempotent:
    /// the identity primary key absorbs overlapping and concurrent runs.
    pub async fn ingest(&self, records: &[RawRecord], window: &TimeWindow) -> Result<IngestOutcome> {
        let mut outcome = IngestOutcome::default();

        for record in records {
            if !window.contains(record.recorded_at) {
                debug!(
                    source_id = %record.source_id,
                    recorded_at = %record.recorded_at,
                    "Record outside ingestion window, skipping"
                );
                outcome.skipped += 1;
                continue;
            }

            let question = Question::from_record(record);
            let created = db::questions::upsert_from_ingestion(&self.db, &question).await?;
            if created {
                debug!(identity = %question.identity, source_id = %record.source_id, "Question created");
                outcome.ingested += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        info!(
            ingested = outcome.ingested,
            skipped = outcome.skipped,
            "Ingestion run complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use qvet_common::db::models::{ProcessingStatus, Question};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(source_id: &str, recorded_at: &str, content: &str) -> RawRecord {
        RawRecord {
            source_id: source_id.to_string(),
            recorded_at: ts(recorded_at),
            content: content.to_string(),
            metadata: None,
        }
    }

    fn day_window() -> TimeWindow {
        TimeWindow::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z"))
    }

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn ingest_twice_yields_one_question() {
        let pool = setup_test_db().await;
        let engine = SyncEngine::new(pool.clone());
        let records = vec![record("p1", "2024-01-01T00:00:00Z", "Q1")];

        let first = engine.ingest(&records, &day_window()).await.unwrap();
        let second = engine.ingest(&records, &day_window()).await.unwrap();

        assert_eq!(first, IngestOutcome { ingested: 1, skipped: 0 });
        assert_eq!(second, IngestOutcome { ingested: 0, skipped: 1 });

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM questions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn reingest_does_not_regress_status() {
        let pool = setup_test_db().await;
        let engine = SyncEngine::new(pool.clone());
        let records = vec![record("p1", "2024-01-01T00:00:00Z", "Q1")];
        engine.ingest(&records, &day_window()).await.unwrap();

        let identity = Question::identity_of("p1", ts("2024-01-01T00:00:00Z"), "Q1");
        crate::db::questions::set_classification(&pool, &identity, "math")
            .await
            .unwrap();

        engine.ingest(&records, &day_window()).await.unwrap();

        let question = crate::db::questions::load_required(&pool, &identity)
            .await
            .unwrap();
        assert_eq!(question.processing_status, ProcessingStatus::Classified);
        assert_eq!(question.classification.as_deref(), Some("math"));
    }

    #[tokio::test]
    async fn records_outside_window_are_skipped() {
        let pool = setup_test_db().await;
        let engine = SyncEngine::new(pool.clone());
        let records = vec![
            record("p1", "2024-01-01T10:00:00Z", "inside"),
            record("p1", "2024-01-05T10:00:00Z", "outside"),
        ];

        let outcome = engine.ingest(&records, &day_window()).await.unwrap();
        assert_eq!(outcome, IngestOutcome { ingested: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn run_window_reads_from_source_table() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO raw_records (source_id, recorded_at, content) VALUES ('p1', ?, 'Q1')")
            .bind(ts("2024-01-01T10:00:00Z").to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();

        let engine = SyncEngine::new(pool.clone());
        let outcome = engine.run_window(&day_window()).await.unwrap();
        assert_eq!(outcome.ingested, 1);
    }

    #[tokio::test]
    async fn same_content_different_source_is_distinct() {
        let pool = setup_test_db().await;
        let engine = SyncEngine::new(pool.clone());
        let records = vec![
            record("p1", "2024-01-01T00:00:00Z", "Q1"),
            record("p2", "2024-01-01T00:00:00Z", "Q1"),
        ];

        let outcome = engine.ingest(&records, &day_window()).await.unwrap();
        assert_eq!(outcome.ingested, 2);
    }
}
