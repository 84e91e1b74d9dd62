//! Windowed reads from the external ingestion source
//!
//! `raw_records` is owned by the upstream collector; this module only
//! reads it, bounded by a time window so no ingestion run rescans the
//! whole table.

use chrono::{DateTime, Utc};
use qvet_common::db::models::{RawRecord, TimeWindow};
use qvet_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Fetch raw records whose `recorded_at` falls within `[start, end)`
pub async fn fetch_window(pool: &SqlitePool, window: &TimeWindow) -> Result<Vec<RawRecord>> {
    // recorded_at is RFC3339 UTC text; lexicographic comparison matches
    // chronological order for this format
    let rows = sqlx::query(
        r#"
        SELECT source_id, recorded_at, content, metadata
        FROM raw_records
        WHERE recorded_at >= ? AND recorded_at < ?
        ORDER BY recorded_at ASC
        "#,
    )
    .bind(window.start.to_rfc3339())
    .bind(window.end.to_rfc3339())
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let recorded_at: String = row.get("recorded_at");
        let recorded_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(|e| Error::Internal(format!("Invalid recorded_at in raw_records: {}", e)))?
            .with_timezone(&Utc);

        records.push(RawRecord {
            source_id: row.get("source_id"),
            recorded_at,
            content: row.get("content"),
            metadata: row.get("metadata"),
        });
    }
    Ok(records)
}
