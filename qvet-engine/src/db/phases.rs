//! Workflow phase state persistence

use crate::workflow::phase::{PhaseId, PhaseState, PhaseStatus};
use chrono::{DateTime, Utc};
use qvet_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// Seed one row per phase if missing.
///
/// `depends_on` and `auto_continue` come from the compiled DAG; existing
/// rows keep their operator-set status (e.g. Disabled) across restarts.
pub async fn init_phases(pool: &SqlitePool) -> Result<()> {
    for phase in PhaseId::ALL {
        let depends_on: Vec<&str> = phase.depends_on().iter().map(|p| p.as_str()).collect();
        let depends_on = serde_json::to_string(&depends_on)
            .map_err(|e| Error::Internal(format!("Failed to serialize depends_on: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_phases (phase, status, depends_on, auto_continue)
            VALUES (?, 'pending', ?, ?)
            ON CONFLICT(phase) DO UPDATE SET
                depends_on = excluded.depends_on,
                auto_continue = excluded.auto_continue
            "#,
        )
        .bind(phase.as_str())
        .bind(&depends_on)
        .bind(phase.auto_continue() as i64)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Load one phase's state
pub async fn load(pool: &SqlitePool, phase: PhaseId) -> Result<PhaseState> {
    let row = sqlx::query(
        r#"
        SELECT phase, status, depends_on, auto_continue, success_count, failure_count,
               last_message, last_run_at
        FROM workflow_phases
        WHERE phase = ?
        "#,
    )
    .bind(phase.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("workflow phase {}", phase.as_str())))?;

    row_to_state(row)
}

/// Load all phases in DAG order
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<PhaseState>> {
    let mut states = Vec::with_capacity(PhaseId::ALL.len());
    for phase in PhaseId::ALL {
        states.push(load(pool, phase).await?);
    }
    Ok(states)
}

/// Transition a phase to Running
pub async fn mark_running(pool: &SqlitePool, phase: PhaseId) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE workflow_phases
        SET status = 'running', last_run_at = ?
        WHERE phase = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(phase.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a terminal phase result, updating the matching counter
pub async fn mark_finished(
    pool: &SqlitePool,
    phase: PhaseId,
    status: PhaseStatus,
    message: &str,
) -> Result<()> {
    debug_assert!(matches!(status, PhaseStatus::Success | PhaseStatus::Failed));
    let success = status == PhaseStatus::Success;
    sqlx::query(
        r#"
        UPDATE workflow_phases
        SET status = ?,
            success_count = success_count + ?,
            failure_count = failure_count + ?,
            last_message = ?
        WHERE phase = ?
        "#,
    )
    .bind(status.as_str())
    .bind(success as i64)
    .bind(!success as i64)
    .bind(message)
    .bind(phase.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Enable or disable a phase (operator action)
pub async fn set_enabled(pool: &SqlitePool, phase: PhaseId, enabled: bool) -> Result<()> {
    let status = if enabled {
        PhaseStatus::Pending
    } else {
        PhaseStatus::Disabled
    };
    sqlx::query("UPDATE workflow_phases SET status = ? WHERE phase = ?")
        .bind(status.as_str())
        .bind(phase.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_state(row: sqlx::sqlite::SqliteRow) -> Result<PhaseState> {
    let phase: String = row.get("phase");
    let status: String = row.get("status");
    let depends_on: String = row.get("depends_on");
    let depends_on: Vec<String> = serde_json::from_str(&depends_on)
        .map_err(|e| Error::Internal(format!("Invalid depends_on in database: {}", e)))?;
    let depends_on = depends_on
        .iter()
        .map(|s| PhaseId::parse(s))
        .collect::<Result<Vec<_>>>()?;

    let auto_continue: i64 = row.get("auto_continue");
    let last_run_at: Option<String> = row.get("last_run_at");
    let last_run_at: Option<DateTime<Utc>> = last_run_at
        .map(|s| DateTime::parse_from_rfc3339(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Invalid last_run_at in database: {}", e)))?
        .map(|dt| dt.with_timezone(&Utc));

    Ok(PhaseState {
        phase: PhaseId::parse(&phase)?,
        status: PhaseStatus::parse(&status)?,
        depends_on,
        auto_continue: auto_continue != 0,
        success_count: row.get("success_count"),
        failure_count: row.get("failure_count"),
        last_message: row.get("last_message"),
        last_run_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();
        init_phases(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn init_seeds_all_phases_once() {
        let pool = setup_test_db().await;
        // Second init is a no-op for status
        mark_finished(&pool, PhaseId::Sync, PhaseStatus::Success, "ok").await.unwrap();
        init_phases(&pool).await.unwrap();

        let states = load_all(&pool).await.unwrap();
        assert_eq!(states.len(), 5);
        assert_eq!(states[0].status, PhaseStatus::Success);
        assert_eq!(states[1].status, PhaseStatus::Pending);
        assert_eq!(states[1].depends_on, vec![PhaseId::Sync]);
        assert!(!states[4].auto_continue);
    }

    #[tokio::test]
    async fn counters_track_terminal_results() {
        let pool = setup_test_db().await;

        mark_running(&pool, PhaseId::Sync).await.unwrap();
        mark_finished(&pool, PhaseId::Sync, PhaseStatus::Success, "ingested 3").await.unwrap();
        mark_running(&pool, PhaseId::Sync).await.unwrap();
        mark_finished(&pool, PhaseId::Sync, PhaseStatus::Failed, "storage unreachable")
            .await
            .unwrap();

        let state = load(&pool, PhaseId::Sync).await.unwrap();
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 1);
        assert_eq!(state.status, PhaseStatus::Failed);
        assert_eq!(state.last_message.as_deref(), Some("storage unreachable"));
        assert!(state.last_run_at.is_some());
    }

    #[tokio::test]
    async fn disable_and_reenable() {
        let pool = setup_test_db().await;

        set_enabled(&pool, PhaseId::Classification, false).await.unwrap();
        let state = load(&pool, PhaseId::Classification).await.unwrap();
        assert_eq!(state.status, PhaseStatus::Disabled);

        set_enabled(&pool, PhaseId::Classification, true).await.unwrap();
        let state = load(&pool, PhaseId::Classification).await.unwrap();
        assert_eq!(state.status, PhaseStatus::Pending);
    }
}
