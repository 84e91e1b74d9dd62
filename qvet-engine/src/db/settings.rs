//! Settings store accessor
//!
//! The key-value config store is an external collaborator; the pipeline
//! consumes it through `get_*` with compiled defaults and writes only via
//! `set`. Scheduled/delayed value changes are the store's own feature and
//! are not reimplemented here.

use qvet_common::Result;
use sqlx::SqlitePool;
use tracing::warn;

/// Read a string setting, falling back to `default` when absent or NULL
pub async fn get_string(pool: &SqlitePool, key: &str, default: &str) -> Result<String> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten().unwrap_or_else(|| default.to_string()))
}

/// Read a float setting; unparseable values fall back to `default`
pub async fn get_f64(pool: &SqlitePool, key: &str, default: f64) -> Result<f64> {
    let raw = get_string(pool, key, "").await?;
    if raw.is_empty() {
        return Ok(default);
    }
    match raw.parse::<f64>() {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(key, value = %raw, "Setting is not a number, using default {}", default);
            Ok(default)
        }
    }
}

/// Read an integer setting; unparseable values fall back to `default`
pub async fn get_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    let raw = get_string(pool, key, "").await?;
    if raw.is_empty() {
        return Ok(default);
    }
    match raw.parse::<i64>() {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(key, value = %raw, "Setting is not an integer, using default {}", default);
            Ok(default)
        }
    }
}

/// Write a setting
pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn missing_key_returns_default() {
        let pool = setup_test_db().await;
        assert_eq!(get_f64(&pool, "badcase_score_threshold", 2.5).await.unwrap(), 2.5);
        assert_eq!(get_i64(&pool, "stage_batch_size", 50).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn set_then_get() {
        let pool = setup_test_db().await;
        set(&pool, "badcase_score_threshold", "3.5").await.unwrap();
        assert_eq!(get_f64(&pool, "badcase_score_threshold", 2.5).await.unwrap(), 3.5);

        set(&pool, "badcase_score_threshold", "1.5").await.unwrap();
        assert_eq!(get_f64(&pool, "badcase_score_threshold", 2.5).await.unwrap(), 1.5);
    }

    #[tokio::test]
    async fn garbage_value_falls_back_to_default() {
        let pool = setup_test_db().await;
        set(&pool, "stage_batch_size", "many").await.unwrap();
        assert_eq!(get_i64(&pool, "stage_batch_size", 50).await.unwrap(), 50);
    }
}
