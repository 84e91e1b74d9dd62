//! Capability configuration resolution
//!
//! Multi-tier resolution with Database → ENV → TOML priority. The base
//! URL is required; the API key is optional (the capability service may
//! be unauthenticated in development).

use crate::client::CapabilityConfig;
use crate::db::settings;
use qvet_common::config::TomlConfig;
use qvet_common::{Error, Result};
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{info, warn};

/// Resolve the capability client configuration.
///
/// Endpoint and key follow Database → ENV → TOML priority; timeouts and
/// retry tunables come from the settings store with compiled defaults.
pub async fn resolve_capability_config(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<CapabilityConfig> {
    let base_url = resolve_base_url(db, toml_config).await?;
    let api_key = resolve_api_key(db, toml_config).await?;

    let timeout_ms = settings::get_i64(db, "capability_timeout_ms", 30_000).await?;
    let max_retries = settings::get_i64(db, "capability_max_retries", 3).await?;
    let base_delay_ms = settings::get_i64(db, "capability_base_delay_ms", 500).await?;
    let backoff_factor = settings::get_f64(db, "capability_backoff_factor", 2.0).await?;

    Ok(CapabilityConfig {
        base_url,
        api_key,
        timeout: Duration::from_millis(timeout_ms.max(1) as u64),
        max_retries: max_retries.max(0) as u32,
        base_delay: Duration::from_millis(base_delay_ms.max(1) as u64),
        backoff_factor,
    })
}

async fn resolve_base_url(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<String> {
    let db_url = non_empty(settings::get_string(db, "capability_api_url", "").await?);
    let env_url = std::env::var("QVET_CAPABILITY_URL").ok().and_then(non_empty);
    let toml_url = toml_config.capability_base_url.clone().and_then(non_empty);

    let sources: Vec<&str> = [
        db_url.as_ref().map(|_| "database"),
        env_url.as_ref().map(|_| "environment"),
        toml_url.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();
    if sources.len() > 1 {
        warn!(
            "Capability URL found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(url) = db_url {
        info!("Capability URL loaded from database");
        return Ok(url);
    }
    if let Some(url) = env_url {
        info!("Capability URL loaded from environment variable");
        return Ok(url);
    }
    if let Some(url) = toml_url {
        info!("Capability URL loaded from TOML config");
        return Ok(url);
    }

    Err(Error::Config(
        "Capability service URL not configured. Set one of:\n\
         1. settings key: capability_api_url\n\
         2. Environment: QVET_CAPABILITY_URL=http://host:port\n\
         3. TOML config: capability_base_url = \"http://host:port\""
            .to_string(),
    ))
}

async fn resolve_api_key(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<Option<String>> {
    if let Some(key) = non_empty(settings::get_string(db, "capability_api_key", "").await?) {
        info!("Capability API key loaded from database");
        return Ok(Some(key));
    }
    if let Some(key) = std::env::var("QVET_CAPABILITY_KEY").ok().and_then(non_empty) {
        info!("Capability API key loaded from environment variable");
        return Ok(Some(key));
    }
    if let Some(key) = toml_config.capability_api_key.clone().and_then(non_empty) {
        info!("Capability API key loaded from TOML config");
        return Ok(Some(key));
    }
    Ok(None)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        qvet_common::db::create_tables(&pool).await.unwrap();
        qvet_common::db::init_default_settings(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn database_setting_wins_over_toml() {
        let pool = setup_test_db().await;
        settings::set(&pool, "capability_api_url", "http://from-db:9100")
            .await
            .unwrap();

        let toml = TomlConfig {
            capability_base_url: Some("http://from-toml:9100".into()),
            ..Default::default()
        };
        let config = resolve_capability_config(&pool, &toml).await.unwrap();
        assert_eq!(config.base_url, "http://from-db:9100");
    }

    #[tokio::test]
    async fn toml_used_when_database_empty() {
        let pool = setup_test_db().await;
        let toml = TomlConfig {
            capability_base_url: Some("http://from-toml:9100".into()),
            capability_api_key: Some("secret".into()),
            ..Default::default()
        };

        let config = resolve_capability_config(&pool, &toml).await.unwrap();
        assert_eq!(config.base_url, "http://from-toml:9100");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let pool = setup_test_db().await;
        let err = resolve_capability_config(&pool, &TomlConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn retry_tunables_come_from_settings() {
        let pool = setup_test_db().await;
        settings::set(&pool, "capability_api_url", "http://localhost:9100")
            .await
            .unwrap();
        settings::set(&pool, "capability_max_retries", "5").await.unwrap();
        settings::set(&pool, "capability_base_delay_ms", "250").await.unwrap();

        let config = resolve_capability_config(&pool, &TomlConfig::default())
            .await
            .unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.backoff_factor, 2.0);
        assert_eq!(config.timeout, Duration::from_millis(30_000));
    }
}
