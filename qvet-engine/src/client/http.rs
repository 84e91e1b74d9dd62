//! HTTP capability client
//!
//! Talks to the capability service over three POST endpoints:
//! `/v1/classify`, `/v1/generate`, `/v1/score`. Transient failures
//! (connect, timeout, 5xx, 429) are retried with exponential backoff up to
//! `max_retries`; 429 honors a server-specified `Retry-After`. Other 4xx
//! and undecodable bodies fail immediately.

use super::{
    CapabilityError, CapabilityProvider, Classification, ClientStats, GeneratedAnswer,
    ScoreRequest, VariantScore,
};
use async_trait::async_trait;
use qvet_common::db::models::{AssistantVariant, ScoreDimension};
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Capability client configuration
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Retries after the first attempt; transient errors only
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9100".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
        }
    }
}

/// Production capability client
pub struct HttpCapabilityClient {
    http: reqwest::Client,
    config: CapabilityConfig,
    /// Running counters; per-instance state with explicit reset
    stats: Mutex<ClientStats>,
}

impl HttpCapabilityClient {
    pub fn new(config: CapabilityConfig) -> Result<Self, CapabilityError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CapabilityError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            config,
            stats: Mutex::new(ClientStats::default()),
        })
    }

    /// Snapshot of the running counters
    pub fn stats(&self) -> ClientStats {
        *self.stats.lock().expect("stats lock poisoned")
    }

    /// Reset the running counters to zero
    pub fn reset_stats(&self) {
        *self.stats.lock().expect("stats lock poisoned") = ClientStats::default();
    }

    fn record(&self, success: bool, latency_ms: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_calls += 1;
        if success {
            stats.success_calls += 1;
        } else {
            stats.failure_calls += 1;
        }
        stats.total_latency_ms += latency_ms;
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.config
            .base_delay
            .mul_f64(self.config.backoff_factor.powi(attempt as i32))
    }

    /// POST a JSON body and decode a JSON response, with the retry policy
    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, CapabilityError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();
            let result = self.execute_once(&url, body).await;
            self.record(result.is_ok(), started.elapsed().as_millis() as u64);

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        CapabilityError::RateLimited {
                            retry_after: Some(server_delay),
                        } => *server_delay,
                        _ => self.backoff_delay(attempt),
                    };

                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Capability call failed, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn execute_once<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<R, CapabilityError> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CapabilityError::RateLimited { retry_after });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CapabilityError::Auth(status.as_u16()));
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Validation(format!(
                "status {}: {}",
                status.as_u16(),
                detail
            )));
        }
        if status.is_server_error() {
            return Err(CapabilityError::Server(status.as_u16()));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| CapabilityError::Malformed(e.to_string()))
    }
}

fn classify_send_error(e: reqwest::Error) -> CapabilityError {
    if e.is_timeout() {
        CapabilityError::Timeout
    } else {
        CapabilityError::Connection(e.to_string())
    }
}

#[async_trait]
impl CapabilityProvider for HttpCapabilityClient {
    async fn classify(
        &self,
        content: &str,
        context: Option<&str>,
    ) -> Result<Classification, CapabilityError> {
        debug!(content_len = content.len(), "Requesting classification");
        let response: ClassifyResponse = self
            .post_json(
                "/v1/classify",
                &ClassifyRequest {
                    content,
                    context,
                },
            )
            .await?;
        Ok(Classification {
            category: response.category,
            confidence: response.confidence,
        })
    }

    async fn generate(
        &self,
        variant: AssistantVariant,
        content: &str,
        context: Option<&str>,
    ) -> Result<GeneratedAnswer, CapabilityError> {
        debug!(variant = variant.as_str(), content_len = content.len(), "Requesting answer");
        let response: GenerateResponse = self
            .post_json(
                "/v1/generate",
                &GenerateRequest {
                    variant: variant.as_str(),
                    content,
                    context,
                },
            )
            .await?;
        Ok(GeneratedAnswer {
            text: response.text,
            confidence: response.confidence,
        })
    }

    async fn score(&self, request: &ScoreRequest) -> Result<Vec<VariantScore>, CapabilityError> {
        debug!(
            candidates = request.candidates.len(),
            classification = %request.classification,
            "Requesting scores"
        );
        let response: ScoreResponse = self
            .post_json(
                "/v1/score",
                &ScoreWireRequest {
                    content: &request.content,
                    candidates: &request.candidates,
                    classification: &request.classification,
                },
            )
            .await?;
        Ok(response
            .results
            .into_iter()
            .map(|r| VariantScore {
                variant: r.variant,
                dimensions: r.dimensions,
                rationale: r.rationale,
            })
            .collect())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    category: String,
    confidence: Option<f64>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    variant: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
    confidence: Option<f64>,
}

#[derive(Serialize)]
struct ScoreWireRequest<'a> {
    content: &'a str,
    candidates: &'a BTreeMap<String, String>,
    classification: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    results: Vec<ScoreWireResult>,
}

#[derive(Deserialize)]
struct ScoreWireResult {
    variant: String,
    dimensions: Vec<ScoreDimension>,
    #[serde(default)]
    rationale: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    // axum's http types shadow the reqwest re-exports from super::*
    use axum::http::{header::RETRY_AFTER, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Bind an ephemeral port and serve the router in the background
    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast_config(base_url: String) -> CapabilityConfig {
        CapabilityConfig {
            base_url,
            api_key: None,
            timeout: Duration::from_secs(2),
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn classify_parses_response() {
        let router = Router::new().route(
            "/v1/classify",
            post(|| async { Json(json!({"category": "math", "confidence": 0.93})) }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let result = client.classify("What is 2+2?", None).await.unwrap();
        assert_eq!(result.category, "math");
        assert_eq!(result.confidence, Some(0.93));

        let stats = client.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.success_calls, 1);
        assert_eq!(stats.failure_calls, 0);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let router = Router::new().route(
            "/v1/generate",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    } else {
                        Json(json!({"text": "four", "confidence": null})).into_response()
                    }
                }
            }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let answer = client
            .generate(AssistantVariant::Baseline, "What is 2+2?", None)
            .await
            .unwrap();
        assert_eq!(answer.text, "four");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let stats = client.stats();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.success_calls, 1);
        assert_eq!(stats.failure_calls, 2);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after_header() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let router = Router::new().route(
            "/v1/classify",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        let mut headers = HeaderMap::new();
                        headers.insert(RETRY_AFTER, "1".parse().unwrap());
                        (StatusCode::TOO_MANY_REQUESTS, headers).into_response()
                    } else {
                        Json(json!({"category": "math", "confidence": null})).into_response()
                    }
                }
            }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let started = Instant::now();
        let result = client.classify("q", None).await.unwrap();
        assert_eq!(result.category, "math");
        // Waited out the server-specified delay, not the 10ms base backoff
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validation_errors_fail_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let router = Router::new().route(
            "/v1/classify",
            post(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::UNPROCESSABLE_ENTITY, "content too long").into_response()
                }
            }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let err = client.classify("q", None).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Validation(_)));
        assert!(!err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_fails_immediately() {
        let router = Router::new().route(
            "/v1/classify",
            post(|| async { StatusCode::UNAUTHORIZED.into_response() }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let err = client.classify("q", None).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Auth(401)));
        assert_eq!(client.stats().failure_calls, 1);
    }

    #[tokio::test]
    async fn undecodable_body_is_malformed() {
        let router = Router::new().route(
            "/v1/classify",
            post(|| async { "this is not json".into_response() }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let err = client.classify("q", None).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn timeout_is_classified_and_retried() {
        let router = Router::new().route(
            "/v1/classify",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(json!({"category": "late", "confidence": null}))
            }),
        );
        let base_url = spawn_server(router).await;
        let mut config = fast_config(base_url);
        config.timeout = Duration::from_millis(50);
        config.max_retries = 1;
        let client = HttpCapabilityClient::new(config).unwrap();

        let err = client.classify("q", None).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout));
        // First attempt plus one retry
        assert_eq!(client.stats().total_calls, 2);
    }

    #[tokio::test]
    async fn score_response_maps_per_variant_results() {
        let router = Router::new().route(
            "/v1/score",
            post(|| async {
                Json(json!({
                    "results": [
                        {
                            "variant": "baseline",
                            "dimensions": [
                                {"name": "accuracy", "value": 2.0},
                                {"name": "fluency", "value": 4.0}
                            ],
                            "rationale": "incorrect sum"
                        },
                        {
                            "variant": "variant_a",
                            "dimensions": [{"name": "accuracy", "value": 5.0}]
                        }
                    ]
                }))
            }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        let request = ScoreRequest {
            content: "What is 2+2?".into(),
            candidates: BTreeMap::from([
                ("baseline".to_string(), "five".to_string()),
                ("variant_a".to_string(), "four".to_string()),
            ]),
            classification: "math".into(),
        };
        let results = client.score(&request).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].variant, "baseline");
        assert_eq!(results[0].dimensions.len(), 2);
        assert_eq!(results[0].rationale, "incorrect sum");
        // Missing rationale defaults to empty
        assert_eq!(results[1].rationale, "");
    }

    #[tokio::test]
    async fn stats_reset_clears_counters() {
        let router = Router::new().route(
            "/v1/classify",
            post(|| async { Json(json!({"category": "math", "confidence": null})) }),
        );
        let base_url = spawn_server(router).await;
        let client = HttpCapabilityClient::new(fast_config(base_url)).unwrap();

        client.classify("q", None).await.unwrap();
        assert_eq!(client.stats().total_calls, 1);

        client.reset_stats();
        assert_eq!(client.stats(), ClientStats::default());
    }
}
