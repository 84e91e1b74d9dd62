//! Resilient capability client
//!
//! Single abstraction over the three outbound capabilities (classify,
//! generate, score). Stage processors depend on the [`CapabilityProvider`]
//! trait; [`HttpCapabilityClient`] is the production implementation with
//! timeout, bounded retries, exponential backoff, and typed error
//! classification.

mod http;

pub use http::{CapabilityConfig, HttpCapabilityClient};

use async_trait::async_trait;
use qvet_common::db::models::{AssistantVariant, ScoreDimension};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Capability call errors surfaced to stage processors
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Request exceeded the configured timeout
    #[error("Capability request timed out")]
    Timeout,

    /// Connection could not be established or was dropped
    #[error("Connection failure: {0}")]
    Connection(String),

    /// HTTP 429; `retry_after` carries the server-specified delay if any
    #[error("Rate limited by capability service")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 401/403; fatal to this client instance
    #[error("Authentication failure (status {0})")]
    Auth(u16),

    /// HTTP 4xx other than 401/403/429; fatal to the single item
    #[error("Request rejected: {0}")]
    Validation(String),

    /// HTTP 5xx
    #[error("Capability server failure (status {0})")]
    Server(u16),

    /// Response body could not be decoded
    #[error("Malformed capability response: {0}")]
    Malformed(String),
}

impl CapabilityError {
    /// Errors worth retrying within one call (and worth re-attempting the
    /// item on a later batch run)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CapabilityError::Timeout
                | CapabilityError::Connection(_)
                | CapabilityError::RateLimited { .. }
                | CapabilityError::Server(_)
        )
    }
}

/// Classification result
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: String,
    pub confidence: Option<f64>,
}

/// Generation result
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Scoring request: all candidate answers for one question, keyed by
/// variant name
#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub content: String,
    pub candidates: BTreeMap<String, String>,
    pub classification: String,
}

/// Per-variant scoring result as returned by the capability.
///
/// The variant is the raw wire name; callers match it back to stored
/// answers and discard results they cannot place.
#[derive(Debug, Clone)]
pub struct VariantScore {
    pub variant: String,
    pub dimensions: Vec<ScoreDimension>,
    pub rationale: String,
}

/// Snapshot of the client's running counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientStats {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failure_calls: u64,
    pub total_latency_ms: u64,
}

/// The seam between stage processors and the outbound capabilities.
///
/// Tests substitute scripted implementations; production uses
/// [`HttpCapabilityClient`].
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Classify question content into a category
    async fn classify(
        &self,
        content: &str,
        context: Option<&str>,
    ) -> Result<Classification, CapabilityError>;

    /// Generate one assistant variant's answer for the content
    async fn generate(
        &self,
        variant: AssistantVariant,
        content: &str,
        context: Option<&str>,
    ) -> Result<GeneratedAnswer, CapabilityError>;

    /// Score all candidate answers for one question in a single call
    async fn score(&self, request: &ScoreRequest) -> Result<Vec<VariantScore>, CapabilityError>;
}
