//! Canonical data models for the vetting pipeline
//!
//! Database rows use TEXT columns for enums and RFC3339 TEXT for
//! timestamps; the enums here own the string forms via `as_str`/`parse`.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Upper bound on scoring dimensions kept per answer.
///
/// The scoring capability returns a variable number of named dimensions;
/// only the first `MAX_SCORE_DIMENSIONS` are persisted.
pub const MAX_SCORE_DIMENSIONS: usize = 8;

/// Raw question/answer record as read from the external ingestion source.
///
/// Append-only and externally owned; never mutated by this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub recorded_at: DateTime<Utc>,
    pub content: String,
    /// Opaque source metadata (JSON), passed through to the question
    pub metadata: Option<String>,
}

/// Half-open time window `[start, end)` bounding an ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window covering the last `hours` hours, ending now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::hours(hours),
            end,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Pipeline position of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Classifying,
    Classified,
    ClassificationFailed,
    AnswersGenerated,
    AnswerGenerationFailed,
    Scoring,
    Scored,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Classifying => "classifying",
            ProcessingStatus::Classified => "classified",
            ProcessingStatus::ClassificationFailed => "classification_failed",
            ProcessingStatus::AnswersGenerated => "answers_generated",
            ProcessingStatus::AnswerGenerationFailed => "answer_generation_failed",
            ProcessingStatus::Scoring => "scoring",
            ProcessingStatus::Scored => "scored",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "classifying" => Ok(ProcessingStatus::Classifying),
            "classified" => Ok(ProcessingStatus::Classified),
            "classification_failed" => Ok(ProcessingStatus::ClassificationFailed),
            "answers_generated" => Ok(ProcessingStatus::AnswersGenerated),
            "answer_generation_failed" => Ok(ProcessingStatus::AnswerGenerationFailed),
            "scoring" => Ok(ProcessingStatus::Scoring),
            "scored" => Ok(ProcessingStatus::Scored),
            other => Err(Error::Internal(format!(
                "Unknown processing status: {}",
                other
            ))),
        }
    }

    /// Terminal failure statuses (require operator attention, not retried)
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::ClassificationFailed | ProcessingStatus::AnswerGenerationFailed
        )
    }
}

/// Review position of a flagged question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    None,
    Pending,
    Reviewed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::None => "none",
            ReviewStatus::Pending => "pending",
            ReviewStatus::Reviewed => "reviewed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ReviewStatus::None),
            "pending" => Ok(ReviewStatus::Pending),
            "reviewed" => Ok(ReviewStatus::Reviewed),
            other => Err(Error::Internal(format!("Unknown review status: {}", other))),
        }
    }
}

/// Outcome of a human badcase review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResult {
    Confirmed,
    Rejected,
}

impl ReviewResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewResult::Confirmed => "confirmed",
            ReviewResult::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "confirmed" => Ok(ReviewResult::Confirmed),
            "rejected" => Ok(ReviewResult::Rejected),
            other => Err(Error::InvalidInput(format!(
                "Unknown review result: {}",
                other
            ))),
        }
    }
}

/// Answer sources evaluated side by side.
///
/// Closed enum so adding a variant is a single new case rather than
/// scattered string comparisons. `Baseline` is the system's own assistant;
/// the others are competitor sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantVariant {
    Baseline,
    VariantA,
    VariantB,
}

impl AssistantVariant {
    /// The required variant set; generation and scoring run over all of these
    pub const ALL: [AssistantVariant; 3] = [
        AssistantVariant::Baseline,
        AssistantVariant::VariantA,
        AssistantVariant::VariantB,
    ];

    /// Stable wire/storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantVariant::Baseline => "baseline",
            AssistantVariant::VariantA => "variant_a",
            AssistantVariant::VariantB => "variant_b",
        }
    }

    /// Human-readable name for logs and review tooling
    pub fn display_name(&self) -> &'static str {
        match self {
            AssistantVariant::Baseline => "Baseline",
            AssistantVariant::VariantA => "Variant A",
            AssistantVariant::VariantB => "Variant B",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "baseline" => Ok(AssistantVariant::Baseline),
            "variant_a" => Ok(AssistantVariant::VariantA),
            "variant_b" => Ok(AssistantVariant::VariantB),
            other => Err(Error::InvalidInput(format!(
                "Unknown assistant variant: {}",
                other
            ))),
        }
    }
}

/// Canonical deduplicated question entity
#[derive(Debug, Clone)]
pub struct Question {
    /// Content identity: hex SHA-256 over (source_id, recorded_at, content)
    pub identity: String,
    pub source_id: String,
    pub recorded_at: DateTime<Utc>,
    pub content: String,
    pub metadata: Option<String>,
    /// Category assigned by the classification stage; None until classified
    pub classification: Option<String>,
    pub processing_status: ProcessingStatus,
    pub is_badcase: bool,
    pub badcase_review_status: ReviewStatus,
    /// Detection snapshot (JSON `BadcaseDetail`); set on false→true transitions
    pub badcase_detail: Option<String>,
    /// Most recent per-item stage error, cleared on stage success
    pub last_error: Option<String>,
}

impl Question {
    /// Create a pending question from a raw record
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            identity: Self::identity_of(&record.source_id, record.recorded_at, &record.content),
            source_id: record.source_id.clone(),
            recorded_at: record.recorded_at,
            content: record.content.clone(),
            metadata: record.metadata.clone(),
            classification: None,
            processing_status: ProcessingStatus::Pending,
            is_badcase: false,
            badcase_review_status: ReviewStatus::None,
            badcase_detail: None,
            last_error: None,
        }
    }

    /// Deterministic content identity.
    ///
    /// Re-ingesting the same raw record always produces the same identity,
    /// which is the primary-key guard against duplicate questions.
    pub fn identity_of(source_id: &str, recorded_at: DateTime<Utc>, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(recorded_at.to_rfc3339().as_bytes());
        hasher.update(b"\n");
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// One generated answer per (question, assistant variant)
#[derive(Debug, Clone)]
pub struct Answer {
    pub question_identity: String,
    pub variant: AssistantVariant,
    pub text: String,
    pub is_scored: bool,
}

/// One named evaluation dimension with a 1–5 value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDimension {
    pub name: String,
    pub value: f64,
}

/// Automated evaluation of one answer.
///
/// Immutable once written; review corrections live in
/// [`BadcaseReview`] annotations, never here.
#[derive(Debug, Clone)]
pub struct Score {
    pub question_identity: String,
    pub variant: AssistantVariant,
    /// Ordered dimension list, at most [`MAX_SCORE_DIMENSIONS`] entries
    pub dimensions: Vec<ScoreDimension>,
    /// Mean of present dimension values, rounded to 2 decimals
    pub average_value: f64,
    pub rationale: String,
    pub rated_at: DateTime<Utc>,
}

impl Score {
    /// Rounded mean of the present dimension values (0.0 for an empty list)
    pub fn average_of(dimensions: &[ScoreDimension]) -> f64 {
        if dimensions.is_empty() {
            return 0.0;
        }
        let sum: f64 = dimensions.iter().map(|d| d.value).sum();
        ((sum / dimensions.len() as f64) * 100.0).round() / 100.0
    }

    /// Look up a dimension value by name
    pub fn dimension(&self, name: &str) -> Option<f64> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value)
    }
}

/// Detection snapshot recorded when a question becomes a badcase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadcaseDetail {
    /// Dimension names that scored strictly below the threshold
    pub low_score_dimensions: Vec<String>,
    /// Threshold in effect at detection time
    pub threshold: f64,
    pub detected_at: DateTime<Utc>,
}

/// Human review annotation stored beside (never in place of) the original score
#[derive(Debug, Clone)]
pub struct BadcaseReview {
    pub guid: Uuid,
    pub question_identity: String,
    /// Reviewer-supplied corrected values; required for rejections
    pub corrected_dimensions: Option<Vec<ScoreDimension>>,
    pub corrected_average: Option<f64>,
    pub reviewer: String,
    pub review_result: ReviewResult,
    pub reviewed_at: DateTime<Utc>,
}

impl BadcaseReview {
    pub fn new(
        question_identity: String,
        corrected_dimensions: Option<Vec<ScoreDimension>>,
        reviewer: String,
        review_result: ReviewResult,
    ) -> Self {
        let corrected_average = corrected_dimensions
            .as_deref()
            .map(Score::average_of);
        Self {
            guid: Uuid::new_v4(),
            question_identity,
            corrected_dimensions,
            corrected_average,
            reviewer,
            review_result,
            reviewed_at: Utc::now(),
        }
    }
}
