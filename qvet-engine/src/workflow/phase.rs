//! Workflow phase definitions
//!
//! The phase DAG is fixed at compile time:
//!
//! ```text
//! Sync → Classification → AnswerGeneration → Scoring → Review
//! ```
//!
//! `Review` is manual-only: automatic full-workflow runs stop after
//! Scoring succeeds.

use chrono::{DateTime, Utc};
use qvet_common::{Error, Result};

/// One stage of the workflow DAG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    Sync,
    Classification,
    AnswerGeneration,
    Scoring,
    Review,
}

impl PhaseId {
    /// All phases in DAG execution order
    pub const ALL: [PhaseId; 5] = [
        PhaseId::Sync,
        PhaseId::Classification,
        PhaseId::AnswerGeneration,
        PhaseId::Scoring,
        PhaseId::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Sync => "sync",
            PhaseId::Classification => "classification",
            PhaseId::AnswerGeneration => "answer_generation",
            PhaseId::Scoring => "scoring",
            PhaseId::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(PhaseId::Sync),
            "classification" => Ok(PhaseId::Classification),
            "answer_generation" => Ok(PhaseId::AnswerGeneration),
            "scoring" => Ok(PhaseId::Scoring),
            "review" => Ok(PhaseId::Review),
            other => Err(Error::InvalidInput(format!("Unknown phase: {}", other))),
        }
    }

    /// Phases whose last run must be `Success` before this one may run
    pub fn depends_on(&self) -> &'static [PhaseId] {
        match self {
            PhaseId::Sync => &[],
            PhaseId::Classification => &[PhaseId::Sync],
            PhaseId::AnswerGeneration => &[PhaseId::Classification],
            PhaseId::Scoring => &[PhaseId::AnswerGeneration],
            PhaseId::Review => &[PhaseId::Scoring],
        }
    }

    /// Whether automatic full-workflow runs proceed into this phase.
    ///
    /// Review is manual-only; scheduled runs stop before it.
    pub fn auto_continue(&self) -> bool {
        !matches!(self, PhaseId::Review)
    }
}

/// Lifecycle state of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Operator-controlled: excluded from scheduled execution
    Disabled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "success" => Ok(PhaseStatus::Success),
            "failed" => Ok(PhaseStatus::Failed),
            "disabled" => Ok(PhaseStatus::Disabled),
            other => Err(Error::Internal(format!("Unknown phase status: {}", other))),
        }
    }
}

/// Persisted per-phase state
#[derive(Debug, Clone)]
pub struct PhaseState {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    pub depends_on: Vec<PhaseId>,
    pub auto_continue: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_message: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}
