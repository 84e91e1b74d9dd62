//! Workflow orchestrator
//!
//! Runs the phase DAG over the stage processors with dependency gating:
//! a phase refuses to execute until every dependency's last recorded run
//! succeeded. Phases run on demand (single phase or full workflow) or on a
//! timer via [`scheduler`]; automatic full runs stop before the
//! manual-only Review phase. Results land in the persisted per-phase
//! state and a bounded in-memory execution history.

pub mod phase;
pub mod scheduler;

pub use phase::{PhaseId, PhaseState, PhaseStatus};
pub use scheduler::{Scheduler, SchedulerEvent};

use crate::client::CapabilityProvider;
use crate::db;
use crate::stages::{BatchOutcome, ClassificationStage, GenerationStage, ScoringStage};
use crate::sync::SyncEngine;
use chrono::{DateTime, Utc};
use qvet_common::db::models::TimeWindow;
use qvet_common::Result;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Execution history entries kept in memory
const HISTORY_CAPACITY: usize = 100;

/// Result of one `run_phase` call
#[derive(Debug)]
pub enum PhaseRunResult {
    /// The phase executed; its batch outcome is attached
    Completed(BatchOutcome),
    /// One or more dependencies' last run did not succeed; nothing executed
    DependenciesNotMet(Vec<PhaseId>),
    /// The phase is operator-disabled; nothing executed
    Disabled,
}

/// One entry of the bounded execution history
#[derive(Debug, Clone)]
pub struct PhaseRunRecord {
    pub phase: PhaseId,
    pub status: PhaseStatus,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

/// Orchestrates the pipeline phases over the shared store
pub struct Orchestrator {
    db: SqlitePool,
    sync: SyncEngine,
    classification: ClassificationStage,
    generation: GenerationStage,
    scoring: ScoringStage,
    history: Mutex<VecDeque<PhaseRunRecord>>,
}

impl Orchestrator {
    pub fn new(db: SqlitePool, capability: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            sync: SyncEngine::new(db.clone()),
            classification: ClassificationStage::new(db.clone(), Arc::clone(&capability)),
            generation: GenerationStage::new(db.clone(), Arc::clone(&capability)),
            scoring: ScoringStage::new(db.clone(), capability),
            db,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Seed the per-phase state rows; call once at startup
    pub async fn init(&self) -> Result<()> {
        db::phases::init_phases(&self.db).await
    }

    /// Run a single phase, honoring the dependency gate.
    ///
    /// Returns without executing anything when the phase is disabled or a
    /// dependency's last recorded status is not `Success`.
    pub async fn run_phase(&self, phase: PhaseId) -> Result<PhaseRunResult> {
        let state = db::phases::load(&self.db, phase).await?;
        if state.status == PhaseStatus::Disabled {
            info!(phase = phase.as_str(), "Phase is disabled, skipping");
            return Ok(PhaseRunResult::Disabled);
        }

        let mut unmet = Vec::new();
        for dep in &state.depends_on {
            let dep_state = db::phases::load(&self.db, *dep).await?;
            if dep_state.status != PhaseStatus::Success {
                unmet.push(*dep);
            }
        }
        if !unmet.is_empty() {
            info!(
                phase = phase.as_str(),
                unmet = ?unmet.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                "Dependencies not met, phase not executed"
            );
            return Ok(PhaseRunResult::DependenciesNotMet(unmet));
        }

        db::phases::mark_running(&self.db, phase).await?;
        info!(phase = phase.as_str(), "Phase started");

        match self.execute(phase).await {
            Ok((outcome, message)) => {
                // A batch where every selected item failed is a phase
                // failure; an empty batch is a successful no-op
                let status = if outcome.processed > 0 && outcome.succeeded == 0 {
                    PhaseStatus::Failed
                } else {
                    PhaseStatus::Success
                };
                db::phases::mark_finished(&self.db, phase, status, &message).await?;
                self.push_history(phase, status, message.clone());
                info!(phase = phase.as_str(), status = status.as_str(), %message, "Phase finished");
                Ok(PhaseRunResult::Completed(outcome))
            }
            Err(err) => {
                let message = err.to_string();
                db::phases::mark_finished(&self.db, phase, PhaseStatus::Failed, &message).await?;
                self.push_history(phase, PhaseStatus::Failed, message.clone());
                error!(phase = phase.as_str(), %message, "Phase failed");
                Err(err)
            }
        }
    }

    /// Invoke the operation bound to a phase
    async fn execute(&self, phase: PhaseId) -> Result<(BatchOutcome, String)> {
        match phase {
            PhaseId::Sync => {
                let hours = db::settings::get_i64(&self.db, "sync_window_hours", 24).await?;
                let window = TimeWindow::last_hours(hours);
                let ingest = self.sync.run_window(&window).await?;
                let outcome = BatchOutcome {
                    processed: ingest.ingested + ingest.skipped,
                    succeeded: ingest.ingested + ingest.skipped,
                    failed: 0,
                    errors: Vec::new(),
                };
                let message = format!(
                    "ingested {}, skipped {}",
                    ingest.ingested, ingest.skipped
                );
                Ok((outcome, message))
            }
            PhaseId::Classification => {
                let limit = crate::stages::configured_batch_size(&self.db).await?;
                let outcome = self.classification.run_batch(limit).await?;
                let message = outcome.summary();
                Ok((outcome, message))
            }
            PhaseId::AnswerGeneration => {
                let limit = crate::stages::configured_batch_size(&self.db).await?;
                let outcome = self.generation.run_batch(limit).await?;
                let message = outcome.summary();
                Ok((outcome, message))
            }
            PhaseId::Scoring => {
                let limit = crate::stages::configured_batch_size(&self.db).await?;
                let outcome = self.scoring.run_batch(limit).await?;
                let message = outcome.summary();
                Ok((outcome, message))
            }
            PhaseId::Review => {
                // Review itself is an external, human action; the phase
                // only reports the backlog
                let pending = db::questions::count_pending_reviews(&self.db).await?;
                let outcome = BatchOutcome {
                    processed: pending as usize,
                    succeeded: pending as usize,
                    failed: 0,
                    errors: Vec::new(),
                };
                let message = format!("{} badcases awaiting review", pending);
                Ok((outcome, message))
            }
        }
    }

    /// Run phases in DAG order, stopping at the first failure, the first
    /// unmet gate, or before the first manual-only phase.
    pub async fn run_full_workflow(&self) -> Result<Vec<(PhaseId, PhaseRunResult)>> {
        let mut results = Vec::new();

        for phase in PhaseId::ALL {
            let state = db::phases::load(&self.db, phase).await?;
            if !state.auto_continue {
                info!(
                    phase = phase.as_str(),
                    "Stopping automatic run before manual-only phase"
                );
                break;
            }
            if state.status == PhaseStatus::Disabled {
                // A disabled phase also blocks its dependents' gates, so
                // the next iteration stops the run
                warn!(phase = phase.as_str(), "Phase disabled, not executed");
                results.push((phase, PhaseRunResult::Disabled));
                continue;
            }

            let result = self.run_phase(phase).await?;
            let stop = match &result {
                PhaseRunResult::DependenciesNotMet(_) => true,
                PhaseRunResult::Completed(_) => {
                    db::phases::load(&self.db, phase).await?.status == PhaseStatus::Failed
                }
                PhaseRunResult::Disabled => true,
            };
            results.push((phase, result));
            if stop {
                break;
            }
        }

        Ok(results)
    }

    /// Current state of all phases, in DAG order
    pub async fn phase_states(&self) -> Result<Vec<PhaseState>> {
        db::phases::load_all(&self.db).await
    }

    /// Enable or disable a phase (operator action)
    pub async fn set_phase_enabled(&self, phase: PhaseId, enabled: bool) -> Result<()> {
        db::phases::set_enabled(&self.db, phase, enabled).await
    }

    /// Recent phase runs, oldest first
    pub fn history(&self) -> Vec<PhaseRunRecord> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn push_history(&self, phase: PhaseId, status: PhaseStatus, message: String) {
        let mut history = self.history.lock().expect("history lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(PhaseRunRecord {
            phase,
            status,
            message,
            finished_at: Utc::now(),
        });
    }
}
