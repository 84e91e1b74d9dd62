//! Scheduler run loop
//!
//! Timing is decoupled from phase execution by message passing: a timer
//! task emits due events onto a channel, and the run loop consumes them
//! and calls the orchestrator. Manual triggers send on the same channel,
//! and tests drive the loop by sending events directly, with no real
//! clock involved.

use super::{Orchestrator, PhaseId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Events consumed by the scheduler run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A recurring timer tick: run the full workflow
    WorkflowDue,
    /// Manual trigger for a single phase
    PhaseDue(PhaseId),
    /// Drain and stop the run loop
    Shutdown,
}

/// Consumes scheduler events and drives the orchestrator
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::Receiver<SchedulerEvent>,
}

impl Scheduler {
    /// Create the run loop and its trigger handle
    pub fn new(orchestrator: Arc<Orchestrator>) -> (Self, mpsc::Sender<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { orchestrator, rx }, tx)
    }

    /// Spawn the recurring timer that emits `WorkflowDue` every `period`.
    ///
    /// The task ends when the receiving side of the channel is dropped.
    pub fn spawn_interval_timer(
        tx: mpsc::Sender<SchedulerEvent>,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // scheduled run happens one full period after startup
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(SchedulerEvent::WorkflowDue).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Process events until `Shutdown` or all senders are dropped.
    ///
    /// Phase failures are logged and do not stop the loop; the failed
    /// phase stays in a retryable state for the next trigger.
    pub async fn run(mut self) {
        info!("Scheduler run loop started");
        while let Some(event) = self.rx.recv().await {
            match event {
                SchedulerEvent::WorkflowDue => {
                    info!("Workflow due, starting full run");
                    if let Err(e) = self.orchestrator.run_full_workflow().await {
                        error!(error = %e, "Scheduled workflow run failed");
                    }
                }
                SchedulerEvent::PhaseDue(phase) => {
                    info!(phase = phase.as_str(), "Phase due, starting run");
                    if let Err(e) = self.orchestrator.run_phase(phase).await {
                        error!(phase = phase.as_str(), error = %e, "Scheduled phase run failed");
                    }
                }
                SchedulerEvent::Shutdown => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
        info!("Scheduler run loop stopped");
    }
}
