//! qvet - Question Vetting Pipeline CLI
//!
//! Operational surface for the pipeline: database bootstrap, manual phase
//! triggers, the scheduler daemon, and the badcase review action.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qvet_common::config::{database_path, load_toml_config, resolve_data_folder, TomlConfig};
use qvet_common::db::models::{ProcessingStatus, ReviewResult, ScoreDimension, TimeWindow};
use qvet_engine::badcase::BadcaseDetector;
use qvet_engine::client::{CapabilityProvider, HttpCapabilityClient};
use qvet_engine::config::resolve_capability_config;
use qvet_engine::sync::SyncEngine;
use qvet_engine::workflow::{Orchestrator, PhaseId, Scheduler, SchedulerEvent};
use qvet_engine::{db, workflow};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qvet", version, about = "Question vetting pipeline")]
struct Cli {
    /// Data folder holding the SQLite database
    #[arg(long, global = true, env = "QVET_DATA")]
    data_folder: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and seed phase/settings defaults
    Init,
    /// Run ingestion over a recent window
    Sync {
        /// Window length in hours (default: sync_window_hours setting)
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Run a single workflow phase
    Run {
        /// sync, classification, answer_generation, scoring, or review
        phase: String,
    },
    /// Run the full workflow once
    RunAll,
    /// Run the scheduler daemon (recurring full-workflow runs)
    Serve,
    /// Apply a badcase review action
    Review {
        /// Question identity (content hash)
        identity: String,
        /// confirmed or rejected
        #[arg(long)]
        result: String,
        /// Reviewer identity recorded on the annotation
        #[arg(long)]
        reviewer: String,
        /// Corrected dimensions as JSON, e.g. '[{"name":"accuracy","value":4.0}]'
        #[arg(long)]
        corrected: Option<String>,
    },
    /// Show phase states and pipeline counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_folder = resolve_data_folder(cli.data_folder.as_deref());
    let db_path = database_path(&data_folder);
    info!("Database: {}", db_path.display());

    let pool = qvet_common::db::init_database(&db_path).await?;
    let toml_config = load_toml_config().unwrap_or_default();

    match cli.command {
        Command::Init => {
            db::phases::init_phases(&pool).await?;
            println!("Database initialized at {}", db_path.display());
        }
        Command::Sync { hours } => {
            let hours = match hours {
                Some(h) => h,
                None => db::settings::get_i64(&pool, "sync_window_hours", 24).await?,
            };
            let window = TimeWindow::last_hours(hours);
            let outcome = SyncEngine::new(pool.clone()).run_window(&window).await?;
            println!(
                "Sync complete: ingested {}, skipped {}",
                outcome.ingested, outcome.skipped
            );
        }
        Command::Run { phase } => {
            let phase = PhaseId::parse(&phase)?;
            let orchestrator = build_orchestrator(&pool, &toml_config).await?;
            match orchestrator.run_phase(phase).await? {
                workflow::PhaseRunResult::Completed(outcome) => {
                    println!("Phase {}: {}", phase.as_str(), outcome.summary());
                }
                workflow::PhaseRunResult::DependenciesNotMet(unmet) => {
                    let unmet: Vec<&str> = unmet.iter().map(|p| p.as_str()).collect();
                    println!(
                        "Phase {} not run: dependencies not met ({})",
                        phase.as_str(),
                        unmet.join(", ")
                    );
                }
                workflow::PhaseRunResult::Disabled => {
                    println!("Phase {} is disabled", phase.as_str());
                }
            }
        }
        Command::RunAll => {
            let orchestrator = build_orchestrator(&pool, &toml_config).await?;
            let results = orchestrator.run_full_workflow().await?;
            for (phase, result) in results {
                match result {
                    workflow::PhaseRunResult::Completed(outcome) => {
                        println!("{}: {}", phase.as_str(), outcome.summary())
                    }
                    workflow::PhaseRunResult::DependenciesNotMet(_) => {
                        println!("{}: dependencies not met", phase.as_str())
                    }
                    workflow::PhaseRunResult::Disabled => {
                        println!("{}: disabled", phase.as_str())
                    }
                }
            }
        }
        Command::Serve => {
            serve(pool, &toml_config).await?;
        }
        Command::Review {
            identity,
            result,
            reviewer,
            corrected,
        } => {
            let result = ReviewResult::parse(&result)?;
            let corrected: Option<Vec<ScoreDimension>> = corrected
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .context("corrected dimensions must be JSON [{\"name\":..,\"value\":..}]")?;

            let detector = BadcaseDetector::new(pool.clone());
            let review = detector
                .review(&identity, corrected, result, &reviewer)
                .await?;
            println!(
                "Review {} recorded for question {} ({})",
                review.guid,
                identity,
                review.review_result.as_str()
            );
        }
        Command::Status => {
            print_status(&pool).await?;
        }
    }

    Ok(())
}

async fn build_orchestrator(pool: &SqlitePool, toml_config: &TomlConfig) -> Result<Orchestrator> {
    let capability_config = resolve_capability_config(pool, toml_config).await?;
    let client = HttpCapabilityClient::new(capability_config)
        .map_err(|e| anyhow::anyhow!("failed to build capability client: {}", e))?;
    let capability: Arc<dyn CapabilityProvider> = Arc::new(client);

    let orchestrator = Orchestrator::new(pool.clone(), capability);
    orchestrator.init().await?;
    Ok(orchestrator)
}

/// Scheduler daemon: recurring full-workflow runs until ctrl-c
async fn serve(pool: SqlitePool, toml_config: &TomlConfig) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(&pool, toml_config).await?);

    let interval_secs = db::settings::get_i64(&pool, "scheduler_interval_secs", 86_400).await?;
    info!(interval_secs, "Starting scheduler");

    let (scheduler, tx) = Scheduler::new(Arc::clone(&orchestrator));
    let timer = Scheduler::spawn_interval_timer(
        tx.clone(),
        Duration::from_secs(interval_secs.max(1) as u64),
    );
    let run_loop = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, draining scheduler");
    let _ = tx.send(SchedulerEvent::Shutdown).await;
    run_loop.await?;
    timer.abort();

    Ok(())
}

async fn print_status(pool: &SqlitePool) -> Result<()> {
    db::phases::init_phases(pool).await?;

    println!("Workflow phases:");
    for state in db::phases::load_all(pool).await? {
        let last_run = state
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:18} {:9} runs {}/{} failed, last {} {}",
            state.phase.as_str(),
            state.status.as_str(),
            state.success_count,
            state.success_count + state.failure_count,
            last_run,
            state.last_message.as_deref().unwrap_or("")
        );
    }

    println!("Questions:");
    for status in [
        ProcessingStatus::Pending,
        ProcessingStatus::Classified,
        ProcessingStatus::ClassificationFailed,
        ProcessingStatus::AnswersGenerated,
        ProcessingStatus::AnswerGenerationFailed,
        ProcessingStatus::Scored,
    ] {
        let count = db::questions::count_by_status(pool, status).await?;
        if count > 0 {
            println!("  {:26} {}", status.as_str(), count);
        }
    }

    let pending_reviews = db::questions::count_pending_reviews(pool).await?;
    println!("Badcases awaiting review: {}", pending_reviews);

    Ok(())
}
