//! Command-line interface for waypoint.
//!
//! Provides commands for invoking and re-running stages, recording gate
//! decisions, and inspecting checkpoints, pending reviews, and the audit
//! trail.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use crate::adapters;
use crate::config;
use crate::core::{
    CancelHandle, CheckpointStore, ExecutionContext, GateController, InvocationOutcome,
    PipelineCoordinator, SqliteStore, StageStatus,
};
use crate::domain::Decision;

/// waypoint - Resumable, checkpointed pipeline coordinator
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run or resume a stage for a unit of work
    Invoke {
        /// Pipeline name (will look for <pipelines>/<name>.yaml)
        pipeline_name: String,

        /// Unit of work id
        unit: String,

        /// Stage to run (default: next incomplete stage)
        #[arg(short, long)]
        stage: Option<String>,

        /// Correlation id for a new checkpoint (generated if omitted)
        #[arg(long)]
        execution_id: Option<String>,

        /// Number of items the stage will process, if known
        #[arg(long)]
        items_total: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run a completed or failed stage on a fresh checkpoint
    Rerun {
        pipeline_name: String,
        unit: String,
        stage: String,

        /// Must differ from the previous execution id
        #[arg(long)]
        execution_id: Option<String>,

        #[arg(long)]
        items_total: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Record a gate decision
    Decide {
        pipeline_name: String,
        unit: String,
        stage: String,

        #[arg(value_enum)]
        decision: DecisionArg,

        /// Reviewer name
        #[arg(short, long, env = "WAYPOINT_REVIEWER")]
        reviewer: String,

        /// Feedback for the stage owner
        #[arg(short, long)]
        feedback: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show the state of every stage for a unit of work
    Status {
        pipeline_name: String,
        unit: String,
    },

    /// Show the audit trail for a unit of work
    Audit {
        unit: String,

        /// Only entries for this stage
        #[arg(short, long)]
        stage: Option<String>,
    },

    /// List executions waiting for review
    Pending {
        /// Only gates past the notification threshold
        #[arg(long)]
        overdue: bool,
    },

    /// List the stages of a pipeline
    Stages { pipeline_name: String },

    /// Show resolved configuration (debug)
    Config,
}

/// Gate verdict for the CLI (maps to Decision)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
}

impl From<DecisionArg> for Decision {
    fn from(d: DecisionArg) -> Self {
        match d {
            DecisionArg::Approve => Decision::Approved,
            DecisionArg::Reject => Decision::Rejected,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Invoke {
                pipeline_name,
                unit,
                stage,
                execution_id,
                items_total,
                json,
            } => {
                invoke_stage(&pipeline_name, &unit, stage.as_deref(), execution_id, items_total, json)
                    .await
            }
            Commands::Rerun {
                pipeline_name,
                unit,
                stage,
                execution_id,
                items_total,
                json,
            } => rerun_stage(&pipeline_name, &unit, &stage, execution_id, items_total, json).await,
            Commands::Decide {
                pipeline_name,
                unit,
                stage,
                decision,
                reviewer,
                feedback,
                json,
            } => {
                decide(&pipeline_name, &unit, &stage, decision.into(), &reviewer, feedback, json)
                    .await
            }
            Commands::Status {
                pipeline_name,
                unit,
            } => show_status(&pipeline_name, &unit).await,
            Commands::Audit { unit, stage } => show_audit(&unit, stage.as_deref()).await,
            Commands::Pending { overdue } => list_pending(overdue).await,
            Commands::Stages { pipeline_name } => list_stages(&pipeline_name),
            Commands::Config => show_config(),
        }
    }
}

/// Open the configured checkpoint database
fn open_store() -> Result<Arc<dyn CheckpointStore>> {
    let path = config::database_path()?;
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open checkpoint database: {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Coordinator for a named pipeline with its configured executors
fn build_coordinator(pipeline_name: &str) -> Result<PipelineCoordinator> {
    let cfg = config::config()?;
    let pipeline = config::load_pipeline(pipeline_name)?;
    let executors = adapters::executors_for(&pipeline)?;

    let mut coordinator = PipelineCoordinator::new(pipeline, open_store()?)
        .with_retry_policy(cfg.retry.clone())
        .with_notify_after_hours(cfg.gates.notify_after_hours);
    for (stage, executor) in executors {
        coordinator = coordinator.with_executor(stage, executor);
    }

    Ok(coordinator)
}

/// Execution context whose cancel signal fires on Ctrl-C
fn interruptible_context(
    execution_id: Option<String>,
    items_total: Option<u64>,
) -> ExecutionContext {
    let (handle, signal) = CancelHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; pausing stage after the current batch");
            handle.cancel();
        }
    });

    let ctx = match execution_id {
        Some(id) => ExecutionContext::new(id),
        None => ExecutionContext::generated(),
    };
    ctx.with_items_total(items_total).with_cancel(signal)
}

async fn invoke_stage(
    pipeline_name: &str,
    unit: &str,
    stage: Option<&str>,
    execution_id: Option<String>,
    items_total: Option<u64>,
    json: bool,
) -> Result<()> {
    let coordinator = build_coordinator(pipeline_name)?;
    let ctx = interruptible_context(execution_id, items_total);

    let outcome = coordinator.invoke_stage(unit, stage, ctx).await?;
    print_outcome(&outcome, json)
}

async fn rerun_stage(
    pipeline_name: &str,
    unit: &str,
    stage: &str,
    execution_id: Option<String>,
    items_total: Option<u64>,
    json: bool,
) -> Result<()> {
    let coordinator = build_coordinator(pipeline_name)?;
    let ctx = interruptible_context(execution_id, items_total);

    let outcome = coordinator.rerun_stage(unit, stage, ctx).await?;
    print_outcome(&outcome, json)
}

async fn decide(
    pipeline_name: &str,
    unit: &str,
    stage: &str,
    decision: Decision,
    reviewer: &str,
    feedback: Option<String>,
    json: bool,
) -> Result<()> {
    let coordinator = build_coordinator(pipeline_name)?;
    let outcome = coordinator
        .submit_decision(unit, stage, decision, reviewer, feedback)
        .await?;
    print_outcome(&outcome, json)
}

fn print_outcome(outcome: &InvocationOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        if let Some(ref stage) = outcome.stage_name {
            println!("Stage: {}", stage);
        }
        if let Some(ref summary) = outcome.summary {
            println!("Checkpoint: {}", summary.checkpoint_id);
            println!("Execution: {}", summary.execution_id);
            match summary.items_total {
                Some(total) => println!("Progress: {}/{}", summary.items_processed, total),
                None => println!("Progress: {}", summary.items_processed),
            }
            if let Some(ref last) = summary.last_processed_id {
                println!("Last processed: {}", last);
            }
        }

        match &outcome.status {
            StageStatus::AwaitingGate { pending_since } => {
                println!("Status: pending review (since {})", pending_since);
            }
            StageStatus::Failed {
                error_count,
                last_error,
            } => {
                println!("Status: failed after {} errors", error_count);
                if let Some(err) = last_error {
                    println!("Last error ({}): {}", err.classification, err.message);
                }
            }
            StageStatus::PipelineComplete => println!("Status: all stages completed"),
            other => println!("Status: {}", status_label(other)),
        }
    }

    if matches!(outcome.status, StageStatus::Failed { .. }) {
        std::process::exit(1);
    }

    Ok(())
}

fn status_label(status: &StageStatus) -> &'static str {
    match status {
        StageStatus::NotStarted => "not started",
        StageStatus::InProgress => "in progress",
        StageStatus::AwaitingGate { .. } => "awaiting gate",
        StageStatus::Paused => "paused",
        StageStatus::Completed => "completed",
        StageStatus::Failed { .. } => "failed",
        StageStatus::PipelineComplete => "pipeline complete",
    }
}

/// Show the state of every stage
async fn show_status(pipeline_name: &str, unit: &str) -> Result<()> {
    let coordinator = build_coordinator(pipeline_name)?;
    let reports = coordinator.stage_states(unit).await?;

    println!("Unit: {}", unit);
    println!("Pipeline: {}", coordinator.pipeline().name);
    println!();
    println!(
        "{:<20} {:<15} {:<7} {:<12} {:<7}",
        "STAGE", "STATE", "GATED", "PROCESSED", "ERRORS"
    );
    println!("{}", "-".repeat(65));

    for report in reports {
        let (processed, errors) = match report.summary {
            Some(ref s) => (
                match s.items_total {
                    Some(total) => format!("{}/{}", s.items_processed, total),
                    None => s.items_processed.to_string(),
                },
                s.error_count.to_string(),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<20} {:<15} {:<7} {:<12} {:<7}",
            report.stage_name,
            report.state.to_string(),
            if report.gated { "yes" } else { "no" },
            processed,
            errors
        );
    }

    Ok(())
}

/// Show the audit trail
async fn show_audit(unit: &str, stage: Option<&str>) -> Result<()> {
    let store = open_store()?;
    let entries = store.audit_trail(unit, stage).await?;

    if entries.is_empty() {
        println!("No audit entries found");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{} {:<16} {:<24} {:<15} {}:{}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.stage_name,
            entry.action.to_string(),
            entry.actor_type.to_string(),
            entry.actor,
            entry
                .checkpoint_id
                .map(|id| format!(" [{}]", id))
                .unwrap_or_default(),
            entry
                .reasoning
                .as_deref()
                .map(|r| format!(" - {}", r))
                .unwrap_or_default()
        );
    }

    Ok(())
}

/// List executions waiting for review
async fn list_pending(overdue_only: bool) -> Result<()> {
    let cfg = config::config()?;
    let gates = GateController::new(open_store()?, Vec::<String>::new())
        .with_notify_after_hours(cfg.gates.notify_after_hours);

    let now = Utc::now();
    let pending = if overdue_only {
        gates.overdue_gates(now).await?
    } else {
        gates.pending_gates().await?
    };

    if pending.is_empty() {
        println!("No gates pending");
        return Ok(());
    }

    println!("{:<24} {:<20} {:<26} {:>8}", "UNIT", "STAGE", "PENDING SINCE", "HOURS");
    println!("{}", "-".repeat(82));

    for gate in pending {
        let hours = gate.waiting_for(now).num_hours();
        let marker = if hours >= cfg.gates.notify_after_hours as i64 { " !" } else { "" };
        println!(
            "{:<24} {:<20} {:<26} {:>8}{}",
            gate.unit_of_work_id,
            gate.stage_name,
            gate.pending_since.format("%Y-%m-%d %H:%M:%S UTC"),
            hours,
            marker
        );
    }

    Ok(())
}

/// List the stages of a pipeline
fn list_stages(pipeline_name: &str) -> Result<()> {
    let pipeline = config::load_pipeline(pipeline_name)?;

    println!("Pipeline: {}", pipeline.name);
    if !pipeline.description.is_empty() {
        println!("{}", pipeline.description);
    }
    println!();

    for (i, stage) in pipeline.stages.iter().enumerate() {
        let executor = match stage.executor {
            Some(crate::core::ExecutorSpec::Command { ref program, .. }) => {
                format!("command: {}", program)
            }
            Some(crate::core::ExecutorSpec::Http { ref url, .. }) => format!("http: {}", url),
            None => "(none)".to_string(),
        };
        println!(
            "{}. {}{}{}  [{}]",
            i + 1,
            stage.name,
            pipeline
                .predecessor(&stage.name)
                .map(|p| format!(" (after {})", p))
                .unwrap_or_default(),
            if stage.gated { " gated" } else { "" },
            executor
        );
    }

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("waypoint configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Database:            {}", cfg.database.display());
    println!("  Pipelines:           {}", cfg.pipelines.display());
    println!();
    println!("Retry policy:");
    println!("  Max retries:     {}", cfg.retry.max_retries);
    println!("  Base delay:      {}ms", cfg.retry.base_delay_ms);
    println!("  Max delay:       {}ms", cfg.retry.max_delay_ms);
    println!("  Retry statuses:  {:?}", cfg.retry.retry_on_status);
    println!();
    println!("Gates:");
    println!("  Notify after:    {}h", cfg.gates.notify_after_hours);

    Ok(())
}
