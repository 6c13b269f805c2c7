//! Stage executors backed by external systems.
//!
//! Adapters turn an [`ExecutorSpec`] from a pipeline definition into a
//! [`StageExecutor`]: a local subprocess speaking JSON lines, or a webhook
//! of an external workflow engine.

pub mod command;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{
    ExecutionError, ExecutorSpec, Pipeline, PipelineError, ProgressReporter, StageExecutor,
};

pub use command::CommandExecutor;
pub use http::HttpExecutor;

/// One progress report emitted by an external executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub items_processed: u64,

    #[serde(default)]
    pub last_processed_id: Option<String>,

    #[serde(default)]
    pub checkpoint_data: Option<serde_json::Value>,
}

impl ProgressMessage {
    /// Forward to the store. Rejected updates are logged and skipped so the
    /// stage continues from its last good state; anything else fails the run.
    pub async fn forward(self, progress: &ProgressReporter) -> Result<(), ExecutionError> {
        match progress
            .report(
                self.items_processed,
                self.last_processed_id,
                self.checkpoint_data,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(PipelineError::MonotonicityViolation { .. })
            | Err(PipelineError::InvalidProgress { .. }) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Progress could not be recorded");
                Err(ExecutionError::new(format!("progress not recorded: {}", e)))
            }
        }
    }
}

/// Build the executor described by a stage's spec
pub fn executor_from_spec(stage_name: &str, spec: &ExecutorSpec) -> Result<Arc<dyn StageExecutor>> {
    let executor: Arc<dyn StageExecutor> = match spec {
        ExecutorSpec::Command {
            program,
            args,
            env,
            timeout_seconds,
        } => Arc::new(
            CommandExecutor::new(program)
                .with_args(args.clone())
                .with_env(env.clone())
                .with_timeout(Duration::from_secs(*timeout_seconds)),
        ),
        ExecutorSpec::Http {
            url,
            headers,
            timeout_seconds,
        } => Arc::new(
            HttpExecutor::new(url, Duration::from_secs(*timeout_seconds))
                .with_context(|| format!("Failed to build HTTP executor for stage '{}'", stage_name))?
                .with_headers(headers.clone()),
        ),
    };
    Ok(executor)
}

/// Executors for every stage that declares one
pub fn executors_for(pipeline: &Pipeline) -> Result<Vec<(String, Arc<dyn StageExecutor>)>> {
    pipeline
        .stages
        .iter()
        .filter_map(|stage| stage.executor.as_ref().map(|spec| (stage, spec)))
        .map(|(stage, spec)| Ok((stage.name.clone(), executor_from_spec(&stage.name, spec)?)))
        .collect()
}
