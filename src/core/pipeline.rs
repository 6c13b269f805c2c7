//! Pipeline definitions and loading.
//!
//! A pipeline is an ordered registry of named stages, defined in YAML.
//! Each stage declares its predecessor (defaults to the previous stage),
//! whether its output needs gate approval, an optional retry policy
//! override, and the executor that does the work.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Stages in registration order
    pub stages: Vec<StageDef>,
}

impl Pipeline {
    /// Create an empty pipeline; add stages with [`Pipeline::stage`]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: StageDef) -> Self {
        self.stages.push(stage);
        self
    }

    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }

        let mut seen = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }

            if !seen.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }

            // Predecessors must already be registered
            if let Some(ref after) = stage.after {
                match self.stage_index(after) {
                    Some(idx) if idx >= i => {
                        anyhow::bail!(
                            "Stage '{}' runs after later stage '{}' (forward references not allowed)",
                            stage.name,
                            after
                        );
                    }
                    None => {
                        anyhow::bail!(
                            "Stage '{}' runs after non-existent stage '{}'",
                            stage.name,
                            after
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get the index of a stage by name
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// The stage that must complete before `name` may run
    pub fn predecessor(&self, name: &str) -> Option<&str> {
        let idx = self.stage_index(name)?;
        match self.stages[idx].after {
            Some(ref after) => Some(after.as_str()),
            None if idx > 0 => Some(self.stages[idx - 1].name.as_str()),
            None => None,
        }
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }
}

/// A single stage in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Predecessor stage; defaults to the previous one
    #[serde(default)]
    pub after: Option<String>,

    /// Completion requires an approved gate decision
    #[serde(default)]
    pub gated: bool,

    /// Overrides the configured retry policy for this stage
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// How the stage is executed (code-registered executors may omit it)
    #[serde(default)]
    pub executor: Option<ExecutorSpec>,
}

impl StageDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            after: None,
            gated: false,
            retry_policy: None,
            executor: None,
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.after = Some(stage.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_executor(mut self, executor: ExecutorSpec) -> Self {
        self.executor = Some(executor);
        self
    }
}

/// Executor configuration
///
/// ```yaml
/// executor:
///   type: command
///   program: ./bin/screen
///   args: ["--batch", "50"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Local subprocess speaking JSON lines
    Command {
        program: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        env: HashMap<String, String>,

        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },

    /// Webhook of an external workflow engine
    Http {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,

        #[serde(default = "default_timeout_seconds")]
        timeout_seconds: u64,
    },
}

fn default_timeout_seconds() -> u64 {
    300
}
