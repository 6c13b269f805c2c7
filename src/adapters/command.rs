//! Subprocess stage executor.
//!
//! The stage context is written to the child's stdin as one JSON document.
//! The child reports on stdout, one JSON object per line:
//!
//! ```text
//! {"progress": {"items_processed": 50, "last_processed_id": "rec-50", "checkpoint_data": {...}}}
//! {"output": {...}}
//! ```
//!
//! Non-JSON lines are ignored. Exit code 75 (EX_TEMPFAIL) marks the failure
//! as transient; other non-zero codes are left to the retry policy.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{
    CancelSignal, ExecutionError, ProgressReporter, StageContext, StageExecutor, StageOutput,
};

use super::ProgressMessage;

/// Exit code a child uses to ask for a retry
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Debug, Deserialize)]
struct ChildMessage {
    #[serde(default)]
    progress: Option<ProgressMessage>,

    #[serde(default)]
    output: Option<serde_json::Value>,
}

/// Aborts a helper task when the run returns, whichever way it returns
struct AbortOnDrop(Option<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Stage executor running a local program
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<StageOutput, ExecutionError> {
        let input = serde_json::to_vec(&ctx)
            .map_err(|e| ExecutionError::permanent(format!("cannot encode stage context: {}", e)))?;

        // kill_on_drop: every early return below kills the child
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::permanent(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        // Written off the select loop: a child that never reads a context
        // larger than the pipe buffer must still hit the deadline
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    // The child may exit without reading its input
                    debug!(error = %e, "Could not write stage context to stdin");
                }
                // Dropping stdin signals EOF
            })
        });
        let _stdin_guard = AbortOnDrop(stdin_task);

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::permanent("child stdout not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut output = None;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => return Err(ExecutionError::new(format!("reading stdout failed: {}", e))),
                    };

                    let message: ChildMessage = match serde_json::from_str(line.trim()) {
                        Ok(message) => message,
                        Err(_) => {
                            debug!(line = %line, "Ignoring non-protocol output");
                            continue;
                        }
                    };

                    if let Some(report) = message.progress {
                        report.forward(progress).await?;
                    }
                    if message.output.is_some() {
                        output = message.output;
                    }
                }
                _ = &mut deadline => {
                    return Err(ExecutionError::transient(format!(
                        "'{}' timed out after {:?}", self.program, self.timeout
                    )));
                }
                _ = cancel.cancelled() => {
                    return Err(ExecutionError::cancelled());
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| ExecutionError::new(format!("waiting for '{}' failed: {}", self.program, e)))?,
            _ = &mut deadline => {
                return Err(ExecutionError::transient(format!(
                    "'{}' timed out after {:?}", self.program, self.timeout
                )));
            }
            _ = cancel.cancelled() => {
                return Err(ExecutionError::cancelled());
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            return Ok(StageOutput { output });
        }

        let message = match status.code() {
            Some(code) => format!(
                "'{}' exited with code {}: {}",
                self.program,
                code,
                stderr.trim()
            ),
            None => format!("'{}' terminated by signal: {}", self.program, stderr.trim()),
        };

        match status.code() {
            Some(EXIT_TEMPFAIL) => Err(ExecutionError::transient(message)),
            _ => Err(ExecutionError::new(message)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{CancelHandle, CheckpointStore, ErrorClass, SqliteStore};
    use crate::domain::{AuditContext, NewCheckpoint, ProgressUpdate, WorkflowState};
    use std::sync::Arc;

    async fn setup() -> (Arc<dyn CheckpointStore>, WorkflowState) {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state = store
            .create_or_resume(
                NewCheckpoint::new("U1", "search", "exec-1").with_items_total(Some(10)),
                &AuditContext::system("test"),
            )
            .await
            .unwrap()
            .state;
        (store, state)
    }

    /// A checkpoint whose context is far larger than a pipe buffer
    async fn large_context(store: &Arc<dyn CheckpointStore>, state: &WorkflowState) -> StageContext {
        let blob = "x".repeat(512 * 1024);
        let state = store
            .record_progress(
                state.id,
                ProgressUpdate::new(1).with_data(serde_json::json!({ "blob": blob })),
                &AuditContext::system("test"),
            )
            .await
            .unwrap();
        StageContext::from_state(&state, 0)
    }

    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_progress_lines_and_output() {
        let (store, state) = setup().await;
        let reporter = ProgressReporter::new(store.clone(), &state);
        let executor = shell(
            r#"cat > /dev/null
echo 'starting'
echo '{"progress":{"items_processed":4,"last_processed_id":"rec-4","checkpoint_data":{"page":2}}}'
echo '{"output":{"found":4}}'"#,
        );

        let result = executor
            .run(StageContext::from_state(&state, 0), &reporter, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.output, Some(serde_json::json!({ "found": 4 })));
        let stored = store.get(state.id).await.unwrap().unwrap();
        assert_eq!(stored.items_processed, 4);
        assert_eq!(stored.last_processed_id.as_deref(), Some("rec-4"));
        assert_eq!(stored.checkpoint_data, Some(serde_json::json!({ "page": 2 })));
    }

    #[tokio::test]
    async fn test_tempfail_exit_is_transient() {
        let (store, state) = setup().await;
        let reporter = ProgressReporter::new(store, &state);

        let err = shell("echo 'upstream busy' >&2; exit 75")
            .run(StageContext::from_state(&state, 0), &reporter, &CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(err.hint, Some(ErrorClass::Transient));
        assert!(err.message.contains("upstream busy"));
    }

    #[tokio::test]
    async fn test_other_exit_is_unclassified() {
        let (store, state) = setup().await;
        let reporter = ProgressReporter::new(store, &state);

        let err = shell("exit 2")
            .run(StageContext::from_state(&state, 0), &reporter, &CancelSignal::never())
            .await
            .unwrap_err();

        assert!(err.hint.is_none());
        assert!(err.message.contains("code 2"));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (store, state) = setup().await;
        let reporter = ProgressReporter::new(store, &state);

        let err = shell("sleep 5")
            .with_timeout(Duration::from_millis(100))
            .run(StageContext::from_state(&state, 0), &reporter, &CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(err.hint, Some(ErrorClass::Transient));
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_applies_while_child_ignores_stdin() {
        let (store, state) = setup().await;
        let ctx = large_context(&store, &state).await;
        let reporter = ProgressReporter::new(store, &state);

        let started = std::time::Instant::now();
        let err = shell("sleep 3")
            .with_timeout(Duration::from_millis(100))
            .run(ctx, &reporter, &CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(err.hint, Some(ErrorClass::Transient));
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_cancel_applies_while_child_ignores_stdin() {
        let (store, state) = setup().await;
        let ctx = large_context(&store, &state).await;
        let reporter = ProgressReporter::new(store, &state);
        let (handle, signal) = CancelHandle::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = std::time::Instant::now();
        let err = shell("sleep 3")
            .run(ctx, &reporter, &signal)
            .await
            .unwrap_err();

        assert!(err.cancelled);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_cancel_stops_child() {
        let (store, state) = setup().await;
        let reporter = ProgressReporter::new(store, &state);
        let (handle, signal) = CancelHandle::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let err = shell("sleep 5")
            .run(StageContext::from_state(&state, 0), &reporter, &signal)
            .await
            .unwrap_err();

        assert!(err.cancelled);
    }
}
