//! Webhook stage executor.
//!
//! POSTs the stage context as JSON to a workflow-engine webhook and reads
//! back `{"progress": {...}, "output": ...}`. Both fields are optional; a
//! body without either is taken as the output itself.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::core::{
    CancelSignal, ExecutionError, ProgressReporter, StageContext, StageExecutor, StageOutput,
};

use super::ProgressMessage;

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    progress: Option<ProgressMessage>,

    #[serde(default)]
    output: Option<serde_json::Value>,
}

/// Stage executor calling an HTTP endpoint
pub struct HttpExecutor {
    url: String,
    headers: HashMap<String, String>,
    client: Client,
}

impl HttpExecutor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            url: url.into(),
            headers: HashMap::new(),
            client,
        })
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, ctx: &StageContext) -> Result<serde_json::Value, ExecutionError> {
        let mut request = self.client.post(&self.url).json(ctx);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::http(
                status.as_u16(),
                format!("{} returned {}: {}", self.url, status, truncate(&body, 500)),
            ));
        }

        let body = response.text().await.map_err(request_error)?;
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| {
            ExecutionError::permanent(format!("{} returned invalid JSON: {}", self.url, e))
        })
    }
}

#[async_trait]
impl StageExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(
        &self,
        ctx: StageContext,
        progress: &ProgressReporter,
        cancel: &CancelSignal,
    ) -> Result<StageOutput, ExecutionError> {
        debug!(url = %self.url, attempt = ctx.attempt, "Calling stage webhook");

        let body = tokio::select! {
            body = self.call(&ctx) => body?,
            _ = cancel.cancelled() => return Err(ExecutionError::cancelled()),
        };

        let (report, output) = split_response(body);
        if let Some(report) = report {
            report.forward(progress).await?;
        }

        Ok(StageOutput { output })
    }
}

/// Separate a progress report from the output in a webhook body
fn split_response(
    body: serde_json::Value,
) -> (Option<ProgressMessage>, Option<serde_json::Value>) {
    if body.is_null() {
        return (None, None);
    }

    let is_envelope = body
        .as_object()
        .map(|obj| obj.contains_key("progress") || obj.contains_key("output"))
        .unwrap_or(false);

    if !is_envelope {
        return (None, Some(body));
    }

    match serde_json::from_value::<WebhookResponse>(body.clone()) {
        Ok(parsed) => (parsed.progress, parsed.output),
        Err(_) => (None, Some(body)),
    }
}

/// Connection failures and timeouts are worth retrying
fn request_error(err: reqwest::Error) -> ExecutionError {
    if err.is_timeout() || err.is_connect() {
        ExecutionError::transient(err.to_string())
    } else {
        ExecutionError::new(err.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
