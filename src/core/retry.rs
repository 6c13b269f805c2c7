//! Retry policy for failed stage attempts.
//!
//! Pure computation: classification of a failure as transient or
//! permanent, and the bounded exponential backoff between attempts.
//! Sleeping is delegated to an injected `Sleeper` so tests never wait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::executor::ExecutionError;

/// Classification of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected to succeed on retry (network, rate limit, 5xx)
    Transient,

    /// Retrying cannot fix it (validation, auth, malformed input)
    Permanent,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for a stage.
///
/// The attempt budget belongs to one invocation. A stage paused mid-backoff
/// and invoked again starts from attempt 0, while the checkpoint's
/// `error_count` keeps counting, so a row that fails across several
/// invocations can record more than `max_retries + 1` errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` attempts per invocation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound on any delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// HTTP statuses treated as transient
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,

    /// Case-insensitive message fragments treated as transient
    #[serde(default = "default_retry_on_patterns")]
    pub retry_on_patterns: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_retry_on_status() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}
fn default_retry_on_patterns() -> Vec<String> {
    [
        "connection reset",
        "connection refused",
        "broken pipe",
        "timed out",
        "timeout",
        "rate limit",
        "too many requests",
        "temporarily unavailable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            retry_on_status: default_retry_on_status(),
            retry_on_patterns: default_retry_on_patterns(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Build the predicate set described by this policy
    pub fn classifier(&self) -> ErrorClassifier {
        let statuses = self.retry_on_status.clone();
        let patterns: Vec<String> = self
            .retry_on_patterns
            .iter()
            .map(|p| p.to_lowercase())
            .collect();

        ErrorClassifier::empty()
            .with_predicate(move |err| {
                err.status_code
                    .map(|code| statuses.contains(&code))
                    .unwrap_or(false)
            })
            .with_predicate(move |err| {
                let message = err.message.to_lowercase();
                patterns.iter().any(|p| message.contains(p.as_str()))
            })
    }

    /// Classify a failure with this policy's predicates
    pub fn classify(&self, err: &ExecutionError) -> ErrorClass {
        self.classifier().classify(err)
    }

    /// Whether attempt `attempt` (zero-based) may be followed by another
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class == ErrorClass::Transient && attempt < self.max_retries
    }

    /// Jittered delay before the retry that follows `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        next_delay(
            attempt,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// `min(base * 2^attempt + jitter, max)` with jitter drawn from
/// `[0, 0.25 * base * 2^attempt]`
pub fn next_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..=1.0);
    next_delay_with_jitter(attempt, base, max, fraction)
}

/// Deterministic form of [`next_delay`]; `jitter_fraction` is clamped to `[0, 1]`
pub fn next_delay_with_jitter(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter_fraction: f64,
) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;

    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let fraction = jitter_fraction.clamp(0.0, 1.0);
    let jitter = (exponential as f64 * 0.25 * fraction) as u64;

    Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
}

/// Predicate over a failure; any match means transient
pub type ErrorPredicate = Arc<dyn Fn(&ExecutionError) -> bool + Send + Sync>;

/// Pluggable predicate set for transient/permanent classification
#[derive(Clone, Default)]
pub struct ErrorClassifier {
    predicates: Vec<ErrorPredicate>,
}

impl ErrorClassifier {
    /// A classifier that treats everything as permanent
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ExecutionError) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn extend(mut self, predicates: impl IntoIterator<Item = ErrorPredicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    /// Executor hints win over predicates
    pub fn classify(&self, err: &ExecutionError) -> ErrorClass {
        if let Some(hint) = err.hint {
            return hint;
        }

        if self.predicates.iter().any(|p| p(err)) {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// Injected sleep used between retries
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
