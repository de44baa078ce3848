//! Core job model: identifiers, submissions, execution states, and the
//! handler-facing context.
//!
//! A [`Job`] is a unit of work: a handler identifier plus opaque serialized
//! arguments, routed through a named queue. The engine never interprets the
//! arguments; it only moves the job through its execution states and hands
//! the payload to whatever handler is registered for the job's `class_id`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FlywheelError, Result};

/// Upper bound on queue name length accepted at submission.
pub const MAX_QUEUE_NAME_LEN: usize = 255;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
///
/// Ids are strictly increasing in submission order, which makes them the
/// fairness tie-break for equal-priority claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution State
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a job currently sits in its lifecycle.
///
/// A live job occupies exactly one of `Ready`, `Claimed`, `Blocked`, or
/// `Scheduled`. `Failed` and `Finished` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Eligible for immediate claim by any worker polling the queue.
    Ready,
    /// Owned by a specific worker process, executing now.
    Claimed,
    /// Waiting for concurrency-key capacity.
    Blocked,
    /// Waiting for a future scheduled time.
    Scheduled,
    /// Handler reported failure; awaiting operator retry or discard.
    Failed,
    /// Completed successfully; only the job row remains, with finished_at set.
    Finished,
}

impl ExecutionState {
    /// Whether this state is terminal.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Finished)
    }

    /// Stable lowercase name, used for log fields and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::Blocked => "blocked",
            Self::Scheduled => "scheduled",
            Self::Failed => "failed",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, strictly increasing in submission order.
    pub id: JobId,
    /// Target queue name.
    pub queue: String,
    /// Handler identifier; resolved through the registry at execution time.
    pub class_id: String,
    /// Opaque serialized arguments, passed through to the handler.
    pub arguments: serde_json::Value,
    /// Higher runs first; ties broken by ascending id.
    pub priority: i32,
    /// Optional caller-side correlation id, carried through logs.
    pub correlation_id: Option<String>,
    /// Optional concurrency key; jobs sharing a key share a semaphore.
    pub concurrency_key: Option<String>,
    /// Resolved semaphore capacity for the key. Present iff the key is.
    pub concurrency_limit: Option<u32>,
    /// When the job should first become eligible. None means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set on terminal success.
    pub finished_at: Option<DateTime<Utc>>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// The concurrency key and its resolved limit, when the job has one.
    pub fn concurrency(&self) -> Option<(&str, u32)> {
        match (&self.concurrency_key, self.concurrency_limit) {
            (Some(key), Some(limit)) => Some((key.as_str(), limit)),
            _ => None,
        }
    }

    /// Whether the job completed successfully.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Request
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters for submitting a job.
///
/// # Example
///
/// ```rust,ignore
/// let request = JobRequest::new("mailers", "send_welcome_email")
///     .with_args(&WelcomeEmail { user_id: 42 })?
///     .with_priority(10)
///     .with_concurrency_key("user:42");
/// let job_id = engine.submit(request).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target queue name. Must be non-empty and at most
    /// [`MAX_QUEUE_NAME_LEN`] bytes.
    pub queue: String,
    /// Handler identifier. Must be non-empty.
    pub class_id: String,
    /// Serialized arguments (defaults to null).
    pub arguments: serde_json::Value,
    /// Higher runs first. Defaults to 0.
    pub priority: i32,
    /// Run no earlier than this instant. A past instant means "due now".
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Concurrency key for semaphore-limited execution.
    pub concurrency_key: Option<String>,
    /// Override for the semaphore capacity of this key. Falls back to the
    /// engine's configured default when absent.
    pub concurrency_limit: Option<u32>,
    /// Caller-side correlation id, carried through logs and the job record.
    pub correlation_id: Option<String>,
}

impl JobRequest {
    /// Create a request with default priority and null arguments.
    pub fn new(queue: impl Into<String>, class_id: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            class_id: class_id.into(),
            arguments: serde_json::Value::Null,
            priority: 0,
            scheduled_at: None,
            concurrency_key: None,
            concurrency_limit: None,
            correlation_id: None,
        }
    }

    /// Attach typed arguments, serialized to JSON.
    pub fn with_args<T: Serialize>(mut self, args: &T) -> Result<Self> {
        self.arguments = serde_json::to_value(args)?;
        Ok(self)
    }

    /// Attach raw JSON arguments.
    pub fn with_args_value(mut self, args: serde_json::Value) -> Self {
        self.arguments = args;
        self
    }

    /// Set the priority (higher runs first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Defer the job until the given instant.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Limit concurrency for jobs sharing this key.
    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    /// Override the semaphore capacity for this job's key.
    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Validate submission constraints.
    ///
    /// Queue and class identifiers are checked here, synchronously, so a
    /// malformed submission never reaches the store. A `scheduled_at` in the
    /// past is deliberately *not* an error; it means "due immediately".
    pub fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(FlywheelError::validation("queue name must not be empty"));
        }
        if self.queue.len() > MAX_QUEUE_NAME_LEN {
            return Err(FlywheelError::validation(format!(
                "queue name exceeds {} bytes",
                MAX_QUEUE_NAME_LEN
            )));
        }
        if self.class_id.trim().is_empty() {
            return Err(FlywheelError::validation("class_id must not be empty"));
        }
        if let Some(key) = &self.concurrency_key {
            if key.is_empty() {
                return Err(FlywheelError::validation(
                    "concurrency key must not be empty when present",
                ));
            }
        }
        if self.concurrency_limit == Some(0) {
            return Err(FlywheelError::validation(
                "concurrency limit must be at least 1",
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Error
// ═══════════════════════════════════════════════════════════════════════════════

/// A handler-reported failure, persisted on the FailedExecution record.
///
/// This is the only "job-level" error in the system. It carries a
/// classification code and a retryable hint for external retry policy; the
/// core itself never retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Human-readable error message.
    pub message: String,
    /// Optional classification code (e.g. "timeout", "panic").
    pub code: Option<String>,
    /// Whether external retry logic may reasonably resubmit.
    pub retryable: bool,
    /// Additional structured context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ExecutionError {
    /// Create a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
            context: HashMap::new(),
        }
    }

    /// Create a fatal (non-retryable) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
            context: HashMap::new(),
        }
    }

    /// Create an error recording a handler panic.
    pub fn panicked(detail: impl Into<String>) -> Self {
        Self::fatal(detail).with_code("panic")
    }

    /// Attach a classification code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Whether external retry logic may reasonably resubmit.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<anyhow::Error> for ExecutionError {
    fn from(error: anyhow::Error) -> Self {
        // Preserve the full chain; treat plain anyhow errors as fatal since
        // the handler gave no retryability hint.
        Self::fatal(format!("{:#}", error))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-execution context handed to handlers alongside their arguments.
///
/// Carries identity for structured logging and a cancellation token that
/// trips on engine shutdown. Handlers are free to ignore the token; a job
/// that keeps running simply delays the drain.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The executing job's id.
    pub job_id: JobId,
    /// The queue the job was claimed from.
    pub queue: String,
    /// The handler identifier.
    pub class_id: String,
    /// Caller-side correlation id, if the submission carried one.
    pub correlation_id: Option<String>,
    /// When the claim happened.
    pub claimed_at: DateTime<Utc>,
    cancellation: CancellationToken,
}

impl JobContext {
    /// Build a context for one execution.
    pub fn new(job: &Job, claimed_at: DateTime<Utc>, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            class_id: job.class_id.clone(),
            correlation_id: job.correlation_id.clone(),
            claimed_at,
            cancellation,
        }
    }

    /// Whether engine shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when engine shutdown is requested. Long-running handlers can
    /// `select!` on this to stop at a safe point.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Log an info message tagged with this job's identity.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            queue = %self.queue,
            class_id = %self.class_id,
            correlation_id = ?self.correlation_id,
            "{}",
            message
        );
    }

    /// Log a warning tagged with this job's identity.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            queue = %self.queue,
            class_id = %self.class_id,
            correlation_id = ?self.correlation_id,
            "{}",
            message
        );
    }

    /// Log an error tagged with this job's identity.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job_id,
            queue = %self.queue,
            class_id = %self.class_id,
            correlation_id = ?self.correlation_id,
            "{}",
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_display_and_ordering() {
        let a = JobId(1);
        let b = JobId(2);
        assert_eq!(a.to_string(), "1");
        assert!(a < b);
        assert_eq!(JobId::from(5), JobId(5));
    }

    #[test]
    fn test_execution_state_terminality() {
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Finished.is_terminal());
        assert!(!ExecutionState::Ready.is_terminal());
        assert!(!ExecutionState::Claimed.is_terminal());
        assert_eq!(ExecutionState::Blocked.as_str(), "blocked");
    }

    #[test]
    fn test_request_defaults() {
        let req = JobRequest::new("default", "noop");
        assert_eq!(req.priority, 0);
        assert!(req.scheduled_at.is_none());
        assert!(req.concurrency_key.is_none());
        assert_eq!(req.arguments, serde_json::Value::Null);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_request_builders() {
        #[derive(Serialize)]
        struct Args {
            user_id: u64,
        }

        let req = JobRequest::new("mailers", "send_email")
            .with_args(&Args { user_id: 42 })
            .unwrap()
            .with_priority(10)
            .with_concurrency_key("user:42")
            .with_concurrency_limit(2)
            .with_correlation_id("req-abc");

        assert_eq!(req.priority, 10);
        assert_eq!(req.arguments["user_id"], 42);
        assert_eq!(req.concurrency_key.as_deref(), Some("user:42"));
        assert_eq!(req.concurrency_limit, Some(2));
        assert_eq!(req.correlation_id.as_deref(), Some("req-abc"));
    }

    #[test]
    fn test_validation_rejects_empty_queue() {
        let req = JobRequest::new("", "noop");
        let err = req.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_validation_rejects_overlong_queue() {
        let req = JobRequest::new("q".repeat(MAX_QUEUE_NAME_LEN + 1), "noop");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_class() {
        let req = JobRequest::new("default", "  ");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_limit() {
        let req = JobRequest::new("default", "noop")
            .with_concurrency_key("k")
            .with_concurrency_limit(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_past_schedule_is_valid() {
        let req = JobRequest::new("default", "noop")
            .schedule_at(Utc::now() - chrono::Duration::hours(1));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_execution_error_builders() {
        let err = ExecutionError::retryable("connection reset")
            .with_code("network")
            .with_context("attempt", 3);

        assert!(err.is_retryable());
        assert_eq!(err.code.as_deref(), Some("network"));
        assert_eq!(err.context["attempt"], 3);
        assert_eq!(err.to_string(), "[network] connection reset");
    }

    #[test]
    fn test_execution_error_from_anyhow() {
        let source = anyhow::anyhow!("inner").context("outer");
        let err: ExecutionError = source.into();
        assert!(!err.is_retryable());
        assert!(err.message.contains("outer"));
        assert!(err.message.contains("inner"));
    }

    #[test]
    fn test_panicked_constructor() {
        let err = ExecutionError::panicked("index out of bounds");
        assert_eq!(err.code.as_deref(), Some("panic"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_job_concurrency_accessor() {
        let job = Job {
            id: JobId(1),
            queue: "default".into(),
            class_id: "noop".into(),
            arguments: serde_json::Value::Null,
            priority: 0,
            correlation_id: None,
            concurrency_key: Some("user:1".into()),
            concurrency_limit: Some(3),
            scheduled_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(job.concurrency(), Some(("user:1", 3)));
        assert!(!job.is_finished());
    }
}
